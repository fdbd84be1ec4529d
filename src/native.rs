//! Host functions callable from scripts.

use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::{
    diagnostics::{CodeError, ErrorKind, EvalResult, SourceSpan},
    output::OutputSink,
    runtime::{Context, Interpreter},
    threads::CancellationToken,
    value::{Value, ValueType},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("`{0}` is not a valid function name")]
    InvalidName(String),
    #[error("native `{function}` declares unknown type `{type_name}`")]
    UnknownType { function: String, type_name: String },
    #[error("native `{0}` cannot take a `Null` parameter")]
    NullParameter(String),
    #[error("native `{0}` is registered twice")]
    Duplicate(String),
}

/// Declared parameter and return types, by name, checked against the
/// [`ValueType`] hierarchy when the function is registered.
#[derive(Debug, Clone)]
pub struct Signature {
    params: Vec<String>,
    rest: Option<String>,
    returns: String,
}

impl Signature {
    pub fn new<I, S>(params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            params: params.into_iter().map(Into::into).collect(),
            rest: None,
            returns: ValueType::Any.name().to_string(),
        }
    }

    /// Surplus arguments must each be of `ty`.
    pub fn variadic(mut self, ty: impl Into<String>) -> Self {
        self.rest = Some(ty.into());
        self
    }

    pub fn returns(mut self, ty: impl Into<String>) -> Self {
        self.returns = ty.into();
        self
    }
}

pub trait NativeCallable: Send + Sync {
    fn call(
        &self,
        cx: &mut CallContext<'_>,
        receiver: Option<&Value>,
        args: Vec<Value>,
    ) -> EvalResult<Value>;
}

impl<F> NativeCallable for F
where
    F: Fn(&mut CallContext<'_>, Option<&Value>, Vec<Value>) -> EvalResult<Value> + Send + Sync,
{
    fn call(
        &self,
        cx: &mut CallContext<'_>,
        receiver: Option<&Value>,
        args: Vec<Value>,
    ) -> EvalResult<Value> {
        self(cx, receiver, args)
    }
}

pub struct NativeFunction {
    name: String,
    params: Vec<ValueType>,
    rest: Option<ValueType>,
    returns: ValueType,
    callable: Box<dyn NativeCallable>,
}

impl NativeFunction {
    pub fn new(
        name: impl Into<String>,
        signature: Signature,
        callable: impl NativeCallable + 'static,
    ) -> Result<Self, RegistrationError> {
        let name = name.into();
        if !is_identifier(&name) {
            return Err(RegistrationError::InvalidName(name));
        }
        let resolve = |type_name: &str| {
            ValueType::from_name(type_name).ok_or_else(|| RegistrationError::UnknownType {
                function: name.clone(),
                type_name: type_name.to_string(),
            })
        };
        let params = signature
            .params
            .iter()
            .map(|ty| resolve(ty))
            .collect::<Result<Vec<_>, _>>()?;
        let rest = signature.rest.as_deref().map(resolve).transpose()?;
        let returns = resolve(&signature.returns)?;
        if params.iter().chain(rest.iter()).any(|ty| *ty == ValueType::Null) {
            return Err(RegistrationError::NullParameter(name));
        }
        Ok(Self {
            name,
            params,
            rest,
            returns,
            callable: Box::new(callable),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn is_variadic(&self) -> bool {
        self.rest.is_some()
    }

    pub fn returns(&self) -> ValueType {
        self.returns
    }

    /// Checks arity and argument types, runs the callable, then checks the
    /// returned value against the declared return type.
    pub fn invoke(
        &self,
        cx: &mut CallContext<'_>,
        receiver: Option<&Value>,
        args: Vec<Value>,
    ) -> EvalResult<Value> {
        let expected = self.params.len();
        if args.len() > expected && self.rest.is_none() {
            return Err(cx
                .error(
                    ErrorKind::Runtime,
                    format!(
                        "too many arguments: `{}` takes {expected}, got {}",
                        self.name,
                        args.len()
                    ),
                )
                .into());
        }
        if args.len() < expected {
            return Err(cx
                .error(
                    ErrorKind::Runtime,
                    format!(
                        "too few arguments: `{}` takes {expected}, got {}",
                        self.name,
                        args.len()
                    ),
                )
                .into());
        }
        for (index, arg) in args.iter().enumerate() {
            let Some(ty) = self.params.get(index).copied().or(self.rest) else {
                continue;
            };
            if !ty.accepts(arg) {
                return Err(cx
                    .error(
                        ErrorKind::IllegalOperation,
                        format!(
                            "`{}` expects {ty} for argument {}, got {}",
                            self.name,
                            index + 1,
                            arg.repr()
                        ),
                    )
                    .into());
            }
        }
        let result = self.callable.call(cx, receiver, args)?;
        if !self.returns.accepts(&result) {
            return Err(cx
                .error(
                    ErrorKind::Runtime,
                    format!(
                        "native `{}` returned {}, declared {}",
                        self.name,
                        result.type_name(),
                        self.returns
                    ),
                )
                .into());
        }
        Ok(result)
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("rest", &self.rest)
            .field("returns", &self.returns)
            .finish()
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|ch| ch.is_ascii_alphabetic() || ch == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

/// What a native sees of the interpreter that called it.
pub struct CallContext<'a> {
    interpreter: &'a mut Interpreter,
    span: SourceSpan,
}

impl<'a> CallContext<'a> {
    pub(crate) fn new(interpreter: &'a mut Interpreter, span: SourceSpan) -> Self {
        Self { interpreter, span }
    }

    /// Span of the call expression.
    pub fn span(&self) -> &SourceSpan {
        &self.span
    }

    pub fn context(&self) -> &Context {
        self.interpreter.context()
    }

    pub fn output(&self) -> Arc<dyn OutputSink> {
        Arc::clone(self.interpreter.context().output())
    }

    pub fn token(&self) -> &CancellationToken {
        self.interpreter.token()
    }

    pub fn display_name(&self) -> Arc<str> {
        self.interpreter.display_name()
    }

    /// Calls a script value back on the same interpreter.
    pub fn call(&mut self, callee: &Value, args: Vec<Value>) -> EvalResult<Value> {
        let span = self.span.clone();
        self.interpreter.call_value(callee, args, &span)
    }

    pub fn error(&self, kind: ErrorKind, message: impl Into<String>) -> CodeError {
        CodeError::new(kind, message).with_span(self.span.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &mut CallContext<'_>, _: Option<&Value>, _: Vec<Value>) -> EvalResult<Value> {
        Ok(Value::null())
    }

    #[test]
    fn unknown_types_are_rejected_at_registration() {
        let error = NativeFunction::new("f", Signature::new(["Integer"]), noop).unwrap_err();
        assert_eq!(
            error,
            RegistrationError::UnknownType {
                function: "f".into(),
                type_name: "Integer".into()
            }
        );
        let error =
            NativeFunction::new("f", Signature::new(["Any"]).returns("Void"), noop).unwrap_err();
        assert!(matches!(error, RegistrationError::UnknownType { .. }));
    }

    #[test]
    fn null_parameters_and_bad_names_are_rejected() {
        assert_eq!(
            NativeFunction::new("f", Signature::new(["Null"]), noop).unwrap_err(),
            RegistrationError::NullParameter("f".into())
        );
        assert_eq!(
            NativeFunction::new("2x", Signature::new(Vec::<String>::new()), noop).unwrap_err(),
            RegistrationError::InvalidName("2x".into())
        );
    }

    #[test]
    fn valid_signature_resolves_types() {
        let native = NativeFunction::new(
            "join",
            Signature::new(["String"]).variadic("Any").returns("String"),
            noop,
        )
        .unwrap();
        assert_eq!(native.arity(), 1);
        assert!(native.is_variadic());
        assert_eq!(native.returns(), ValueType::String);
    }
}
