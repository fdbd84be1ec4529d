//! The built-in table: global functions plus member methods on the built-in
//! value types. Built once per [`Runtime`](crate::runtime::Runtime).

use std::{sync::Arc, time::Duration};

use indexmap::IndexMap;
use tracing::trace;

use crate::{
    diagnostics::{CodeError, ErrorKind, EvalResult, Unwind},
    native::{CallContext, NativeFunction, RegistrationError, Signature},
    runtime::Interpreter,
    threads::ThreadManager,
    value::{Value, ValueKind, ValueType},
};

type NativeFn = fn(&mut CallContext<'_>, Option<&Value>, Vec<Value>) -> EvalResult<Value>;

pub struct Builtins {
    globals: IndexMap<String, Value>,
    members: IndexMap<(ValueType, String), Arc<NativeFunction>>,
}

impl Builtins {
    /// The standard table extended with host natives. A host native may not
    /// reuse a standard name.
    pub fn standard(extra: Vec<NativeFunction>) -> Result<Self, RegistrationError> {
        let mut builtins = Self {
            globals: IndexMap::new(),
            members: IndexMap::new(),
        };
        builtins.install_globals()?;
        builtins.install_members()?;
        for native in extra {
            builtins.insert_global(native)?;
        }
        trace!(
            globals = builtins.globals.len(),
            members = builtins.members.len(),
            "built-in table ready"
        );
        Ok(builtins)
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.globals.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.globals.keys().map(String::as_str)
    }

    /// Member method for a receiver of type `ty`, searching up the type
    /// hierarchy.
    pub fn member(&self, ty: ValueType, name: &str) -> Option<Arc<NativeFunction>> {
        let mut current = Some(ty);
        while let Some(ty) = current {
            if let Some(native) = self.members.get(&(ty, name.to_string())) {
                return Some(Arc::clone(native));
            }
            current = ty.parent();
        }
        None
    }

    fn insert_global(&mut self, native: NativeFunction) -> Result<(), RegistrationError> {
        let name = native.name().to_string();
        if self.globals.contains_key(&name) {
            return Err(RegistrationError::Duplicate(name));
        }
        self.globals.insert(name, Value::native(Arc::new(native)));
        Ok(())
    }

    fn global(&mut self, name: &str, signature: Signature, f: NativeFn) -> Result<(), RegistrationError> {
        self.insert_global(NativeFunction::new(name, signature, f)?)
    }

    fn method(
        &mut self,
        ty: ValueType,
        name: &str,
        signature: Signature,
        f: NativeFn,
    ) -> Result<(), RegistrationError> {
        let native = NativeFunction::new(name, signature, f)?;
        if self
            .members
            .insert((ty, name.to_string()), Arc::new(native))
            .is_some()
        {
            return Err(RegistrationError::Duplicate(format!("{ty}.{name}")));
        }
        Ok(())
    }

    fn install_globals(&mut self) -> Result<(), RegistrationError> {
        let none = || Signature::new(Vec::<&str>::new());
        self.global("print", none().variadic("Any").returns("Null"), io_print)?;
        self.global("println", none().variadic("Any").returns("Null"), io_println)?;
        self.global("debug", none().variadic("Any").returns("Null"), io_debug)?;
        self.global("str", Signature::new(["Any"]).returns("String"), to_str)?;
        self.global("len", Signature::new(["Any"]).returns("Number"), len)?;
        self.global("type", Signature::new(["Any"]).returns("String"), type_of)?;
        self.global("list", none().variadic("Any").returns("List"), make_list)?;
        self.global("set", none().variadic("Any").returns("Set"), make_set)?;
        self.global("range", Signature::new(["Number", "Number"]).returns("List"), range)?;
        self.global("sqrt", Signature::new(["Number"]).returns("Number"), math_sqrt)?;
        self.global("floor", Signature::new(["Number"]).returns("Number"), math_floor)?;
        self.global("abs", Signature::new(["Number"]).returns("Number"), math_abs)?;
        self.global("sleep", Signature::new(["Number"]).returns("Null"), sleep)?;
        self.global(
            "setTimeout",
            Signature::new(["Function", "Number"]).returns("Null"),
            set_timeout,
        )?;
        self.global("runAsync", Signature::new(["Function"]).returns("Null"), run_async)?;
        self.global("onShutdown", Signature::new(["Function"]).returns("Null"), on_shutdown)?;
        self.global("attempt", Signature::new(["Function"]), attempt)?;
        self.global("error", Signature::new(["Any"]), raise)?;
        self.global("exit", none(), exit)?;
        self.global("interrupted", none().returns("Boolean"), interrupted)?;
        Ok(())
    }

    fn install_members(&mut self) -> Result<(), RegistrationError> {
        use ValueType::{Error, List, Map, Set, String};

        self.method(List, "add", Signature::new(["Any"]).returns("Null"), list_add)?;
        self.method(List, "get", Signature::new(["Number"]), list_get)?;
        self.method(List, "set", Signature::new(["Number", "Any"]).returns("Null"), list_set)?;
        self.method(List, "size", Signature::new(Vec::<&str>::new()).returns("Number"), size)?;
        self.method(List, "remove", Signature::new(["Number"]), list_remove)?;
        self.method(List, "contains", Signature::new(["Any"]).returns("Boolean"), contains)?;

        self.method(Map, "put", Signature::new(["Any", "Any"]).returns("Null"), map_put)?;
        self.method(Map, "get", Signature::new(["Any"]), map_get)?;
        self.method(Map, "containsKey", Signature::new(["Any"]).returns("Boolean"), contains)?;
        self.method(Map, "remove", Signature::new(["Any"]), map_remove)?;
        self.method(Map, "keys", Signature::new(Vec::<&str>::new()).returns("List"), map_keys)?;
        self.method(Map, "size", Signature::new(Vec::<&str>::new()).returns("Number"), size)?;

        self.method(Set, "add", Signature::new(["Any"]).returns("Boolean"), set_add)?;
        self.method(Set, "contains", Signature::new(["Any"]).returns("Boolean"), contains)?;
        self.method(Set, "remove", Signature::new(["Any"]).returns("Boolean"), set_remove)?;
        self.method(Set, "size", Signature::new(Vec::<&str>::new()).returns("Number"), size)?;

        self.method(String, "length", Signature::new(Vec::<&str>::new()).returns("Number"), size)?;
        self.method(String, "upper", Signature::new(Vec::<&str>::new()).returns("String"), string_upper)?;
        self.method(String, "lower", Signature::new(Vec::<&str>::new()).returns("String"), string_lower)?;
        self.method(
            String,
            "substring",
            Signature::new(["Number", "Number"]).returns("String"),
            string_substring,
        )?;
        self.method(String, "split", Signature::new(["String"]).returns("List"), string_split)?;
        self.method(String, "contains", Signature::new(["String"]).returns("Boolean"), contains)?;

        self.method(Error, "kind", Signature::new(Vec::<&str>::new()).returns("String"), error_kind)?;
        self.method(Error, "message", Signature::new(Vec::<&str>::new()).returns("String"), error_message)?;
        Ok(())
    }
}

fn join_args(args: &[Value]) -> String {
    args.iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

fn io_print(cx: &mut CallContext<'_>, _: Option<&Value>, args: Vec<Value>) -> EvalResult<Value> {
    cx.output().write(&join_args(&args));
    Ok(Value::null())
}

fn io_println(cx: &mut CallContext<'_>, _: Option<&Value>, args: Vec<Value>) -> EvalResult<Value> {
    cx.output().write_line(&join_args(&args));
    Ok(Value::null())
}

fn io_debug(cx: &mut CallContext<'_>, _: Option<&Value>, args: Vec<Value>) -> EvalResult<Value> {
    cx.output().debug(&join_args(&args));
    Ok(Value::null())
}

fn to_str(_: &mut CallContext<'_>, _: Option<&Value>, args: Vec<Value>) -> EvalResult<Value> {
    Ok(Value::string(args[0].to_string()))
}

fn len(cx: &mut CallContext<'_>, _: Option<&Value>, args: Vec<Value>) -> EvalResult<Value> {
    length_of(cx, &args[0])
}

fn length_of(cx: &CallContext<'_>, value: &Value) -> EvalResult<Value> {
    let len = match value.kind() {
        ValueKind::String(text) => text.chars().count(),
        ValueKind::List(items) => items.read().len(),
        ValueKind::Map(entries) => entries.read().len(),
        ValueKind::Set(items) => items.read().len(),
        _ => {
            return Err(cx
                .error(
                    ErrorKind::IllegalOperation,
                    format!("{} has no length", value.repr()),
                )
                .into());
        }
    };
    Ok(Value::number(len as f64))
}

fn type_of(_: &mut CallContext<'_>, _: Option<&Value>, args: Vec<Value>) -> EvalResult<Value> {
    Ok(Value::string(args[0].runtime_type_name()))
}

fn make_list(_: &mut CallContext<'_>, _: Option<&Value>, args: Vec<Value>) -> EvalResult<Value> {
    Ok(Value::list(args))
}

fn make_set(_: &mut CallContext<'_>, _: Option<&Value>, args: Vec<Value>) -> EvalResult<Value> {
    Ok(Value::set(args.into_iter().collect()))
}

fn range(cx: &mut CallContext<'_>, _: Option<&Value>, args: Vec<Value>) -> EvalResult<Value> {
    let start = whole_number(cx, &args[0])?;
    let end = whole_number(cx, &args[1])?;
    let step = if start <= end { 1 } else { -1 };
    let mut items = Vec::new();
    let mut current = start;
    while current != end {
        items.push(Value::number(current as f64));
        current += step;
    }
    Ok(Value::list(items))
}

fn math_sqrt(cx: &mut CallContext<'_>, _: Option<&Value>, args: Vec<Value>) -> EvalResult<Value> {
    let n = number(&args[0]);
    if n < 0.0 {
        return Err(cx
            .error(ErrorKind::Runtime, "cannot take the square root of a negative number")
            .into());
    }
    Ok(Value::number(n.sqrt()))
}

fn math_floor(_: &mut CallContext<'_>, _: Option<&Value>, args: Vec<Value>) -> EvalResult<Value> {
    Ok(Value::number(number(&args[0]).floor()))
}

fn math_abs(_: &mut CallContext<'_>, _: Option<&Value>, args: Vec<Value>) -> EvalResult<Value> {
    Ok(Value::number(number(&args[0]).abs()))
}

fn sleep(cx: &mut CallContext<'_>, _: Option<&Value>, args: Vec<Value>) -> EvalResult<Value> {
    let millis = number(&args[0]);
    if millis < 0.0 {
        return Err(cx
            .error(ErrorKind::Runtime, "sleep duration must not be negative")
            .into());
    }
    cx.token()
        .sleep(Duration::from_millis(millis as u64))
        .map_err(|err| err.with_span(cx.span().clone()))?;
    Ok(Value::null())
}

fn manager_of(cx: &CallContext<'_>, name: &str) -> EvalResult<ThreadManager> {
    cx.context().manager().ok_or_else(|| {
        cx.error(
            ErrorKind::Runtime,
            format!("`{name}` requires a program started by a thread manager"),
        )
        .into()
    })
}

/// Builds the job body shared by `setTimeout` and `runAsync`: a fresh
/// interpreter on the async thread calling `callee` with no arguments.
fn async_call(
    cx: &CallContext<'_>,
    callee: Value,
    delay: Option<Duration>,
) -> impl FnOnce(&crate::threads::CancellationToken) -> Result<(), CodeError> + Send + 'static {
    let context = cx.context().clone();
    let display_name = format!("{}/async", cx.display_name());
    let span = cx.span().clone();
    move |token| {
        if let Some(delay) = delay {
            token.sleep(delay)?;
        }
        let mut interpreter = Interpreter::with_token(context, &display_name, token.clone());
        interpreter
            .call_value(&callee, Vec::new(), &span)
            .map(|_| ())
            .map_err(Unwind::into_error)
    }
}

fn set_timeout(cx: &mut CallContext<'_>, _: Option<&Value>, args: Vec<Value>) -> EvalResult<Value> {
    let manager = manager_of(cx, "setTimeout")?;
    let delay = Duration::from_millis(number(&args[1]).max(0.0) as u64);
    let job = async_call(cx, args[0].clone(), Some(delay));
    manager
        .spawn_async(cx.output(), "timer", job)
        .map_err(|err| cx.error(ErrorKind::Runtime, err.to_string()))?;
    Ok(Value::null())
}

fn run_async(cx: &mut CallContext<'_>, _: Option<&Value>, args: Vec<Value>) -> EvalResult<Value> {
    let manager = manager_of(cx, "runAsync")?;
    let job = async_call(cx, args[0].clone(), None);
    manager
        .submit(cx.output(), "async", job)
        .map_err(|err| cx.error(ErrorKind::Runtime, err.to_string()))?;
    Ok(Value::null())
}

fn on_shutdown(cx: &mut CallContext<'_>, _: Option<&Value>, args: Vec<Value>) -> EvalResult<Value> {
    let manager = manager_of(cx, "onShutdown")?;
    let context = cx.context().clone();
    let display_name = format!("{}/shutdown", cx.display_name());
    let span = cx.span().clone();
    let callee = args[0].clone();
    manager.add_shutdown_callback(move || {
        let output = Arc::clone(context.output());
        let mut interpreter = Interpreter::new(context, &display_name);
        if let Err(unwind) = interpreter.call_value(&callee, Vec::new(), &span) {
            let err = unwind.into_error();
            if !err.is_silent() {
                output.write_error(&err.render(output.format()));
            }
        }
    });
    Ok(Value::null())
}

fn attempt(cx: &mut CallContext<'_>, _: Option<&Value>, args: Vec<Value>) -> EvalResult<Value> {
    match cx.call(&args[0], Vec::new()) {
        Err(Unwind::Error(err)) if !err.is_silent() => Ok(Value::error(err)),
        other => other,
    }
}

fn raise(cx: &mut CallContext<'_>, _: Option<&Value>, args: Vec<Value>) -> EvalResult<Value> {
    Err(cx.error(ErrorKind::Runtime, args[0].to_string()).into())
}

fn exit(_: &mut CallContext<'_>, _: Option<&Value>, _: Vec<Value>) -> EvalResult<Value> {
    Err(CodeError::stop().into())
}

fn interrupted(cx: &mut CallContext<'_>, _: Option<&Value>, _: Vec<Value>) -> EvalResult<Value> {
    if cx.token().is_cancelled() {
        return Err(CodeError::interrupted().with_span(cx.span().clone()).into());
    }
    Ok(Value::bool(false))
}

fn number(value: &Value) -> f64 {
    value.as_number().unwrap_or(f64::NAN)
}

fn whole_number(cx: &CallContext<'_>, value: &Value) -> EvalResult<i64> {
    let n = number(value);
    if n.fract() != 0.0 || !n.is_finite() {
        return Err(cx
            .error(
                ErrorKind::IllegalOperation,
                format!("expected a whole number, got {}", value.repr()),
            )
            .into());
    }
    Ok(n as i64)
}

fn position(cx: &CallContext<'_>, value: &Value, len: usize) -> EvalResult<usize> {
    let index = whole_number(cx, value)?;
    if index < 0 || index as usize >= len {
        return Err(cx
            .error(
                ErrorKind::Runtime,
                format!("index {index} out of bounds for length {len}"),
            )
            .into());
    }
    Ok(index as usize)
}

fn receiver<'v>(cx: &CallContext<'_>, receiver: Option<&'v Value>) -> EvalResult<&'v Value> {
    receiver.ok_or_else(|| {
        cx.error(ErrorKind::IllegalOperation, "method called without a receiver")
            .into()
    })
}

fn size(cx: &mut CallContext<'_>, this: Option<&Value>, _: Vec<Value>) -> EvalResult<Value> {
    let this = receiver(cx, this)?;
    length_of(cx, this)
}

fn contains(cx: &mut CallContext<'_>, this: Option<&Value>, args: Vec<Value>) -> EvalResult<Value> {
    let this = receiver(cx, this)?;
    let needle = &args[0];
    let found = match this.kind() {
        ValueKind::List(items) => items.read().iter().any(|item| item.equals(needle)),
        ValueKind::Map(entries) => entries.read().contains_key(needle),
        ValueKind::Set(items) => items.read().contains(needle),
        ValueKind::String(text) => needle.as_str().is_some_and(|part| text.contains(part)),
        _ => false,
    };
    Ok(Value::bool(found))
}

fn list_add(cx: &mut CallContext<'_>, this: Option<&Value>, mut args: Vec<Value>) -> EvalResult<Value> {
    if let ValueKind::List(items) = receiver(cx, this)?.kind() {
        items.write().push(args.remove(0));
    }
    Ok(Value::null())
}

fn list_get(cx: &mut CallContext<'_>, this: Option<&Value>, args: Vec<Value>) -> EvalResult<Value> {
    match receiver(cx, this)?.kind() {
        ValueKind::List(items) => {
            let items = items.read();
            let index = position(cx, &args[0], items.len())?;
            Ok(items[index].clone())
        }
        _ => Ok(Value::null()),
    }
}

fn list_set(cx: &mut CallContext<'_>, this: Option<&Value>, args: Vec<Value>) -> EvalResult<Value> {
    if let ValueKind::List(items) = receiver(cx, this)?.kind() {
        let mut items = items.write();
        let index = position(cx, &args[0], items.len())?;
        items[index] = args[1].clone();
    }
    Ok(Value::null())
}

fn list_remove(cx: &mut CallContext<'_>, this: Option<&Value>, args: Vec<Value>) -> EvalResult<Value> {
    match receiver(cx, this)?.kind() {
        ValueKind::List(items) => {
            let mut items = items.write();
            let index = position(cx, &args[0], items.len())?;
            Ok(items.remove(index))
        }
        _ => Ok(Value::null()),
    }
}

fn map_put(cx: &mut CallContext<'_>, this: Option<&Value>, args: Vec<Value>) -> EvalResult<Value> {
    if let ValueKind::Map(entries) = receiver(cx, this)?.kind() {
        entries.write().insert(args[0].clone(), args[1].clone());
    }
    Ok(Value::null())
}

fn map_get(cx: &mut CallContext<'_>, this: Option<&Value>, args: Vec<Value>) -> EvalResult<Value> {
    Ok(match receiver(cx, this)?.kind() {
        ValueKind::Map(entries) => entries.read().get(&args[0]).cloned().unwrap_or_else(Value::null),
        _ => Value::null(),
    })
}

fn map_remove(cx: &mut CallContext<'_>, this: Option<&Value>, args: Vec<Value>) -> EvalResult<Value> {
    Ok(match receiver(cx, this)?.kind() {
        ValueKind::Map(entries) => entries
            .write()
            .shift_remove(&args[0])
            .unwrap_or_else(Value::null),
        _ => Value::null(),
    })
}

fn map_keys(cx: &mut CallContext<'_>, this: Option<&Value>, _: Vec<Value>) -> EvalResult<Value> {
    Ok(match receiver(cx, this)?.kind() {
        ValueKind::Map(entries) => Value::list(entries.read().keys().cloned().collect()),
        _ => Value::list(Vec::new()),
    })
}

fn set_add(cx: &mut CallContext<'_>, this: Option<&Value>, args: Vec<Value>) -> EvalResult<Value> {
    Ok(Value::bool(match receiver(cx, this)?.kind() {
        ValueKind::Set(items) => items.write().insert(args[0].clone()),
        _ => false,
    }))
}

fn set_remove(cx: &mut CallContext<'_>, this: Option<&Value>, args: Vec<Value>) -> EvalResult<Value> {
    Ok(Value::bool(match receiver(cx, this)?.kind() {
        ValueKind::Set(items) => items.write().shift_remove(&args[0]),
        _ => false,
    }))
}

fn text(this: &Value) -> &str {
    this.as_str().unwrap_or_default()
}

fn string_upper(cx: &mut CallContext<'_>, this: Option<&Value>, _: Vec<Value>) -> EvalResult<Value> {
    Ok(Value::string(text(receiver(cx, this)?).to_uppercase()))
}

fn string_lower(cx: &mut CallContext<'_>, this: Option<&Value>, _: Vec<Value>) -> EvalResult<Value> {
    Ok(Value::string(text(receiver(cx, this)?).to_lowercase()))
}

fn string_substring(
    cx: &mut CallContext<'_>,
    this: Option<&Value>,
    args: Vec<Value>,
) -> EvalResult<Value> {
    let chars: Vec<char> = text(receiver(cx, this)?).chars().collect();
    let start = whole_number(cx, &args[0])?;
    let end = whole_number(cx, &args[1])?;
    if start < 0 || end < start || end as usize > chars.len() {
        return Err(cx
            .error(
                ErrorKind::Runtime,
                format!(
                    "substring range {start}..{end} out of bounds for length {}",
                    chars.len()
                ),
            )
            .into());
    }
    Ok(Value::string(
        chars[start as usize..end as usize].iter().collect::<String>(),
    ))
}

fn string_split(cx: &mut CallContext<'_>, this: Option<&Value>, args: Vec<Value>) -> EvalResult<Value> {
    let this = text(receiver(cx, this)?);
    let separator = text(&args[0]);
    if separator.is_empty() {
        return Err(cx
            .error(ErrorKind::Runtime, "separator must not be empty")
            .into());
    }
    Ok(Value::list(
        this.split(separator).map(Value::string).collect(),
    ))
}

fn error_kind(cx: &mut CallContext<'_>, this: Option<&Value>, _: Vec<Value>) -> EvalResult<Value> {
    Ok(match receiver(cx, this)?.kind() {
        ValueKind::Error(err) => Value::string(err.kind.name()),
        _ => Value::null(),
    })
}

fn error_message(cx: &mut CallContext<'_>, this: Option<&Value>, _: Vec<Value>) -> EvalResult<Value> {
    Ok(match receiver(cx, this)?.kind() {
        ValueKind::Error(err) => Value::string(err.message.clone()),
        _ => Value::null(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_table_has_core_names() {
        let builtins = Builtins::standard(Vec::new()).unwrap();
        for name in ["print", "println", "len", "range", "attempt", "runAsync"] {
            assert!(builtins.contains(name), "missing {name}");
        }
        assert!(builtins.member(ValueType::List, "add").is_some());
        assert!(builtins.member(ValueType::Map, "add").is_none());
        assert!(builtins.member(ValueType::String, "upper").is_some());
    }

    #[test]
    fn host_natives_cannot_shadow_standard_names() {
        fn noop(_: &mut CallContext<'_>, _: Option<&Value>, _: Vec<Value>) -> EvalResult<Value> {
            Ok(Value::null())
        }
        let clash = NativeFunction::new("print", Signature::new(Vec::<&str>::new()), noop).unwrap();
        assert_eq!(
            Builtins::standard(vec![clash]).err(),
            Some(RegistrationError::Duplicate("print".into()))
        );
        let extra = NativeFunction::new("hostValue", Signature::new(Vec::<&str>::new()), noop).unwrap();
        let builtins = Builtins::standard(vec![extra]).unwrap();
        assert!(builtins.get("hostValue").is_some());
    }
}
