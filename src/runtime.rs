use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{
    ast::{
        BinaryOp, ClassDecl, Expr, ExprKind, FunctionDecl, Literal, LogicalOp, Program, Stmt,
        StmtKind, UnaryOp,
    },
    class::{ClassDefinition, ClassInstance, ClassRegistry},
    diagnostics::{
        CodeError, ControlSignal, ErrorKind, EvalResult, Result, SourceSpan, TraceEntry, Unwind,
    },
    environment::{Scope, ScopeRef},
    lexer::Lexer,
    native::{CallContext, NativeCallable, NativeFunction, RegistrationError, Signature},
    output::OutputSink,
    parser::{self, DeclarationScope},
    stdlib::Builtins,
    threads::{CancellationToken, ManagerError, ManagerShared, ThreadManager},
    value::{FunctionValue, Value, ValueKind},
};

const RED_ZONE: usize = 100 * 1024;
const STACK_GROWTH: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Nested calls allowed before a `maximum recursion depth` error.
    pub max_call_depth: usize,
    /// Stack size for program and worker threads.
    pub thread_stack_size: usize,
    /// Workers kept alive by the pool even when idle.
    pub pool_core_size: usize,
    /// How long a surplus pool worker may sit idle before it exits.
    pub pool_idle_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_call_depth: 1000,
            thread_stack_size: 8 * 1024 * 1024,
            pool_core_size: 1,
            pool_idle_timeout: Duration::from_secs(60),
        }
    }
}

impl RuntimeConfig {
    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    pub fn with_thread_stack_size(mut self, bytes: usize) -> Self {
        self.thread_stack_size = bytes;
        self
    }

    pub fn with_pool_core_size(mut self, workers: usize) -> Self {
        self.pool_core_size = workers;
        self
    }

    pub fn with_pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool_idle_timeout = timeout;
        self
    }
}

/// Collects host natives before the immutable built-in table is frozen.
#[derive(Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    natives: Vec<NativeFunction>,
}

impl RuntimeBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn register_native(
        mut self,
        name: &str,
        signature: Signature,
        callable: impl NativeCallable + 'static,
    ) -> std::result::Result<Self, RegistrationError> {
        self.natives
            .push(NativeFunction::new(name, signature, callable)?);
        Ok(self)
    }

    pub fn build(self) -> Result<Runtime> {
        let lexer = Lexer::new()?;
        let builtins = Builtins::standard(self.natives)?;
        debug!(
            natives = builtins.names().count(),
            max_call_depth = self.config.max_call_depth,
            "runtime initialised"
        );
        Ok(Runtime {
            inner: Arc::new(RuntimeInner {
                config: self.config,
                lexer,
                builtins,
            }),
        })
    }
}

struct RuntimeInner {
    config: RuntimeConfig,
    lexer: Lexer,
    builtins: Builtins,
}

/// Shared, immutable language services: configuration, token table and the
/// built-in function table.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn with_config(config: RuntimeConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn lexer(&self) -> &Lexer {
        &self.inner.lexer
    }

    pub fn builtins(&self) -> &Builtins {
        &self.inner.builtins
    }

    pub fn context(&self, output: Arc<dyn OutputSink>) -> Context {
        Context::new(self, output)
    }

    pub fn thread_manager(&self) -> ThreadManager {
        ThreadManager::new(self.config().clone())
    }
}

struct Owner {
    id: u64,
    manager: Weak<ManagerShared>,
}

struct ContextInner {
    runtime: Runtime,
    globals: ScopeRef,
    classes: ClassRegistry,
    output: Arc<dyn OutputSink>,
    owner: Mutex<Option<Owner>>,
}

/// Per-program state: global bindings, the class registry and the output
/// sink. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub fn new(runtime: &Runtime, output: Arc<dyn OutputSink>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                runtime: runtime.clone(),
                globals: Scope::root("<program>"),
                classes: ClassRegistry::new(),
                output,
                owner: Mutex::new(None),
            }),
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    pub fn globals(&self) -> &ScopeRef {
        &self.inner.globals
    }

    pub fn classes(&self) -> &ClassRegistry {
        &self.inner.classes
    }

    pub fn output(&self) -> &Arc<dyn OutputSink> {
        &self.inner.output
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.inner.globals.get(name)
    }

    pub fn define_global(&self, name: impl Into<String>, value: Value) {
        self.inner.globals.define(name, value);
    }

    /// Global variable and class names visible to the next compiled program.
    pub fn declared_names(&self) -> Vec<String> {
        let mut names: IndexSet<String> = self.inner.globals.names().into_iter().collect();
        names.extend(self.inner.classes.names());
        names.into_iter().collect()
    }

    pub fn compile(&self, source_name: &str, source: &str) -> std::result::Result<Program, CodeError> {
        let builtins = self.runtime().builtins();
        let mut scope = DeclarationScope::new(builtins.names());
        for name in self.declared_names() {
            scope.declare(name);
        }
        parser::parse_source(self.runtime().lexer(), source, &Arc::from(source_name), scope)
    }

    pub fn manager(&self) -> Option<ThreadManager> {
        let owner = self.inner.owner.lock();
        owner
            .as_ref()
            .and_then(|owner| owner.manager.upgrade())
            .map(ThreadManager::from_shared)
    }

    /// Binds this context to one manager for its whole lifetime.
    pub(crate) fn claim(
        &self,
        id: u64,
        manager: Weak<ManagerShared>,
    ) -> std::result::Result<(), ManagerError> {
        let mut owner = self.inner.owner.lock();
        match owner.as_ref() {
            Some(existing) if existing.id != id && existing.manager.strong_count() > 0 => {
                Err(ManagerError::ForeignContext)
            }
            Some(existing) if existing.id == id => Ok(()),
            _ => {
                *owner = Some(Owner { id, manager });
                Ok(())
            }
        }
    }
}

/// Scope and call bookkeeping; pushes and pops balance after every run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvalStats {
    pub scopes_pushed: u64,
    pub scopes_popped: u64,
    pub calls: u64,
    pub max_depth: usize,
}

pub struct Interpreter {
    context: Context,
    display_name: Arc<str>,
    scope: ScopeRef,
    depth: usize,
    stats: EvalStats,
    token: CancellationToken,
}

impl Interpreter {
    pub fn new(context: Context, display_name: &str) -> Self {
        Self::with_token(context, display_name, CancellationToken::new())
    }

    pub fn with_token(context: Context, display_name: &str, token: CancellationToken) -> Self {
        let scope = Arc::clone(context.globals());
        Self {
            context,
            display_name: Arc::from(display_name),
            scope,
            depth: 0,
            stats: EvalStats::default(),
            token,
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn display_name(&self) -> Arc<str> {
        Arc::clone(&self.display_name)
    }

    pub fn stats(&self) -> EvalStats {
        self.stats
    }

    pub fn eval_source(&mut self, source: &str) -> std::result::Result<Value, CodeError> {
        let program = self.context.compile(&self.display_name, source)?;
        self.run(&program)
    }

    /// Runs a program in the global scope. The result is the value of the
    /// final statement, or null when it produced none.
    pub fn run(&mut self, program: &Program) -> std::result::Result<Value, CodeError> {
        trace!(program = %program.source_name, statements = program.statements.len(), "run");
        let mut last = Value::null();
        for stmt in &program.statements {
            match self.execute(stmt) {
                Ok(value) => last = value.unwrap_or_else(Value::null),
                Err(unwind) => {
                    let mut error = unwind.into_error();
                    error.push_trace(self.trace_entry("<program>".into(), None));
                    return Err(error);
                }
            }
        }
        Ok(last)
    }

    /// Invokes any callable value with already evaluated arguments.
    pub fn call_value(
        &mut self,
        callee: &Value,
        args: Vec<Value>,
        span: &SourceSpan,
    ) -> EvalResult<Value> {
        match callee.kind() {
            ValueKind::Function(function) => self.call_function(function, None, args, span),
            ValueKind::Class(class) => Err(fail(
                ErrorKind::IllegalOperation,
                format!("class `{}` must be constructed with `new`", class.name),
                span,
            )),
            _ => Err(fail(
                ErrorKind::IllegalOperation,
                format!("{} is not callable", callee.repr()),
                span,
            )),
        }
    }

    fn execute(&mut self, stmt: &Stmt) -> EvalResult<Option<Value>> {
        stacker::maybe_grow(RED_ZONE, STACK_GROWTH, || self.execute_statement(stmt))
    }

    fn execute_statement(&mut self, stmt: &Stmt) -> EvalResult<Option<Value>> {
        match &stmt.kind {
            StmtKind::VarDecl { name, initializer } => {
                let value = match initializer {
                    Some(expr) => self.evaluate(expr)?,
                    None => Value::null(),
                };
                self.scope.define(name.clone(), value);
                Ok(None)
            }
            StmtKind::Function(decl) => {
                let function = FunctionValue::user(Arc::clone(decl), Arc::clone(&self.scope));
                self.scope.define(decl.name.clone(), Value::function(function));
                Ok(None)
            }
            StmtKind::Class(decl) => {
                self.declare_class(decl)?;
                Ok(None)
            }
            StmtKind::Expr(expr) => Ok(Some(self.evaluate(expr)?)),
            StmtKind::Block(items) => {
                let scope = Scope::child(&self.scope, "block", Some(stmt.span.clone()));
                self.in_scope(scope, |this| this.execute_sequence(items))
            }
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                if self.condition(condition, "if")? {
                    self.execute(then_branch)
                } else if let Some(branch) = else_branch {
                    self.execute(branch)
                } else {
                    Ok(None)
                }
            }
            StmtKind::While { condition, body } => {
                loop {
                    self.check_interrupted(&stmt.span)?;
                    if !self.condition(condition, "while")? {
                        break;
                    }
                    match self.execute(body) {
                        Ok(_) | Err(Unwind::Signal(ControlSignal::Continue(_))) => {}
                        Err(Unwind::Signal(ControlSignal::Break(_))) => break,
                        Err(other) => return Err(other),
                    }
                }
                Ok(None)
            }
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.evaluate(expr)?,
                    None => Value::null(),
                };
                Err(Unwind::Signal(ControlSignal::Return(value, stmt.span.clone())))
            }
            StmtKind::Break => Err(Unwind::Signal(ControlSignal::Break(stmt.span.clone()))),
            StmtKind::Continue => Err(Unwind::Signal(ControlSignal::Continue(stmt.span.clone()))),
        }
    }

    fn execute_sequence(&mut self, items: &[Stmt]) -> EvalResult<Option<Value>> {
        let mut last = None;
        for item in items {
            last = self.execute(item)?;
        }
        Ok(last)
    }

    /// Runs `body` with `scope` installed, restoring the previous scope on
    /// every exit path and recording a traceback entry for errors.
    fn in_scope<T>(
        &mut self,
        scope: ScopeRef,
        body: impl FnOnce(&mut Self) -> EvalResult<T>,
    ) -> EvalResult<T> {
        let previous = std::mem::replace(&mut self.scope, scope);
        self.stats.scopes_pushed += 1;
        let result = body(self);
        let exited = std::mem::replace(&mut self.scope, previous);
        self.stats.scopes_popped += 1;
        result.map_err(|unwind| match unwind {
            Unwind::Error(mut error) => {
                error.push_trace(self.trace_entry(exited.label().to_string(), exited.entry().cloned()));
                Unwind::Error(error)
            }
            signal => signal,
        })
    }

    fn evaluate(&mut self, expr: &Expr) -> EvalResult<Value> {
        stacker::maybe_grow(RED_ZONE, STACK_GROWTH, || self.evaluate_expression(expr))
    }

    fn evaluate_expression(&mut self, expr: &Expr) -> EvalResult<Value> {
        match &expr.kind {
            ExprKind::Literal(literal) => Ok(match literal {
                Literal::Number(n) => Value::number(*n),
                Literal::Bool(b) => Value::bool(*b),
                Literal::String(s) => Value::string(s.clone()),
                Literal::Null => Value::null(),
            }),
            ExprKind::Variable(name) => self.lookup(name, &expr.span),
            ExprKind::This => self.scope.get("this").ok_or_else(|| {
                fail(ErrorKind::IllegalOperation, "`this` is not bound here", &expr.span)
            }),
            ExprKind::Group(inner) => self.evaluate(inner),
            ExprKind::Binary { op, left, right } => {
                let left = self.evaluate(left)?;
                let right = self.evaluate(right)?;
                self.binary(*op, left, right, &expr.span)
            }
            ExprKind::Logical { op, left, right } => {
                let lhs = self.evaluate(left)?;
                let lhs = expect_bool(&lhs, op.symbol(), &left.span)?;
                match (op, lhs) {
                    (LogicalOp::And, false) => Ok(Value::bool(false)),
                    (LogicalOp::Or, true) => Ok(Value::bool(true)),
                    _ => {
                        let rhs = self.evaluate(right)?;
                        Ok(Value::bool(expect_bool(&rhs, op.symbol(), &right.span)?))
                    }
                }
            }
            ExprKind::Unary { op, expr: operand } => {
                let value = self.evaluate(operand)?;
                self.unary(*op, value, &expr.span)
            }
            ExprKind::Assign { name, value } => {
                let value = self.evaluate(value)?;
                if self.scope.assign(name, value.clone()) {
                    Ok(value)
                } else {
                    Err(fail(
                        ErrorKind::UnknownIdentifier,
                        format!("cannot assign to undeclared variable `{name}`"),
                        &expr.span,
                    ))
                }
            }
            ExprKind::SetMember {
                target,
                field,
                value,
            } => {
                let target = self.evaluate(target)?;
                let value = self.evaluate(value)?;
                self.set_member(&target, field, value.clone(), &expr.span)?;
                Ok(value)
            }
            ExprKind::SetIndex {
                target,
                index,
                value,
            } => {
                let target = self.evaluate(target)?;
                let index = self.evaluate(index)?;
                let value = self.evaluate(value)?;
                self.set_index(&target, index, value.clone(), &expr.span)?;
                Ok(value)
            }
            ExprKind::Call { callee, args } => {
                if let ExprKind::Member { target, field } = &callee.kind {
                    let receiver = self.evaluate(target)?;
                    let args = self.evaluate_args(args)?;
                    return self.call_member(&receiver, field, args, &expr.span);
                }
                let function = self.evaluate(callee)?;
                let args = self.evaluate_args(args)?;
                self.call_value(&function, args, &expr.span)
            }
            ExprKind::Index { target, index } => {
                let target = self.evaluate(target)?;
                let index = self.evaluate(index)?;
                self.index(&target, &index, &expr.span)
            }
            ExprKind::Member { target, field } => {
                let target = self.evaluate(target)?;
                self.get_member(&target, field, &expr.span)
            }
            ExprKind::ListLiteral(items) => Ok(Value::list(self.evaluate_args(items)?)),
            ExprKind::MapLiteral(entries) => {
                let mut map = IndexMap::with_capacity(entries.len());
                for (key, value) in entries {
                    let key = self.evaluate(key)?;
                    let value = self.evaluate(value)?;
                    map.insert(key, value);
                }
                Ok(Value::map(map))
            }
            ExprKind::Lambda(decl) => Ok(Value::function(FunctionValue::user(
                Arc::clone(decl),
                Arc::clone(&self.scope),
            ))),
            ExprKind::New { class, args } => {
                let class = match self.lookup(class, &expr.span)?.kind() {
                    ValueKind::Class(class) => Arc::clone(class),
                    _ => {
                        return Err(fail(
                            ErrorKind::IllegalOperation,
                            format!("`{class}` is not a class"),
                            &expr.span,
                        ));
                    }
                };
                let args = self.evaluate_args(args)?;
                self.instantiate(&class, args, &expr.span)
            }
        }
    }

    fn evaluate_args(&mut self, args: &[Expr]) -> EvalResult<Vec<Value>> {
        args.iter().map(|arg| self.evaluate(arg)).collect()
    }

    fn condition(&mut self, expr: &Expr, keyword: &str) -> EvalResult<bool> {
        let value = self.evaluate(expr)?;
        value.as_bool().ok_or_else(|| {
            fail(
                ErrorKind::IllegalOperation,
                format!("`{keyword}` condition must be a Boolean, got {}", value.repr()),
                &expr.span,
            )
        })
    }

    fn lookup(&self, name: &str, span: &SourceSpan) -> EvalResult<Value> {
        if let Some(value) = self.scope.get(name) {
            return Ok(value);
        }
        if let Some(value) = self.context.runtime().builtins().get(name) {
            return Ok(value);
        }
        if let Some(class) = self.context.classes().get(name) {
            return Ok(Value::class(class));
        }
        Err(fail(
            ErrorKind::UnknownIdentifier,
            format!("unknown identifier `{name}`"),
            span,
        ))
    }

    fn check_interrupted(&self, span: &SourceSpan) -> EvalResult<()> {
        if self.token.is_cancelled() {
            return Err(CodeError::interrupted().with_span(span.clone()).into());
        }
        Ok(())
    }

    fn trace_entry(&self, label: String, span: Option<SourceSpan>) -> TraceEntry {
        TraceEntry {
            label,
            display_name: Arc::clone(&self.display_name),
            span,
        }
    }

    fn enter_call(&mut self, span: &SourceSpan) -> EvalResult<()> {
        self.check_interrupted(span)?;
        let limit = self.context.runtime().config().max_call_depth;
        if self.depth >= limit {
            return Err(fail(
                ErrorKind::Runtime,
                format!("maximum recursion depth exceeded ({limit})"),
                span,
            ));
        }
        self.depth += 1;
        self.stats.calls += 1;
        self.stats.max_depth = self.stats.max_depth.max(self.depth);
        Ok(())
    }

    fn call_function(
        &mut self,
        function: &FunctionValue,
        receiver: Option<Value>,
        args: Vec<Value>,
        span: &SourceSpan,
    ) -> EvalResult<Value> {
        match function {
            FunctionValue::Native(native) => self.call_native(native, receiver.as_ref(), args, span),
            FunctionValue::User(user) | FunctionValue::Variadic(user) => {
                self.call_user(&user.decl, &user.closure, receiver, args, span)
            }
            FunctionValue::Method {
                class,
                name,
                is_static,
            } => match receiver {
                Some(receiver) => self.call_method(class, name, *is_static, receiver, args, span),
                None => Err(fail(
                    ErrorKind::IllegalOperation,
                    format!("method `{name}` called without a receiver"),
                    span,
                )),
            },
            FunctionValue::Member {
                receiver: bound,
                method,
            } => self.call_function(method, Some(bound.clone()), args, span),
        }
    }

    /// Picks the overload of `name` matching the argument count and runs it
    /// in the scope of the class that declares it.
    fn call_method(
        &mut self,
        class: &Arc<ClassDefinition>,
        name: &str,
        is_static: bool,
        receiver: Value,
        args: Vec<Value>,
        span: &SourceSpan,
    ) -> EvalResult<Value> {
        let found = if is_static {
            ClassDefinition::find_static_method(class, name, args.len())
        } else {
            ClassDefinition::find_method(class, name, args.len())
        };
        match found {
            Some(method) => {
                let scope = method.scope();
                self.call_user(&method.decl, &scope, Some(receiver), args, span)
            }
            None => Err(fail(
                ErrorKind::Runtime,
                format!(
                    "no overload of `{}.{name}` takes {} argument(s)",
                    class.name,
                    args.len()
                ),
                span,
            )),
        }
    }

    fn call_native(
        &mut self,
        native: &NativeFunction,
        receiver: Option<&Value>,
        args: Vec<Value>,
        span: &SourceSpan,
    ) -> EvalResult<Value> {
        self.enter_call(span)?;
        let scope = Scope::child(&self.scope, format!("native {}", native.name()), Some(span.clone()));
        let result = self.in_scope(scope, |this| {
            let mut cx = CallContext::new(this, span.clone());
            native.invoke(&mut cx, receiver, args)
        });
        self.depth -= 1;
        result
    }

    fn call_user(
        &mut self,
        decl: &Arc<FunctionDecl>,
        closure: &ScopeRef,
        receiver: Option<Value>,
        mut args: Vec<Value>,
        span: &SourceSpan,
    ) -> EvalResult<Value> {
        let expected = decl.arity();
        if args.len() > expected && !decl.is_variadic() {
            return Err(fail(
                ErrorKind::Runtime,
                format!(
                    "too many arguments: `{}` takes {expected}, got {}",
                    decl.name,
                    args.len()
                ),
                span,
            ));
        }
        if args.len() < expected {
            return Err(fail(
                ErrorKind::Runtime,
                format!(
                    "too few arguments: `{}` takes {expected}, got {}",
                    decl.name,
                    args.len()
                ),
                span,
            ));
        }
        self.enter_call(span)?;

        let scope = Scope::child(closure, format!("function {}", decl.name), Some(decl.span.clone()));
        if let Some(receiver) = receiver {
            scope.define("this", receiver);
        }
        let surplus = args.split_off(expected);
        for (param, value) in decl.params.iter().zip(args) {
            scope.define(param.name.clone(), value);
        }
        if let Some(rest) = &decl.rest {
            scope.define(rest.name.clone(), Value::list(surplus));
        }

        let result = self.in_scope(scope, |this| this.execute_sequence(&decl.body));
        self.depth -= 1;
        match result {
            Ok(_) => Ok(Value::null()),
            Err(Unwind::Signal(ControlSignal::Return(value, _))) => Ok(value),
            Err(Unwind::Signal(signal)) => {
                let mut error = signal.into_error();
                error.push_trace(self.trace_entry(format!("call to {}", decl.name), Some(span.clone())));
                Err(error.into())
            }
            Err(Unwind::Error(mut error)) => {
                error.push_trace(self.trace_entry(format!("call to {}", decl.name), Some(span.clone())));
                Err(error.into())
            }
        }
    }

    fn call_member(
        &mut self,
        receiver: &Value,
        name: &str,
        args: Vec<Value>,
        span: &SourceSpan,
    ) -> EvalResult<Value> {
        match receiver.kind() {
            ValueKind::Instance(instance) => {
                if let Some(field) = instance.get(name) {
                    return self.call_value(&field, args, span);
                }
                let class = &instance.class;
                if ClassDefinition::has_method_named(class, name) {
                    return self.call_method(class, name, false, receiver.clone(), args, span);
                }
                Err(fail(
                    ErrorKind::IllegalOperation,
                    format!("`{}` has no member `{name}`", class.name),
                    span,
                ))
            }
            ValueKind::Class(class) => {
                if let Some(owner) = ClassDefinition::static_owner(class, name) {
                    let field = owner.static_fields.read().get(name).cloned();
                    if let Some(field) = field {
                        return self.call_value(&field, args, span);
                    }
                }
                if let Some(method) = ClassDefinition::find_static_method(class, name, args.len()) {
                    let scope = method.scope();
                    return self.call_user(&method.decl, &scope, Some(receiver.clone()), args, span);
                }
                Err(fail(
                    ErrorKind::IllegalOperation,
                    format!(
                        "class `{}` has no static method `{name}` taking {} argument(s)",
                        class.name,
                        args.len()
                    ),
                    span,
                ))
            }
            _ => {
                let builtins = self.context.runtime().builtins();
                match builtins.member(receiver.value_type(), name) {
                    Some(native) => self.call_native(&native, Some(receiver), args, span),
                    None => Err(fail(
                        ErrorKind::IllegalOperation,
                        format!("{} has no member `{name}`", receiver.type_name()),
                        span,
                    )),
                }
            }
        }
    }

    fn get_member(&self, target: &Value, name: &str, span: &SourceSpan) -> EvalResult<Value> {
        match target.kind() {
            ValueKind::Instance(instance) => {
                if let Some(field) = instance.get(name) {
                    return Ok(field);
                }
                let class = &instance.class;
                if ClassDefinition::has_method_named(class, name) {
                    let method = FunctionValue::method(class, name, false);
                    return Ok(Value::function(method.bind(target.clone())));
                }
                Err(fail(
                    ErrorKind::IllegalOperation,
                    format!("`{}` has no member `{name}`", class.name),
                    span,
                ))
            }
            ValueKind::Class(class) => {
                if let Some(owner) = ClassDefinition::static_owner(class, name) {
                    if let Some(value) = owner.static_fields.read().get(name) {
                        return Ok(value.clone());
                    }
                }
                if ClassDefinition::has_static_method_named(class, name) {
                    let method = FunctionValue::method(class, name, true);
                    return Ok(Value::function(method.bind(target.clone())));
                }
                Err(fail(
                    ErrorKind::IllegalOperation,
                    format!("class `{}` has no static member `{name}`", class.name),
                    span,
                ))
            }
            _ => {
                let builtins = self.context.runtime().builtins();
                match builtins.member(target.value_type(), name) {
                    Some(native) => {
                        Ok(Value::function(FunctionValue::Native(native).bind(target.clone())))
                    }
                    None => Err(fail(
                        ErrorKind::IllegalOperation,
                        format!("{} has no member `{name}`", target.type_name()),
                        span,
                    )),
                }
            }
        }
    }

    fn set_member(
        &self,
        target: &Value,
        name: &str,
        value: Value,
        span: &SourceSpan,
    ) -> EvalResult<()> {
        match target.kind() {
            ValueKind::Instance(instance) => {
                instance.set(name, value);
                Ok(())
            }
            ValueKind::Class(class) => match ClassDefinition::static_owner(class, name) {
                Some(owner) => {
                    owner.static_fields.write().insert(name.to_string(), value);
                    Ok(())
                }
                None => Err(fail(
                    ErrorKind::IllegalOperation,
                    format!("class `{}` has no static field `{name}`", class.name),
                    span,
                )),
            },
            _ => Err(fail(
                ErrorKind::IllegalOperation,
                format!("cannot set member `{name}` on {}", target.type_name()),
                span,
            )),
        }
    }

    fn index(&self, target: &Value, index: &Value, span: &SourceSpan) -> EvalResult<Value> {
        match target.kind() {
            ValueKind::List(items) => {
                let items = items.read();
                let position = list_index(index, items.len(), span)?;
                Ok(items[position].clone())
            }
            ValueKind::String(text) => {
                let count = text.chars().count();
                let position = list_index(index, count, span)?;
                Ok(text
                    .chars()
                    .nth(position)
                    .map(|ch| Value::string(ch.to_string()))
                    .unwrap_or_else(Value::null))
            }
            ValueKind::Map(entries) => Ok(entries
                .read()
                .get(index)
                .cloned()
                .unwrap_or_else(Value::null)),
            _ => Err(fail(
                ErrorKind::IllegalOperation,
                format!("{} cannot be indexed", target.repr()),
                span,
            )),
        }
    }

    fn set_index(
        &self,
        target: &Value,
        index: Value,
        value: Value,
        span: &SourceSpan,
    ) -> EvalResult<()> {
        match target.kind() {
            ValueKind::List(items) => {
                let mut items = items.write();
                let position = list_index(&index, items.len(), span)?;
                items[position] = value;
                Ok(())
            }
            ValueKind::Map(entries) => {
                entries.write().insert(index, value);
                Ok(())
            }
            _ => Err(fail(
                ErrorKind::IllegalOperation,
                format!("{} does not support index assignment", target.repr()),
                span,
            )),
        }
    }

    fn binary(&mut self, op: BinaryOp, left: Value, right: Value, span: &SourceSpan) -> EvalResult<Value> {
        if let Some(instance) = left.as_instance() {
            let class = Arc::clone(&instance.class);
            if let Some(method) = ClassDefinition::find_method(&class, op.symbol(), 1) {
                let scope = method.scope();
                return self.call_user(&method.decl, &scope, Some(left.clone()), vec![right], span);
            }
        }

        let illegal = |left: &Value, right: &Value| {
            fail(
                ErrorKind::IllegalOperation,
                format!(
                    "operator `{op}` cannot be applied to {} and {}",
                    left.repr(),
                    right.repr()
                ),
                span,
            )
        };

        match op {
            BinaryOp::Equal => return Ok(Value::bool(left.equals(&right))),
            BinaryOp::NotEqual => return Ok(Value::bool(!left.equals(&right))),
            _ => {}
        }

        match (left.kind(), right.kind()) {
            (ValueKind::Number(a), ValueKind::Number(b)) => {
                let (a, b) = (*a, *b);
                Ok(match op {
                    BinaryOp::Add => Value::number(a + b),
                    BinaryOp::Sub => Value::number(a - b),
                    BinaryOp::Mul => Value::number(a * b),
                    BinaryOp::Div | BinaryOp::Mod if b == 0.0 => {
                        return Err(fail(ErrorKind::Runtime, "division by zero", span));
                    }
                    BinaryOp::Div => Value::number(a / b),
                    BinaryOp::Mod => Value::number(a % b),
                    BinaryOp::Pow => Value::number(a.powf(b)),
                    BinaryOp::Less => Value::bool(a < b),
                    BinaryOp::LessEqual => Value::bool(a <= b),
                    BinaryOp::Greater => Value::bool(a > b),
                    BinaryOp::GreaterEqual => Value::bool(a >= b),
                    BinaryOp::Equal => Value::bool(a == b),
                    BinaryOp::NotEqual => Value::bool(a != b),
                })
            }
            (ValueKind::String(a), ValueKind::String(b)) => match op {
                BinaryOp::Add => Ok(Value::string(format!("{a}{b}"))),
                BinaryOp::Less => Ok(Value::bool(a < b)),
                BinaryOp::LessEqual => Ok(Value::bool(a <= b)),
                BinaryOp::Greater => Ok(Value::bool(a > b)),
                BinaryOp::GreaterEqual => Ok(Value::bool(a >= b)),
                _ => Err(illegal(&left, &right)),
            },
            (ValueKind::String(a), _) if op == BinaryOp::Add => {
                Ok(Value::string(format!("{a}{right}")))
            }
            (_, ValueKind::String(b)) if op == BinaryOp::Add => {
                Ok(Value::string(format!("{left}{b}")))
            }
            (ValueKind::List(a), ValueKind::List(b)) if op == BinaryOp::Add => {
                let mut joined = a.read().clone();
                joined.extend(b.read().iter().cloned());
                Ok(Value::list(joined))
            }
            _ => Err(illegal(&left, &right)),
        }
    }

    fn unary(&mut self, op: UnaryOp, value: Value, span: &SourceSpan) -> EvalResult<Value> {
        if let Some(instance) = value.as_instance() {
            let class = Arc::clone(&instance.class);
            if let Some(method) = ClassDefinition::find_method(&class, op.symbol(), 0) {
                let scope = method.scope();
                return self.call_user(&method.decl, &scope, Some(value.clone()), Vec::new(), span);
            }
        }
        match (op, value.kind()) {
            (UnaryOp::Negate, ValueKind::Number(n)) => Ok(Value::number(-n)),
            (UnaryOp::Not, ValueKind::Boolean(b)) => Ok(Value::bool(!b)),
            _ => Err(fail(
                ErrorKind::IllegalOperation,
                format!("operator `{}` cannot be applied to {}", op.symbol(), value.repr()),
                span,
            )),
        }
    }

    fn declare_class(&mut self, decl: &ClassDecl) -> EvalResult<()> {
        let parent = match &decl.parent {
            Some((name, span)) => match self.lookup(name, span)?.kind() {
                ValueKind::Class(class) => Some(Arc::clone(class)),
                _ => {
                    return Err(fail(
                        ErrorKind::IllegalOperation,
                        format!("`{name}` is not a class"),
                        span,
                    ));
                }
            },
            None => None,
        };

        let mut constructors = IndexMap::new();
        for ctor in &decl.constructors {
            if constructors.insert(ctor.arity(), Arc::clone(ctor)).is_some() {
                return Err(fail(
                    ErrorKind::IllegalOperation,
                    format!(
                        "class `{}` declares two constructors taking {} argument(s)",
                        decl.name,
                        ctor.arity()
                    ),
                    &ctor.span,
                ));
            }
        }

        let mut methods: Vec<Arc<FunctionDecl>> = Vec::new();
        let mut static_methods: Vec<Arc<FunctionDecl>> = Vec::new();
        for method in &decl.methods {
            let bucket = if method.is_static {
                &mut static_methods
            } else {
                &mut methods
            };
            let function = &method.function;
            let duplicate = bucket.iter().any(|existing| {
                existing.name == function.name
                    && existing.arity() == function.arity()
                    && existing.is_variadic() == function.is_variadic()
            });
            if duplicate {
                return Err(fail(
                    ErrorKind::IllegalOperation,
                    format!(
                        "class `{}` declares `{}` twice with {} parameter(s)",
                        decl.name,
                        function.name,
                        function.arity()
                    ),
                    &function.span,
                ));
            }
            bucket.push(Arc::clone(function));
        }

        let class = Arc::new(ClassDefinition {
            name: decl.name.clone(),
            parent,
            constructors,
            methods,
            static_methods,
            fields: decl.fields.iter().filter(|f| !f.is_static).cloned().collect(),
            static_fields: Default::default(),
            scope: Arc::clone(&self.scope),
            span: decl.span.clone(),
        });
        let class_value = Value::class(Arc::clone(&class));
        self.scope.define(decl.name.clone(), class_value.clone());
        self.context.classes().register(Arc::clone(&class));
        debug!(class = %class.name, "class declared");

        for field in decl.fields.iter().filter(|f| f.is_static) {
            let value = match &field.initializer {
                Some(expr) => self.evaluate_with_this(&class.scope, &class_value, &field.span, expr)?,
                None => Value::null(),
            };
            class
                .static_fields
                .write()
                .insert(field.name.clone(), value);
        }
        Ok(())
    }

    fn instantiate(
        &mut self,
        class: &Arc<ClassDefinition>,
        args: Vec<Value>,
        span: &SourceSpan,
    ) -> EvalResult<Value> {
        let constructor = class.constructors.get(&args.len()).cloned();
        if constructor.is_none() {
            if !class.constructors.is_empty() {
                return Err(fail(
                    ErrorKind::Runtime,
                    format!(
                        "no constructor of `{}` takes {} argument(s)",
                        class.name,
                        args.len()
                    ),
                    span,
                ));
            }
            if class.parent.is_some() {
                return Err(fail(
                    ErrorKind::Runtime,
                    format!(
                        "class `{}` is not constructible: it extends `{}` but declares no constructor",
                        class.name,
                        class.parent.as_ref().map(|p| p.name.as_str()).unwrap_or_default()
                    ),
                    span,
                ));
            }
            if !args.is_empty() {
                return Err(fail(
                    ErrorKind::Runtime,
                    format!(
                        "too many arguments: `{}` takes 0, got {}",
                        class.name,
                        args.len()
                    ),
                    span,
                ));
            }
        }

        let instance = Value::new(ValueKind::Instance(ClassInstance::new(Arc::clone(class))));
        for def in ClassDefinition::lineage(class) {
            for field in &def.fields {
                let value = match &field.initializer {
                    Some(expr) => self.evaluate_with_this(&def.scope, &instance, &field.span, expr)?,
                    None => Value::null(),
                };
                if let Some(object) = instance.as_instance() {
                    object.set(field.name.clone(), value);
                }
            }
        }
        if let Some(constructor) = constructor {
            let scope = Arc::clone(&class.scope);
            self.call_user(&constructor, &scope, Some(instance.clone()), args, span)?;
        }
        Ok(instance)
    }

    fn evaluate_with_this(
        &mut self,
        parent: &ScopeRef,
        this: &Value,
        span: &SourceSpan,
        expr: &Expr,
    ) -> EvalResult<Value> {
        let scope = Scope::child(parent, "field initializer", Some(span.clone()));
        scope.define("this", this.clone());
        self.in_scope(scope, |interpreter| interpreter.evaluate(expr))
    }
}

fn fail(kind: ErrorKind, message: impl Into<String>, span: &SourceSpan) -> Unwind {
    Unwind::Error(CodeError::new(kind, message).with_span(span.clone()))
}

fn expect_bool(value: &Value, operator: &str, span: &SourceSpan) -> EvalResult<bool> {
    value.as_bool().ok_or_else(|| {
        fail(
            ErrorKind::IllegalOperation,
            format!("operator `{operator}` cannot be applied to {}", value.repr()),
            span,
        )
    })
}

fn list_index(index: &Value, len: usize, span: &SourceSpan) -> EvalResult<usize> {
    let Some(n) = index.as_number() else {
        return Err(fail(
            ErrorKind::IllegalOperation,
            format!("index must be a Number, got {}", index.repr()),
            span,
        ));
    };
    if n.fract() != 0.0 || n < 0.0 || n as usize >= len {
        return Err(fail(
            ErrorKind::Runtime,
            format!("index {} out of bounds for length {len}", Value::number(n)),
            span,
        ));
    }
    Ok(n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::BufferSink;

    fn interpreter() -> (Interpreter, Arc<BufferSink>) {
        let runtime = Runtime::new().unwrap();
        let sink = Arc::new(BufferSink::new());
        let context = runtime.context(sink.clone());
        (Interpreter::new(context, "test"), sink)
    }

    #[test]
    fn scope_pushes_and_pops_balance_after_errors() {
        let (mut interpreter, _) = interpreter();
        let result = interpreter.eval_source(
            r#"
            function deep(n) {
                { if (n == 0) { error("bottom"); } }
                return deep(n - 1);
            }
            deep(5);
            "#,
        );
        assert!(result.is_err());
        let stats = interpreter.stats();
        assert!(stats.scopes_pushed > 0);
        assert_eq!(stats.scopes_pushed, stats.scopes_popped);
        assert_eq!(stats.max_depth, 7);
    }

    #[test]
    fn final_statement_value_is_returned() {
        let (mut interpreter, _) = interpreter();
        let value = interpreter.eval_source("var x = 2; x * 21;").unwrap();
        assert_eq!(value, Value::number(42.0));
        let value = interpreter.eval_source("var y = 1;").unwrap();
        assert!(value.is_null());
    }

    #[test]
    fn globals_persist_across_programs() {
        let (mut interpreter, _) = interpreter();
        interpreter.eval_source("var counter = 1;").unwrap();
        interpreter.eval_source("counter = counter + 1;").unwrap();
        assert_eq!(
            interpreter.context().global("counter"),
            Some(Value::number(2.0))
        );
        assert!(interpreter
            .context()
            .declared_names()
            .contains(&"counter".to_string()));
    }

    #[test]
    fn call_depth_limit_is_a_runtime_error() {
        let runtime =
            Runtime::with_config(RuntimeConfig::default().with_max_call_depth(50)).unwrap();
        let context = runtime.context(Arc::new(BufferSink::new()));
        let mut interpreter = Interpreter::new(context, "test");
        let error = interpreter
            .eval_source("function f(n) { return f(n + 1); } f(0);")
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::Runtime);
        assert!(error.message.contains("maximum recursion depth"));
    }

    #[test]
    fn cancelled_token_interrupts_loops() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.context(Arc::new(BufferSink::new()));
        let token = CancellationToken::new();
        token.cancel();
        let mut interpreter = Interpreter::with_token(context, "test", token);
        let error = interpreter.eval_source("while (true) {}").unwrap_err();
        assert_eq!(error.kind, ErrorKind::Interrupted);
    }

    #[test]
    fn context_claim_rejects_second_live_manager() {
        let runtime = Runtime::new().unwrap();
        let context = runtime.context(Arc::new(BufferSink::new()));
        let first = runtime.thread_manager();
        let second = runtime.thread_manager();
        first.adopt(&context).unwrap();
        assert!(matches!(
            second.adopt(&context),
            Err(ManagerError::ForeignContext)
        ));
        assert!(context.manager().is_some());
    }
}
