use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use indexmap::{IndexMap, IndexSet};
use parking_lot::RwLock;

use crate::{
    ast::FunctionDecl,
    class::{ClassDefinition, ClassInstance},
    diagnostics::CodeError,
    environment::ScopeRef,
    native::NativeFunction,
};

/// A shared handle to a runtime value. Values carry no span; errors take the
/// span of the expression that was being evaluated.
#[derive(Clone)]
pub struct Value(pub Arc<ValueKind>);

pub enum ValueKind {
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    List(RwLock<Vec<Value>>),
    Map(RwLock<IndexMap<Value, Value>>),
    Set(RwLock<IndexSet<Value>>),
    Function(FunctionValue),
    Instance(ClassInstance),
    Class(Arc<ClassDefinition>),
    Error(CodeError),
}

impl Value {
    pub fn new(kind: ValueKind) -> Self {
        Self(Arc::new(kind))
    }

    pub fn null() -> Self {
        Self::new(ValueKind::Null)
    }

    pub fn bool(value: bool) -> Self {
        Self::new(ValueKind::Boolean(value))
    }

    pub fn number(value: f64) -> Self {
        Self::new(ValueKind::Number(value))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::new(ValueKind::String(value.into()))
    }

    pub fn list(values: Vec<Value>) -> Self {
        Self::new(ValueKind::List(RwLock::new(values)))
    }

    pub fn map(entries: IndexMap<Value, Value>) -> Self {
        Self::new(ValueKind::Map(RwLock::new(entries)))
    }

    pub fn set(values: IndexSet<Value>) -> Self {
        Self::new(ValueKind::Set(RwLock::new(values)))
    }

    pub fn function(function: FunctionValue) -> Self {
        Self::new(ValueKind::Function(function))
    }

    pub fn native(function: Arc<NativeFunction>) -> Self {
        Self::function(FunctionValue::Native(function))
    }

    pub fn class(class: Arc<ClassDefinition>) -> Self {
        Self::new(ValueKind::Class(class))
    }

    pub fn error(error: CodeError) -> Self {
        Self::new(ValueKind::Error(error))
    }

    pub fn kind(&self) -> &ValueKind {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        matches!(&*self.0, ValueKind::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match &*self.0 {
            ValueKind::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match &*self.0 {
            ValueKind::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &*self.0 {
            ValueKind::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<&ClassInstance> {
        match &*self.0 {
            ValueKind::Instance(instance) => Some(instance),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionValue> {
        match &*self.0 {
            ValueKind::Function(function) => Some(function),
            _ => None,
        }
    }

    /// Whether both handles point at the same allocation.
    pub fn same(&self, other: &Value) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn value_type(&self) -> ValueType {
        match &*self.0 {
            ValueKind::Null => ValueType::Null,
            ValueKind::Boolean(_) => ValueType::Boolean,
            ValueKind::Number(_) => ValueType::Number,
            ValueKind::String(_) => ValueType::String,
            ValueKind::List(_) => ValueType::List,
            ValueKind::Map(_) => ValueType::Map,
            ValueKind::Set(_) => ValueType::Set,
            ValueKind::Function(_) => ValueType::Function,
            ValueKind::Instance(_) => ValueType::Instance,
            ValueKind::Class(_) => ValueType::Class,
            ValueKind::Error(_) => ValueType::Error,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.value_type().name()
    }

    /// Like [`Value::type_name`], but instances report their class.
    pub fn runtime_type_name(&self) -> String {
        match &*self.0 {
            ValueKind::Instance(instance) => instance.class.name.clone(),
            _ => self.type_name().to_string(),
        }
    }

    /// Debug form: strings are quoted.
    pub fn repr(&self) -> String {
        match &*self.0 {
            ValueKind::String(s) => format!("{s:?}"),
            _ => self.to_string(),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(f, &mut Vec::new(), false)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.repr())
    }
}

impl Value {
    /// `open` holds the containers currently being rendered; meeting one
    /// again prints an ellipsis instead of recursing.
    fn render(
        &self,
        f: &mut fmt::Formatter<'_>,
        open: &mut Vec<*const ValueKind>,
        quoted: bool,
    ) -> fmt::Result {
        let address = Arc::as_ptr(&self.0);
        let cyclic = open.contains(&address);
        match &*self.0 {
            ValueKind::Null => write!(f, "null"),
            ValueKind::Boolean(b) => write!(f, "{b}"),
            ValueKind::Number(n) => write!(f, "{}", format_number(*n)),
            ValueKind::String(s) if quoted => write!(f, "{s:?}"),
            ValueKind::String(s) => write!(f, "{s}"),
            ValueKind::List(_) if cyclic => write!(f, "[...]"),
            ValueKind::Map(_) if cyclic => write!(f, "{{...}}"),
            ValueKind::Set(_) if cyclic => write!(f, "set(...)"),
            ValueKind::List(values) => {
                open.push(address);
                write!(f, "[")?;
                render_all(f, values.read_recursive().iter(), open)?;
                open.pop();
                write!(f, "]")
            }
            ValueKind::Map(map) => {
                open.push(address);
                write!(f, "{{")?;
                for (idx, (key, value)) in map.read_recursive().iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    key.render(f, open, true)?;
                    write!(f, ": ")?;
                    value.render(f, open, true)?;
                }
                open.pop();
                write!(f, "}}")
            }
            ValueKind::Set(values) => {
                open.push(address);
                write!(f, "set(")?;
                render_all(f, values.read_recursive().iter(), open)?;
                open.pop();
                write!(f, ")")
            }
            ValueKind::Function(function) => write!(f, "<function {}>", function.name()),
            ValueKind::Instance(instance) => write!(f, "<{} instance>", instance.class.name),
            ValueKind::Class(class) => write!(f, "<class {}>", class.name),
            ValueKind::Error(error) => write!(f, "{}: {}", error.kind, error.message),
        }
    }

    /// Equality as the `==` operator sees it: structural for containers,
    /// identity for functions, instances and classes. Self-referencing
    /// containers compare without recursing forever.
    pub fn equals(&self, other: &Value) -> bool {
        self.equals_tracked(other, &mut Vec::new())
    }

    fn equals_tracked(
        &self,
        other: &Value,
        seen: &mut Vec<(*const ValueKind, *const ValueKind)>,
    ) -> bool {
        if self.same(other) {
            return true;
        }
        let pair = (Arc::as_ptr(&self.0), Arc::as_ptr(&other.0));
        let containers = matches!(
            (&*self.0, &*other.0),
            (ValueKind::List(_), ValueKind::List(_))
                | (ValueKind::Map(_), ValueKind::Map(_))
                | (ValueKind::Set(_), ValueKind::Set(_))
        );
        if containers {
            if seen.contains(&pair) {
                return true;
            }
            seen.push(pair);
        }
        match (&*self.0, &*other.0) {
            (ValueKind::List(a), ValueKind::List(b)) => {
                let (a, b) = (a.read_recursive(), b.read_recursive());
                a.len() == b.len()
                    && a.iter().zip(b.iter()).all(|(x, y)| x.equals_tracked(y, seen))
            }
            (ValueKind::Map(a), ValueKind::Map(b)) => {
                let (a, b) = (a.read_recursive(), b.read_recursive());
                a.len() == b.len()
                    && a.iter().all(|(key, value)| {
                        b.get(key).is_some_and(|other| value.equals_tracked(other, seen))
                    })
            }
            (ValueKind::Set(a), ValueKind::Set(b)) => {
                let (a, b) = (a.read_recursive(), b.read_recursive());
                a.len() == b.len() && a.iter().all(|value| b.contains(value))
            }
            _ => self == other,
        }
    }
}

fn render_all<'a>(
    f: &mut fmt::Formatter<'_>,
    values: impl Iterator<Item = &'a Value>,
    open: &mut Vec<*const ValueKind>,
) -> fmt::Result {
    for (idx, value) in values.enumerate() {
        if idx > 0 {
            write!(f, ", ")?;
        }
        value.render(f, open, true)?;
    }
    Ok(())
}

/// Key equality for Map and Set entries: by value for immutable variants,
/// by identity for Lists, Maps, Sets, functions and instances. Neither this
/// nor [`Hash`] takes a container lock, so a container may hold itself.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        if self.same(other) {
            return true;
        }
        match (&*self.0, &*other.0) {
            (ValueKind::Null, ValueKind::Null) => true,
            (ValueKind::Boolean(a), ValueKind::Boolean(b)) => a == b,
            (ValueKind::Number(a), ValueKind::Number(b)) => a == b,
            (ValueKind::String(a), ValueKind::String(b)) => a == b,
            (ValueKind::Error(a), ValueKind::Error(b)) => {
                a.kind == b.kind && a.message == b.message
            }
            (ValueKind::Class(a), ValueKind::Class(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(&*self.0).hash(state);
        match &*self.0 {
            ValueKind::Null => {}
            ValueKind::Boolean(b) => b.hash(state),
            ValueKind::Number(n) => {
                let normalized = if *n == 0.0 { 0.0f64 } else { *n };
                normalized.to_bits().hash(state);
            }
            ValueKind::String(s) => s.hash(state),
            ValueKind::Error(error) => error.message.hash(state),
            ValueKind::Class(class) => Arc::as_ptr(class).hash(state),
            ValueKind::List(_)
            | ValueKind::Map(_)
            | ValueKind::Set(_)
            | ValueKind::Function(_)
            | ValueKind::Instance(_) => Arc::as_ptr(&self.0).hash(state),
        }
    }
}

/// A user-defined function closed over the scope it was created in.
#[derive(Clone)]
pub struct UserFunction {
    pub decl: Arc<FunctionDecl>,
    pub closure: ScopeRef,
}

pub enum FunctionValue {
    Native(Arc<NativeFunction>),
    User(UserFunction),
    /// A user function whose trailing rest parameter collects extra arguments.
    Variadic(UserFunction),
    /// A class method read as a value; the overload is picked by argument
    /// count when it is called.
    Method {
        class: Arc<ClassDefinition>,
        name: String,
        is_static: bool,
    },
    /// A method bound to the receiver it was looked up on.
    Member {
        receiver: Value,
        method: Box<FunctionValue>,
    },
}

impl FunctionValue {
    pub fn user(decl: Arc<FunctionDecl>, closure: ScopeRef) -> Self {
        let function = UserFunction { decl, closure };
        if function.decl.is_variadic() {
            FunctionValue::Variadic(function)
        } else {
            FunctionValue::User(function)
        }
    }

    pub fn method(class: &Arc<ClassDefinition>, name: &str, is_static: bool) -> Self {
        FunctionValue::Method {
            class: Arc::clone(class),
            name: name.to_string(),
            is_static,
        }
    }

    pub fn bind(self, receiver: Value) -> Self {
        FunctionValue::Member {
            receiver,
            method: Box::new(self),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            FunctionValue::Native(native) => native.name(),
            FunctionValue::User(user) | FunctionValue::Variadic(user) => &user.decl.name,
            FunctionValue::Method { name, .. } => name,
            FunctionValue::Member { method, .. } => method.name(),
        }
    }
}

/// The built-in type hierarchy used to validate native signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Any,
    Null,
    Boolean,
    Number,
    String,
    Collection,
    List,
    Map,
    Set,
    Function,
    Instance,
    Class,
    Error,
}

impl ValueType {
    pub const ALL: [ValueType; 13] = [
        ValueType::Any,
        ValueType::Null,
        ValueType::Boolean,
        ValueType::Number,
        ValueType::String,
        ValueType::Collection,
        ValueType::List,
        ValueType::Map,
        ValueType::Set,
        ValueType::Function,
        ValueType::Instance,
        ValueType::Class,
        ValueType::Error,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ValueType::Any => "Any",
            ValueType::Null => "Null",
            ValueType::Boolean => "Boolean",
            ValueType::Number => "Number",
            ValueType::String => "String",
            ValueType::Collection => "Collection",
            ValueType::List => "List",
            ValueType::Map => "Map",
            ValueType::Set => "Set",
            ValueType::Function => "Function",
            ValueType::Instance => "Instance",
            ValueType::Class => "Class",
            ValueType::Error => "Error",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ty| ty.name() == name)
    }

    pub fn parent(self) -> Option<Self> {
        match self {
            ValueType::Any => None,
            ValueType::List | ValueType::Map | ValueType::Set => Some(ValueType::Collection),
            _ => Some(ValueType::Any),
        }
    }

    /// Whether `self` is `other` or one of its descendants.
    pub fn is_a(self, other: ValueType) -> bool {
        let mut current = Some(self);
        while let Some(ty) = current {
            if ty == other {
                return true;
            }
            current = ty.parent();
        }
        false
    }

    pub fn accepts(self, value: &Value) -> bool {
        value.value_type().is_a(self)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
