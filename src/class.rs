//! Class definitions, instances and the per-context class registry.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::{
    ast::{FieldDecl, FunctionDecl},
    diagnostics::SourceSpan,
    environment::ScopeRef,
    value::Value,
};

pub struct ClassDefinition {
    pub name: String,
    pub parent: Option<Arc<ClassDefinition>>,
    /// Keyed by arity. Constructors are never inherited.
    pub constructors: IndexMap<usize, Arc<FunctionDecl>>,
    pub methods: Vec<Arc<FunctionDecl>>,
    pub static_methods: Vec<Arc<FunctionDecl>>,
    pub fields: Vec<FieldDecl>,
    pub static_fields: RwLock<IndexMap<String, Value>>,
    /// Scope the class was declared in; method closures hang off it.
    pub scope: ScopeRef,
    pub span: SourceSpan,
}

/// A method together with the class that declares it. Calls run in the
/// owner's scope, not the receiver's.
#[derive(Clone)]
pub struct MethodRef {
    pub owner: Arc<ClassDefinition>,
    pub decl: Arc<FunctionDecl>,
}

impl MethodRef {
    pub fn scope(&self) -> ScopeRef {
        Arc::clone(&self.owner.scope)
    }
}

impl ClassDefinition {
    /// Resolves `name` for `arity` arguments, walking the parent chain.
    /// An exact arity match beats a variadic one within the same class.
    pub fn find_method(class: &Arc<Self>, name: &str, arity: usize) -> Option<MethodRef> {
        Self::walk(class, |current| select(&current.methods, name, arity))
    }

    pub fn find_static_method(class: &Arc<Self>, name: &str, arity: usize) -> Option<MethodRef> {
        Self::walk(class, |current| select(&current.static_methods, name, arity))
    }

    /// The nearest method named `name` regardless of arity.
    pub fn find_method_by_name(class: &Arc<Self>, name: &str) -> Option<MethodRef> {
        Self::walk(class, |current| {
            current.methods.iter().find(|method| method.name == name).cloned()
        })
    }

    pub fn has_method_named(class: &Arc<Self>, name: &str) -> bool {
        Self::find_method_by_name(class, name).is_some()
    }

    pub fn has_static_method_named(class: &Arc<Self>, name: &str) -> bool {
        Self::walk(class, |current| {
            current.static_methods.iter().find(|method| method.name == name).cloned()
        })
        .is_some()
    }

    /// The class in the chain that declares static field `name`.
    pub fn static_owner(class: &Arc<Self>, name: &str) -> Option<Arc<Self>> {
        let mut current = Some(Arc::clone(class));
        while let Some(def) = current {
            if def.static_fields.read().contains_key(name) {
                return Some(def);
            }
            current = def.parent.clone();
        }
        None
    }

    /// Root first, ending with `class` itself.
    pub fn lineage(class: &Arc<Self>) -> Vec<Arc<Self>> {
        let mut chain = Vec::new();
        let mut current = Some(Arc::clone(class));
        while let Some(def) = current {
            current = def.parent.clone();
            chain.push(def);
        }
        chain.reverse();
        chain
    }

    pub fn is_subclass_of(class: &Arc<Self>, ancestor: &Arc<Self>) -> bool {
        Self::lineage(class)
            .iter()
            .any(|def| Arc::ptr_eq(def, ancestor))
    }

    fn walk(
        class: &Arc<Self>,
        mut f: impl FnMut(&Arc<Self>) -> Option<Arc<FunctionDecl>>,
    ) -> Option<MethodRef> {
        let mut current = Some(Arc::clone(class));
        while let Some(def) = current {
            if let Some(decl) = f(&def) {
                return Some(MethodRef { owner: def, decl });
            }
            current = def.parent.clone();
        }
        None
    }
}

fn select(methods: &[Arc<FunctionDecl>], name: &str, arity: usize) -> Option<Arc<FunctionDecl>> {
    let named = || methods.iter().filter(|method| method.name == name);
    named()
        .find(|method| !method.is_variadic() && method.arity() == arity)
        .or_else(|| named().find(|method| method.accepts(arity)))
        .cloned()
}

pub struct ClassInstance {
    pub class: Arc<ClassDefinition>,
    pub fields: RwLock<IndexMap<String, Value>>,
}

impl ClassInstance {
    pub fn new(class: Arc<ClassDefinition>) -> Self {
        Self {
            class,
            fields: RwLock::new(IndexMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.fields.read().get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, value: Value) {
        self.fields.write().insert(name.into(), value);
    }
}

/// Arena of class definitions keyed by name.
#[derive(Default)]
pub struct ClassRegistry {
    classes: RwLock<IndexMap<String, Arc<ClassDefinition>>>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `class`, replacing any previous definition with that name.
    pub fn register(&self, class: Arc<ClassDefinition>) {
        self.classes.write().insert(class.name.clone(), class);
    }

    pub fn get(&self, name: &str) -> Option<Arc<ClassDefinition>> {
        self.classes.read().get(name).cloned()
    }

    /// Removes a definition. Live instances keep their own reference.
    pub fn unload(&self, name: &str) -> bool {
        self.classes.write().shift_remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.classes.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.classes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ast::Param,
        diagnostics::Position,
        environment::Scope,
    };

    fn span() -> SourceSpan {
        SourceSpan::new(Arc::from("test"), Position::start(), Position::start())
    }

    fn method(name: &str, arity: usize, variadic: bool) -> Arc<FunctionDecl> {
        let param = |idx: usize| Param {
            name: format!("p{idx}"),
            span: span(),
        };
        Arc::new(FunctionDecl {
            name: name.into(),
            params: (0..arity).map(param).collect(),
            rest: variadic.then(|| param(arity)),
            body: Arc::from(Vec::new()),
            span: span(),
        })
    }

    fn class(
        name: &str,
        parent: Option<Arc<ClassDefinition>>,
        methods: Vec<Arc<FunctionDecl>>,
    ) -> Arc<ClassDefinition> {
        Arc::new(ClassDefinition {
            name: name.into(),
            parent,
            constructors: IndexMap::new(),
            methods,
            static_methods: Vec::new(),
            fields: Vec::new(),
            static_fields: RwLock::new(IndexMap::new()),
            scope: Scope::root("<program>"),
            span: span(),
        })
    }

    #[test]
    fn method_lookup_walks_parent_chain() {
        let base = class("Base", None, vec![method("greet", 0, false)]);
        let child = class("Child", Some(Arc::clone(&base)), vec![method("greet", 1, false)]);
        let own = ClassDefinition::find_method(&child, "greet", 1).unwrap();
        assert_eq!(own.decl.arity(), 1);
        assert!(Arc::ptr_eq(&own.owner, &child));
        let inherited = ClassDefinition::find_method(&child, "greet", 0).unwrap();
        assert!(Arc::ptr_eq(&inherited.decl, &base.methods[0]));
        assert!(Arc::ptr_eq(&inherited.owner, &base));
        assert!(ClassDefinition::find_method(&child, "greet", 2).is_none());
        assert!(ClassDefinition::is_subclass_of(&child, &base));
    }

    #[test]
    fn exact_arity_beats_variadic() {
        let class = class(
            "C",
            None,
            vec![method("f", 0, true), method("f", 2, false)],
        );
        assert!(!ClassDefinition::find_method(&class, "f", 2).unwrap().decl.is_variadic());
        assert!(ClassDefinition::find_method(&class, "f", 3).unwrap().decl.is_variadic());
    }

    #[test]
    fn registry_unload() {
        let registry = ClassRegistry::new();
        registry.register(class("A", None, Vec::new()));
        assert_eq!(registry.names(), vec!["A".to_string()]);
        assert!(registry.unload("A"));
        assert!(!registry.unload("A"));
        assert!(registry.get("A").is_none());
    }

    #[test]
    fn lineage_is_root_first() {
        let a = class("A", None, Vec::new());
        let b = class("B", Some(Arc::clone(&a)), Vec::new());
        let names: Vec<_> = ClassDefinition::lineage(&b)
            .iter()
            .map(|def| def.name.clone())
            .collect();
        assert_eq!(names, vec!["A", "B"]);
    }
}
