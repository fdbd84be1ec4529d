use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::{diagnostics::SourceSpan, value::Value};

pub type ScopeRef = Arc<Scope>;

/// A lexical scope: variable bindings plus the label and span it was entered
/// with, used to build tracebacks while unwinding.
#[derive(Debug)]
pub struct Scope {
    parent: Option<ScopeRef>,
    label: String,
    entry: Option<SourceSpan>,
    bindings: RwLock<IndexMap<String, Value>>,
}

impl Scope {
    pub fn root(label: impl Into<String>) -> ScopeRef {
        Arc::new(Self {
            parent: None,
            label: label.into(),
            entry: None,
            bindings: RwLock::new(IndexMap::new()),
        })
    }

    pub fn child(parent: &ScopeRef, label: impl Into<String>, entry: Option<SourceSpan>) -> ScopeRef {
        Arc::new(Self {
            parent: Some(Arc::clone(parent)),
            label: label.into(),
            entry,
            bindings: RwLock::new(IndexMap::new()),
        })
    }

    pub fn parent(&self) -> Option<&ScopeRef> {
        self.parent.as_ref()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn entry(&self) -> Option<&SourceSpan> {
        self.entry.as_ref()
    }

    /// Binds `name` in this scope, shadowing any outer binding.
    pub fn define(&self, name: impl Into<String>, value: Value) {
        self.bindings.write().insert(name.into(), value);
    }

    /// Rebinds the nearest existing `name`. Returns `false` when no scope has it.
    pub fn assign(&self, name: &str, value: Value) -> bool {
        let mut current = Some(self);
        while let Some(scope) = current {
            if let Some(slot) = scope.bindings.write().get_mut(name) {
                *slot = value;
                return true;
            }
            current = scope.parent.as_deref();
        }
        false
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        let mut current = Some(self);
        while let Some(scope) = current {
            if let Some(value) = scope.bindings.read().get(name) {
                return Some(value.clone());
            }
            current = scope.parent.as_deref();
        }
        None
    }

    pub fn contains_local(&self, name: &str) -> bool {
        self.bindings.read().contains_key(name)
    }

    /// Names bound directly in this scope, in definition order.
    pub fn names(&self) -> Vec<String> {
        self.bindings.read().keys().cloned().collect()
    }

    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self.parent.as_deref();
        while let Some(scope) = current {
            depth += 1;
            current = scope.parent.as_deref();
        }
        depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_walks_to_parents() {
        let root = Scope::root("<program>");
        root.define("x", Value::number(1.0));
        let child = Scope::child(&root, "block", None);
        assert_eq!(child.get("x"), Some(Value::number(1.0)));
        assert!(child.get("missing").is_none());
        assert_eq!(child.depth(), 1);
    }

    #[test]
    fn assign_updates_the_defining_scope() {
        let root = Scope::root("<program>");
        root.define("x", Value::number(1.0));
        let child = Scope::child(&root, "block", None);
        assert!(child.assign("x", Value::number(2.0)));
        assert_eq!(root.get("x"), Some(Value::number(2.0)));
        assert!(!child.contains_local("x"));
        assert!(!child.assign("y", Value::null()));
    }

    #[test]
    fn shadowing_stays_local() {
        let root = Scope::root("<program>");
        root.define("x", Value::number(1.0));
        let child = Scope::child(&root, "block", None);
        child.define("x", Value::number(5.0));
        assert_eq!(child.get("x"), Some(Value::number(5.0)));
        assert_eq!(root.get("x"), Some(Value::number(1.0)));
        assert_eq!(root.names(), vec!["x".to_string()]);
    }
}
