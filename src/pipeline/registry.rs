//! Copy-on-write stage registry.
//!
//! # Design Decisions
//! - Stages live in an `IndexMap` keyed by name: evaluation follows registration
//!   order and re-registering a name replaces the operation in place
//! - The map sits behind `ArcSwap`; traversals load a snapshot and never block
//!   registration, and registration never disturbs an in-flight traversal

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use indexmap::IndexMap;

/// Stage kinds. Request and response pipelines use the same kinds but run
/// them in different orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Filter,
    Validator,
    Transformer,
    Enricher,
}

impl StageKind {
    pub const ALL: [StageKind; 4] = [
        StageKind::Filter,
        StageKind::Validator,
        StageKind::Transformer,
        StageKind::Enricher,
    ];
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StageKind::Filter => "filter",
            StageKind::Validator => "validator",
            StageKind::Transformer => "transformer",
            StageKind::Enricher => "enricher",
        })
    }
}

/// A named operation plus its enabled flag.
pub struct Stage<F: ?Sized> {
    pub operation: Arc<F>,
    pub enabled: bool,
}

impl<F: ?Sized> Clone for Stage<F> {
    fn clone(&self) -> Self {
        Self {
            operation: self.operation.clone(),
            enabled: self.enabled,
        }
    }
}

pub type StageMap<F> = IndexMap<String, Stage<F>>;

pub struct StageRegistry<F: ?Sized> {
    stages: ArcSwap<StageMap<F>>,
}

impl<F: ?Sized> Default for StageRegistry<F> {
    fn default() -> Self {
        Self {
            stages: ArcSwap::from_pointee(IndexMap::new()),
        }
    }
}

impl<F: ?Sized> StageRegistry<F> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace `name`. A replaced stage keeps its position and is re-enabled.
    pub fn insert(&self, name: &str, operation: Arc<F>) {
        self.stages.rcu(|current| {
            let mut next = StageMap::clone(current);
            next.insert(
                name.to_string(),
                Stage {
                    operation: operation.clone(),
                    enabled: true,
                },
            );
            next
        });
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut removed = false;
        self.stages.rcu(|current| {
            let mut next = StageMap::clone(current);
            removed = next.shift_remove(name).is_some();
            next
        });
        removed
    }

    pub fn clear(&self) {
        self.stages.store(Arc::new(IndexMap::new()));
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut found = false;
        self.stages.rcu(|current| {
            let mut next = StageMap::clone(current);
            found = match next.get_mut(name) {
                Some(stage) => {
                    stage.enabled = enabled;
                    true
                }
                None => false,
            };
            next
        });
        found
    }

    /// Current stages, in evaluation order.
    pub fn snapshot(&self) -> Arc<StageMap<F>> {
        self.stages.load_full()
    }

    pub fn names(&self) -> Vec<String> {
        self.stages.load().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.stages.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Op = dyn Fn(u32) -> u32 + Send + Sync;

    fn op(f: impl Fn(u32) -> u32 + Send + Sync + 'static) -> Arc<Op> {
        Arc::new(f)
    }

    #[test]
    fn test_insertion_order_and_replace_in_place() {
        let registry: StageRegistry<Op> = StageRegistry::new();
        registry.insert("a", op(|x| x + 1));
        registry.insert("b", op(|x| x * 2));
        registry.insert("c", op(|x| x));
        registry.insert("a", op(|x| x + 100));

        assert_eq!(registry.names(), vec!["a", "b", "c"]);
        assert_eq!(registry.len(), 3);
        let snapshot = registry.snapshot();
        assert_eq!((snapshot["a"].operation)(1), 101);
    }

    #[test]
    fn test_remove_keeps_order() {
        let registry: StageRegistry<Op> = StageRegistry::new();
        for name in ["a", "b", "c"] {
            registry.insert(name, op(|x| x));
        }
        assert!(registry.remove("b"));
        assert!(!registry.remove("missing"));
        assert_eq!(registry.names(), vec!["a", "c"]);

        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_edits() {
        let registry: StageRegistry<Op> = StageRegistry::new();
        registry.insert("a", op(|x| x));
        let snapshot = registry.snapshot();

        registry.insert("b", op(|x| x));
        assert!(registry.set_enabled("a", false));
        assert!(!registry.set_enabled("missing", false));

        assert_eq!(snapshot.len(), 1);
        assert!(snapshot["a"].enabled);
        assert!(!registry.snapshot()["a"].enabled);
    }
}
