//! # Snapshot Diffing
//!
//! Live subscriptions deliver full result sets, never deltas. Consumers that
//! update a view incrementally diff consecutive snapshots with
//! [`SnapshotDiff::between`].

use std::collections::HashMap;

use crate::types::Entity;

/// Difference between two snapshots of the same query, keyed by entity id.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotDiff<T> {
    /// In `next`, not in `previous`. Order of `next`.
    pub added: Vec<T>,
    /// In both, with different content. Order of `next`.
    pub changed: Vec<T>,
    /// In `previous`, not in `next`. Order of `previous`.
    pub removed: Vec<T>,
}

impl<T: Entity + Clone + PartialEq> SnapshotDiff<T> {
    pub fn between(previous: &[T], next: &[T]) -> Self {
        let before: HashMap<&str, &T> = previous.iter().map(|e| (e.id(), e)).collect();
        let after: HashMap<&str, &T> = next.iter().map(|e| (e.id(), e)).collect();

        let mut added = Vec::new();
        let mut changed = Vec::new();
        for item in next {
            match before.get(item.id()) {
                None => added.push(item.clone()),
                Some(old) if *old != item => changed.push(item.clone()),
                Some(_) => {}
            }
        }

        let removed = previous
            .iter()
            .filter(|e| !after.contains_key(e.id()))
            .cloned()
            .collect();

        SnapshotDiff {
            added,
            changed,
            removed,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize_trade;
    use crate::types::Trade;
    use serde_json::json;

    fn trade(id: &str, pnl: &str) -> Trade {
        normalize_trade(json!({ "id": id, "pnl": pnl }).as_object().unwrap())
    }

    #[test]
    fn test_diff_classifies_changes() {
        let prev = vec![trade("a", "1"), trade("b", "2"), trade("c", "3")];
        let next = vec![trade("b", "2"), trade("c", "9"), trade("d", "0")];

        let diff = SnapshotDiff::between(&prev, &next);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].id, "d");
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.changed[0].pnl, "9");
        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.removed[0].id, "a");
    }

    #[test]
    fn test_identical_snapshots_have_empty_diff() {
        let snap = vec![trade("a", "1")];
        assert!(SnapshotDiff::between(&snap, &snap).is_empty());
    }
}
