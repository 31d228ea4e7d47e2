//! Inventory reconciliation.
//!
//! Brings the set of mirrored child devices in line with the session's
//! motor and counter inventory.  Per kind:
//!
//! ```text
//! to_create = session − mirrored
//! to_delete = mirrored − session
//! ```
//!
//! The plan is recomputed from scratch on every run, so running it twice
//! against an unchanged inventory does nothing the second time.  A failing
//! create or delete is recorded in the [`ReconcileReport`] and does not stop
//! the remaining elements.
//!
//! # Example
//!
//! ```rust
//! use std::collections::BTreeSet;
//! use tangospec_bridge::InventoryDiff;
//!
//! let session: BTreeSet<String> = ["A", "B"].map(String::from).into();
//! let mirrored: BTreeSet<String> = ["B", "C"].map(String::from).into();
//! let diff = InventoryDiff::compute(&session, &mirrored);
//! assert_eq!(diff.to_create, ["A"].map(String::from).into());
//! assert_eq!(diff.to_delete, ["C"].map(String::from).into());
//! ```

use std::collections::BTreeSet;

use tangospec_types::{BridgeError, ElementKind};
use tracing::{info, warn};

// ─────────────────────────────────────────────────────────────────────────────
// Plan
// ─────────────────────────────────────────────────────────────────────────────

/// Set difference for one element kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InventoryDiff {
    pub to_create: BTreeSet<String>,
    pub to_delete: BTreeSet<String>,
}

impl InventoryDiff {
    pub fn compute(session: &BTreeSet<String>, mirrored: &BTreeSet<String>) -> Self {
        Self {
            to_create: session.difference(mirrored).cloned().collect(),
            to_delete: mirrored.difference(session).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_delete.is_empty()
    }
}

/// Motor and counter diffs, computed independently.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub motors: InventoryDiff,
    pub counters: InventoryDiff,
}

impl ReconcilePlan {
    pub fn compute(
        session_motors: &BTreeSet<String>,
        session_counters: &BTreeSet<String>,
        mirrored_motors: &BTreeSet<String>,
        mirrored_counters: &BTreeSet<String>,
    ) -> Self {
        Self {
            motors: InventoryDiff::compute(session_motors, mirrored_motors),
            counters: InventoryDiff::compute(session_counters, mirrored_counters),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.motors.is_empty() && self.counters.is_empty()
    }

    /// Run the plan against `target`, collecting per-element outcomes.
    pub fn apply(&self, target: &dyn InventoryTarget) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for (kind, diff) in [
            (ElementKind::Motor, &self.motors),
            (ElementKind::Counter, &self.counters),
        ] {
            for mnemonic in &diff.to_create {
                match target.create(kind, mnemonic) {
                    Ok(()) => report.created.push((kind, mnemonic.clone())),
                    Err(e) => {
                        warn!(kind = %kind, mnemonic = %mnemonic, error = %e, "reconcile: create failed");
                        report.failures.push((kind, mnemonic.clone(), e));
                    }
                }
            }
            for mnemonic in &diff.to_delete {
                match target.delete(kind, mnemonic) {
                    Ok(()) => report.deleted.push((kind, mnemonic.clone())),
                    Err(e) => {
                        warn!(kind = %kind, mnemonic = %mnemonic, error = %e, "reconcile: delete failed");
                        report.failures.push((kind, mnemonic.clone(), e));
                    }
                }
            }
        }
        report
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Target
// ─────────────────────────────────────────────────────────────────────────────

/// The two inventories and the create/delete primitives.
pub trait InventoryTarget {
    /// Mnemonics the session currently has.
    fn session_inventory(&self, kind: ElementKind) -> Result<BTreeSet<String>, BridgeError>;

    /// Mnemonics currently mirrored as child devices.
    fn mirrored_inventory(&self, kind: ElementKind) -> Result<BTreeSet<String>, BridgeError>;

    fn create(&self, kind: ElementKind, mnemonic: &str) -> Result<(), BridgeError>;

    /// # Errors
    ///
    /// [`BridgeError::NotFound`] when no child mirrors `mnemonic`.
    fn delete(&self, kind: ElementKind, mnemonic: &str) -> Result<(), BridgeError>;
}

/// What a reconciliation run did.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub created: Vec<(ElementKind, String)>,
    pub deleted: Vec<(ElementKind, String)>,
    pub failures: Vec<(ElementKind, String, BridgeError)>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.deleted.is_empty() && self.failures.is_empty()
    }
}

/// Query both inventories of `target` and apply the difference.
///
/// Fails only when an inventory cannot be read; per-element failures are
/// in the report.
pub fn reconcile(target: &dyn InventoryTarget) -> Result<ReconcileReport, BridgeError> {
    let plan = ReconcilePlan::compute(
        &target.session_inventory(ElementKind::Motor)?,
        &target.session_inventory(ElementKind::Counter)?,
        &target.mirrored_inventory(ElementKind::Motor)?,
        &target.mirrored_inventory(ElementKind::Counter)?,
    );
    let report = plan.apply(target);
    info!(
        created = report.created.len(),
        deleted = report.deleted.len(),
        failed = report.failures.len(),
        "inventory reconciled"
    );
    Ok(report)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    struct Fake {
        session_motors: BTreeSet<String>,
        session_counters: BTreeSet<String>,
        motors: Mutex<BTreeSet<String>>,
        counters: Mutex<BTreeSet<String>>,
        broken_delete: Option<String>,
    }

    impl Fake {
        fn mirrored(&self, kind: ElementKind) -> &Mutex<BTreeSet<String>> {
            match kind {
                ElementKind::Counter => &self.counters,
                _ => &self.motors,
            }
        }
    }

    impl InventoryTarget for Fake {
        fn session_inventory(&self, kind: ElementKind) -> Result<BTreeSet<String>, BridgeError> {
            Ok(match kind {
                ElementKind::Counter => self.session_counters.clone(),
                _ => self.session_motors.clone(),
            })
        }
        fn mirrored_inventory(&self, kind: ElementKind) -> Result<BTreeSet<String>, BridgeError> {
            Ok(self.mirrored(kind).lock().clone())
        }
        fn create(&self, kind: ElementKind, mnemonic: &str) -> Result<(), BridgeError> {
            self.mirrored(kind).lock().insert(mnemonic.to_string());
            Ok(())
        }
        fn delete(&self, kind: ElementKind, mnemonic: &str) -> Result<(), BridgeError> {
            if self.broken_delete.as_deref() == Some(mnemonic) {
                return Err(BridgeError::not_found(kind.as_str(), mnemonic));
            }
            self.mirrored(kind).lock().remove(mnemonic);
            Ok(())
        }
    }

    #[test]
    fn diff_is_plain_set_difference() {
        let diff = InventoryDiff::compute(&set(&["A", "B"]), &set(&["B", "C"]));
        assert_eq!(diff.to_create, set(&["A"]));
        assert_eq!(diff.to_delete, set(&["C"]));

        let same = InventoryDiff::compute(&set(&["A", "B"]), &set(&["A", "B"]));
        assert!(same.is_empty());
    }

    #[test]
    fn kinds_are_reconciled_independently() {
        let plan = ReconcilePlan::compute(
            &set(&["th"]),
            &set(&["th"]),
            &set(&[]),
            &set(&["th"]),
        );
        assert_eq!(plan.motors.to_create, set(&["th"]));
        assert!(plan.counters.is_empty());
    }

    #[test]
    fn second_run_is_a_noop() {
        let fake = Fake {
            session_motors: set(&["th", "tth"]),
            session_counters: set(&["sec"]),
            motors: Mutex::new(set(&["chi", "th"])),
            counters: Mutex::new(set(&[])),
            broken_delete: None,
        };
        let first = reconcile(&fake).unwrap();
        assert_eq!(first.created.len(), 2);
        assert_eq!(first.deleted, vec![(ElementKind::Motor, "chi".to_string())]);
        assert_eq!(*fake.motors.lock(), set(&["th", "tth"]));

        let second = reconcile(&fake).unwrap();
        assert!(second.is_noop());
    }

    #[test]
    fn failed_delete_does_not_block_others() {
        let fake = Fake {
            session_motors: set(&[]),
            session_counters: set(&["sec"]),
            motors: Mutex::new(set(&["a", "b"])),
            counters: Mutex::new(set(&[])),
            broken_delete: Some("a".to_string()),
        };
        let report = reconcile(&fake).unwrap();
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(report.failures[0].2, BridgeError::NotFound { .. }));
        assert_eq!(report.deleted, vec![(ElementKind::Motor, "b".to_string())]);
        assert_eq!(report.created, vec![(ElementKind::Counter, "sec".to_string())]);
    }
}
