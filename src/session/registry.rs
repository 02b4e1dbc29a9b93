use std::cell::RefCell;
use std::collections::BTreeMap;

use pgrx::{register_xact_callback, PgXactCallbackEvent};

use super::{FailureReport, MigrationSession};
use crate::ddl::QualifiedName;

type Sessions = BTreeMap<QualifiedName, MigrationSession>;

thread_local! {
    /// Backend-local sessions, keyed by canonical root name
    ///
    /// - Filled by `mvdeps_prepare()` / `mvdeps_import()`
    /// - An entry is removed when its restore succeeds or it is discarded
    /// - Dies with the backend, i.e. with the client connection
    static SESSIONS: RefCell<Sessions> = const { RefCell::new(BTreeMap::new()) };

    /// Registry contents at the first change in the current transaction
    static SNAPSHOT: RefCell<Option<Sessions>> = const { RefCell::new(None) };

    /// Last failure per root; not rolled back with the transaction
    static FAILURES: RefCell<BTreeMap<QualifiedName, FailureReport>> =
        const { RefCell::new(BTreeMap::new()) };
}

/// Make the registry follow the current transaction
///
/// Call before the first change in a transaction. On abort the registry goes
/// back to its contents at that point, matching the catalog after rollback.
pub fn track_transaction() {
    let first_change = SNAPSHOT.with(|snapshot| {
        let mut snapshot = snapshot.borrow_mut();
        if snapshot.is_some() {
            return false;
        }
        *snapshot = Some(SESSIONS.with(|s| s.borrow().clone()));
        true
    });

    if first_change {
        register_xact_callback(PgXactCallbackEvent::Abort, rollback_to_snapshot);
        register_xact_callback(PgXactCallbackEvent::Commit, forget_snapshot);
    }
}

fn rollback_to_snapshot() {
    if let Some(previous) = SNAPSHOT.with(|s| s.borrow_mut().take()) {
        SESSIONS.with(|s| *s.borrow_mut() = previous);
    }
}

fn forget_snapshot() {
    SNAPSHOT.with(|s| s.borrow_mut().take());
}

/// Store `session`, replacing any previous session for the same root
pub fn insert(session: MigrationSession) {
    SESSIONS.with(|s| {
        s.borrow_mut().insert(session.root.clone(), session);
    });
}

/// Copy of the session for `root`, if any
pub fn get(root: &QualifiedName) -> Option<MigrationSession> {
    SESSIONS.with(|s| s.borrow().get(root).cloned())
}

/// Remove and return the session for `root`
///
/// Restore takes the session out while it runs so no borrow is held across SPI.
pub fn take(root: &QualifiedName) -> Option<MigrationSession> {
    SESSIONS.with(|s| s.borrow_mut().remove(root))
}

pub fn discard(root: &QualifiedName) -> bool {
    clear_failure(root);
    take(root).is_some()
}

/// Roots with a live session, sorted
pub fn roots() -> Vec<QualifiedName> {
    SESSIONS.with(|s| s.borrow().keys().cloned().collect())
}

pub fn record_failure(root: &QualifiedName, failure: FailureReport) {
    FAILURES.with(|f| {
        f.borrow_mut().insert(root.clone(), failure);
    });
}

pub fn last_failure(root: &QualifiedName) -> Option<FailureReport> {
    FAILURES.with(|f| f.borrow().get(root).cloned())
}

pub fn clear_failure(root: &QualifiedName) {
    FAILURES.with(|f| {
        f.borrow_mut().remove(root);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Phase, Stage};

    #[test]
    fn test_insert_get_take() {
        let root = QualifiedName::new("public", "mvw_registry_test");
        insert(MigrationSession::new(root.clone()));

        assert!(get(&root).is_some());
        assert!(roots().contains(&root));

        let taken = take(&root).unwrap();
        assert_eq!(taken.root, root);
        assert!(get(&root).is_none());
        assert!(!discard(&root));
    }

    #[test]
    fn test_insert_replaces_same_root() {
        let root = QualifiedName::new("public", "mvw_registry_replace");
        insert(MigrationSession::new(root.clone()));
        insert(MigrationSession::empty(root.clone(), false));

        let stored = get(&root).unwrap();
        assert!(!stored.root_found);
        assert!(discard(&root));
    }

    #[test]
    fn test_abort_restores_snapshot() {
        let kept = QualifiedName::new("public", "mvw_registry_kept");
        let added = QualifiedName::new("public", "mvw_registry_added");
        insert(MigrationSession::new(kept.clone()));

        // what track_transaction() captures before the first change
        SNAPSHOT.with(|s| *s.borrow_mut() = Some(SESSIONS.with(|x| x.borrow().clone())));
        take(&kept);
        insert(MigrationSession::new(added.clone()));

        rollback_to_snapshot();

        assert!(get(&kept).is_some());
        assert!(get(&added).is_none());
        assert!(SNAPSHOT.with(|s| s.borrow().is_none()));
        discard(&kept);
    }

    #[test]
    fn test_abort_after_failed_restore_brings_back_captured() {
        let root = QualifiedName::new("public", "mvw_registry_retry");
        let mut captured = MigrationSession::new(root.clone());
        captured.phase = Phase::Captured;
        insert(captured);

        SNAPSHOT.with(|s| *s.borrow_mut() = Some(SESSIONS.with(|x| x.borrow().clone())));
        let mut failed = take(&root).unwrap();
        failed.phase = Phase::Failed;
        failed.failure = Some(restore_failure());
        record_failure(&root, restore_failure());
        insert(failed);

        rollback_to_snapshot();

        let restored = get(&root).unwrap();
        assert_eq!(restored.phase, Phase::Captured);
        assert!(restored.failure.is_none());
        assert!(restored.holds_torn_down_state());
        assert_eq!(last_failure(&root).unwrap().stage, Stage::Restore);
        discard(&root);
    }

    fn restore_failure() -> FailureReport {
        FailureReport {
            stage: Stage::Restore,
            step: "refresh".to_string(),
            relation: "public.mvw_b".to_string(),
            statement: "REFRESH MATERIALIZED VIEW public.mvw_b WITH DATA".to_string(),
            reason: "permission denied".to_string(),
        }
    }

    #[test]
    fn test_failures_survive_discard_of_other_roots() {
        let root = QualifiedName::new("public", "mvw_registry_failed");
        let other = QualifiedName::new("public", "mvw_registry_other");
        record_failure(
            &root,
            FailureReport {
                stage: Stage::Restore,
                step: "create_relation".to_string(),
                relation: "public.v_a".to_string(),
                statement: "CREATE VIEW public.v_a AS SELECT 1".to_string(),
                reason: "boom".to_string(),
            },
        );

        discard(&other);
        assert_eq!(last_failure(&root).unwrap().reason, "boom");

        discard(&root);
        assert!(last_failure(&root).is_none());
    }
}
