//! Migration session: the state that lives between tear-down and rebuild
//!
//! A session is owned by whoever called prepare. Inside PostgreSQL that is the
//! backend-local [`registry`]; library callers hold it themselves.

pub mod persistence;
pub mod registry;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::capture::CaptureStore;
use crate::ddl::{QualifiedName, Statement};

/// Which half of the ritual a statement or failure belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Prepare,
    Restore,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Prepare => write!(f, "Phase 1 (prepare)"),
            Stage::Restore => write!(f, "Phase 2 (restore)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    NotStarted,
    /// Dependents dropped; waiting for the caller to redefine the root
    Captured,
    Completed,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::NotStarted => "not_started",
            Phase::Captured => "captured",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// A statement that completed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub stage: Stage,
    pub step: String,
    pub relation: String,
    pub statement: String,
}

/// The statement that stopped a phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub stage: Stage,
    pub step: String,
    pub relation: String,
    pub statement: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationSession {
    pub root: QualifiedName,
    /// False when the root did not exist at prepare time
    pub root_found: bool,
    pub phase: Phase,
    pub store: CaptureStore,
    pub journal: Vec<JournalEntry>,
    pub failure: Option<FailureReport>,
    pub created_at: String,
}

impl MigrationSession {
    pub fn new(root: QualifiedName) -> Self {
        Self {
            root,
            root_found: true,
            phase: Phase::NotStarted,
            store: CaptureStore::default(),
            journal: Vec::new(),
            failure: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Session for a root that has nothing to migrate
    pub fn empty(root: QualifiedName, root_found: bool) -> Self {
        Self {
            root_found,
            phase: Phase::Completed,
            ..Self::new(root)
        }
    }

    /// True while the captured definitions are the only copy of dropped objects
    ///
    /// A Phase 1 failure does not count: the server rolls the drops back with
    /// the failed statement.
    pub fn holds_torn_down_state(&self) -> bool {
        match self.phase {
            Phase::Captured => true,
            Phase::Failed => self
                .failure
                .as_ref()
                .is_some_and(|f| f.stage == Stage::Restore),
            Phase::NotStarted | Phase::Completed => false,
        }
    }

    pub(crate) fn record(&mut self, stage: Stage, statement: &Statement, sql: String) {
        self.journal.push(JournalEntry {
            stage,
            step: statement.step().to_string(),
            relation: statement.relation().to_string(),
            statement: sql,
        });
    }

    /// Compact description returned by `mvdeps_prepare()`
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "root": self.root.to_string(),
            "root_found": self.root_found,
            "phase": self.phase,
            "relations": self.store.relation_count(),
            "occurrences": self.store.relations.len(),
            "indexes": self.store.indexes.len(),
            "policies": self.store.policies.len(),
            "comments": self.store.comments.len(),
            "grants": self.store.grants.len(),
            "statements": self.journal.len(),
            "failure": self.failure,
        })
    }
}
