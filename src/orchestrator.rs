//! Two-phase migration around a root redefinition
//!
//! Phase 1 ([`prepare`]) captures the dependent closure of the root and drops
//! it. The caller then drops/redefines the root. Phase 2 ([`restore`]) rebuilds
//! the closure from the captured definitions.
//!
//! Both phases stop at the first rejected statement. Statements that already
//! ran are not undone here; the surrounding transaction decides that.

use std::collections::HashSet;
use std::fmt;

use crate::capture::CaptureStore;
use crate::catalog::CatalogInspector;
use crate::config::MigrationConfig;
use crate::ddl::{DdlExecutor, QualifiedName, Statement};
use crate::dependency::{discover, DiscoveredRelation};
use crate::error::{DepsError, DepsResult};
use crate::session::{FailureReport, MigrationSession, Phase, Stage};

/// Parse `root` and look it up in the catalog
fn resolve_root(
    catalog: &impl CatalogInspector,
    config: &MigrationConfig,
    root: &str,
) -> DepsResult<(QualifiedName, Option<QualifiedName>)> {
    config.validate()?;
    let requested = QualifiedName::parse(root, &config.schema)?;
    let resolved = catalog.resolve(&requested)?;
    Ok((requested, resolved))
}

/// Dependency closure of `root`, without capturing or changing anything
pub fn closure(
    catalog: &impl CatalogInspector,
    config: &MigrationConfig,
    root: &str,
) -> DepsResult<Vec<DiscoveredRelation>> {
    match resolve_root(catalog, config, root)? {
        (_, Some(resolved)) => discover(catalog, config, &resolved),
        (requested, None) => Err(DepsError::RelationNotFound { relation: requested.to_string() }),
    }
}

/// Phase 1, steps 1-4: discover and capture, no schema changes
///
/// A root that does not exist yields an empty completed session with
/// `root_found = false`.
pub fn capture(
    catalog: &impl CatalogInspector,
    config: &MigrationConfig,
    root: &str,
) -> DepsResult<MigrationSession> {
    let (requested, resolved) = resolve_root(catalog, config, root)?;
    let Some(root) = resolved else {
        return Ok(MigrationSession::empty(requested, false));
    };

    let discovered = discover(catalog, config, &root)?;
    if discovered.is_empty() {
        return Ok(MigrationSession::empty(root, true));
    }

    let store = CaptureStore::populate(&root, &discovered, catalog)?;
    let mut session = MigrationSession::new(root);
    session.store = store;
    Ok(session)
}

/// Phase 1, steps 5-6: drop policies, then dependents deepest level first
pub fn teardown(executor: &mut impl DdlExecutor, session: &mut MigrationSession) -> DepsResult<()> {
    if session.phase != Phase::NotStarted {
        return Ok(());
    }
    if session.store.is_empty() {
        session.phase = Phase::Completed;
        return Ok(());
    }

    let mut statements: Vec<Statement> = session
        .store
        .policies
        .iter()
        .map(|p| p.drop_statement.clone())
        .collect();
    statements.extend(session.store.for_drop().into_iter().map(|n| n.drop_statement.clone()));

    for statement in &statements {
        run(executor, session, Stage::Prepare, statement)?;
    }

    session.phase = Phase::Captured;
    Ok(())
}

/// Why [`prepare`] stopped
#[derive(Debug)]
pub enum PrepareError {
    /// Discovery or capture failed; nothing was dropped
    Capture(DepsError),
    /// A drop was rejected. `session` holds the capture, the journal of the
    /// drops that ran and the failure report, and can be handed to [`restore`].
    Teardown {
        session: Box<MigrationSession>,
        error: DepsError,
    },
}

impl PrepareError {
    pub fn error(&self) -> &DepsError {
        match self {
            PrepareError::Capture(error) | PrepareError::Teardown { error, .. } => error,
        }
    }

    pub fn session(&self) -> Option<&MigrationSession> {
        match self {
            PrepareError::Capture(_) => None,
            PrepareError::Teardown { session, .. } => Some(&**session),
        }
    }

    pub fn into_session(self) -> Option<MigrationSession> {
        match self {
            PrepareError::Capture(_) => None,
            PrepareError::Teardown { session, .. } => Some(*session),
        }
    }
}

impl fmt::Display for PrepareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.error(), f)
    }
}

impl std::error::Error for PrepareError {}

impl From<PrepareError> for DepsError {
    fn from(e: PrepareError) -> Self {
        match e {
            PrepareError::Capture(error) | PrepareError::Teardown { error, .. } => error,
        }
    }
}

/// Phase 1: capture, then tear down
pub fn prepare(
    catalog: &impl CatalogInspector,
    executor: &mut impl DdlExecutor,
    config: &MigrationConfig,
    root: &str,
) -> Result<MigrationSession, PrepareError> {
    let mut session = capture(catalog, config, root).map_err(PrepareError::Capture)?;
    match teardown(executor, &mut session) {
        Ok(()) => Ok(session),
        Err(error) => Err(PrepareError::Teardown { session: Box::new(session), error }),
    }
}

/// Statements Phase 2 issues, in order
///
/// Per relation (shallowest first): create, its indexes when materialized,
/// comments, grants, a refresh when the refresh prefix matches, and the
/// owner. Policies follow once every relation exists.
///
/// Materialized views matching the refresh prefix are created empty and
/// refreshed; any other materialized view is populated by its create.
pub fn rebuild_plan(config: &MigrationConfig, store: &CaptureStore) -> Vec<Statement> {
    let mut plan = Vec::new();

    for node in store.for_rebuild() {
        let refresh = node.is_materialized() && config.should_refresh(&node.name);
        plan.push(node.create_statement.clone().with_data(!refresh));

        if node.is_materialized() {
            plan.extend(store.indexes_for(&node.name).map(|i| i.create_statement()));
        }
        plan.extend(store.comments_for(&node.name).map(|c| c.statement.clone()));
        plan.extend(store.grants_for(&node.name).map(|g| g.statement.clone()));

        if refresh {
            plan.push(Statement::RefreshMaterializedView { name: node.name.clone() });
        }
        plan.extend(store.owners_for(&node.name).map(|o| o.statement.clone()));
    }

    plan.extend(store.policies.iter().map(|p| p.create_statement.clone()));
    plan
}

/// Phase 2: rebuild the captured closure
///
/// No-op for a session with nothing captured or one already completed. A
/// session that failed in Phase 2 can be restored again once the cause is
/// fixed and the partial rebuild has been rolled back. A session that failed
/// in Phase 1 only rebuilds what its journal shows was dropped.
pub fn restore(
    executor: &mut impl DdlExecutor,
    config: &MigrationConfig,
    session: &mut MigrationSession,
) -> DepsResult<()> {
    if session.phase == Phase::Completed || session.store.is_empty() {
        return Ok(());
    }

    let plan = if session.failure.as_ref().is_some_and(|f| f.stage == Stage::Prepare) {
        let dropped: HashSet<&str> = session
            .journal
            .iter()
            .filter(|entry| entry.stage == Stage::Prepare)
            .map(|entry| entry.statement.as_str())
            .collect();
        rebuild_plan(config, &session.store.restricted_to(&dropped))
    } else {
        rebuild_plan(config, &session.store)
    };
    for statement in &plan {
        run(executor, session, Stage::Restore, statement)?;
    }

    session.store.clear();
    session.failure = None;
    session.phase = Phase::Completed;
    Ok(())
}

fn run(
    executor: &mut impl DdlExecutor,
    session: &mut MigrationSession,
    stage: Stage,
    statement: &Statement,
) -> DepsResult<()> {
    let sql = statement.render();

    match executor.execute(statement) {
        Ok(()) => {
            session.record(stage, statement, sql);
            Ok(())
        }
        Err(reason) => {
            let failure = FailureReport {
                stage,
                step: statement.step().to_string(),
                relation: statement.relation().to_string(),
                statement: sql,
                reason,
            };
            session.phase = Phase::Failed;
            session.failure = Some(failure.clone());

            Err(DepsError::DdlFailed {
                stage: failure.stage,
                step: statement.step(),
                relation: failure.relation,
                statement: failure.statement,
                reason: failure.reason,
            })
        }
    }
}
