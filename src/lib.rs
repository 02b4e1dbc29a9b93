use pgrx::prelude::*;
use pgrx::JsonB;

pub mod capture;
pub mod catalog;
pub mod config;
pub mod ddl;
pub mod dependency;
pub mod error;
pub mod orchestrator;
pub mod session;

#[cfg(test)]
mod testing;

pub use error::{DepsError, DepsResult};

use catalog::SpiCatalog;
use config::MigrationConfig;
use ddl::{QualifiedName, SpiExecutor};
use session::persistence::{self, SessionEnvelope};
use session::{registry, Phase};

pg_module_magic!();

/// Initialize the extension
/// Registers the `pg_mvdeps.*` settings
#[pg_guard]
extern "C" fn _PG_init() {
    config::guc::register();
}

/// Raise `e` as a PostgreSQL ERROR with its SQLSTATE
fn raise(e: &DepsError) -> ! {
    ereport!(ERROR, e.error_code(), e.to_string());
}

fn or_raise<T>(result: DepsResult<T>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => raise(&e),
    }
}

fn root_key(root: &str, config: &MigrationConfig) -> QualifiedName {
    or_raise(QualifiedName::parse(root, &config.schema))
}

/// Get the version of the pg_mvdeps extension
#[pg_extern]
fn mvdeps_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Phase 1: capture the dependents of `root` and drop them
///
/// Returns a summary of what was captured. The session stays in this
/// backend until `mvdeps_restore()` or `mvdeps_discard()`.
#[pg_extern]
fn mvdeps_prepare(root: &str) -> JsonB {
    let config = or_raise(MigrationConfig::from_gucs());
    let mut session = or_raise(orchestrator::capture(&SpiCatalog, &config, root));

    if let Some(existing) = registry::get(&session.root) {
        if existing.holds_torn_down_state() {
            raise(&DepsError::SessionAlreadyActive { root: session.root.to_string() });
        }
    }

    if !session.root_found {
        warning!("pg_mvdeps: relation {} does not exist, nothing to prepare", session.root);
    }

    let mut executor = SpiExecutor::new();
    if let Err(e) = orchestrator::teardown(&mut executor, &mut session) {
        if let Some(failure) = session.failure.clone() {
            registry::record_failure(&session.root, failure);
        }
        raise(&e);
    }

    if session.phase == Phase::Captured {
        info!(
            "pg_mvdeps: prepared {}: {} dependents and {} policies dropped ({} statements)",
            session.root,
            session.store.relation_count(),
            session.store.policies.len(),
            executor.executed()
        );
    }

    let summary = session.summary();
    registry::track_transaction();
    registry::clear_failure(&session.root);
    registry::insert(session);
    JsonB(summary)
}

/// Phase 2: rebuild the dependents captured by `mvdeps_prepare(root)`
#[pg_extern]
fn mvdeps_restore(root: &str) {
    let config = or_raise(MigrationConfig::from_gucs());
    let key = root_key(root, &config);

    registry::track_transaction();
    let Some(mut session) = registry::take(&key) else {
        notice!("pg_mvdeps: no captured state for {}, nothing to restore", key);
        return;
    };

    let attempt = session.clone();
    let relations = session.store.relation_count();
    let mut executor = SpiExecutor::new();

    match orchestrator::restore(&mut executor, &config, &mut session) {
        Ok(()) => {
            registry::clear_failure(&key);
            if relations > 0 {
                info!(
                    "pg_mvdeps: restored {} dependents of {} ({} statements)",
                    relations,
                    key,
                    executor.executed()
                );
            }
        }
        Err(e) => {
            // the failed statements roll back with the error. A caught
            // error keeps the pre-attempt capture marked Failed; on abort the
            // snapshot brings it back as Captured and the report stays in
            // last_failure. Either way restore can be retried.
            let mut retained = attempt;
            retained.phase = Phase::Failed;
            retained.failure = session.failure.clone();
            if let Some(failure) = session.failure {
                registry::record_failure(&key, failure);
            }
            registry::insert(retained);
            raise(&e);
        }
    }
}

/// Dependency closure of `root` without changing anything
#[pg_extern]
fn mvdeps_closure(
    root: &str,
) -> TableIterator<'static, (name!(level, i32), name!(relation, String), name!(kind, String))> {
    let config = or_raise(MigrationConfig::from_gucs());
    let found = or_raise(orchestrator::closure(&SpiCatalog, &config, root));

    let rows: Vec<_> = found
        .into_iter()
        .map(|d| {
            let level = or_raise(
                i32::try_from(d.level).map_err(|_| crate::internal_error!("level {} out of range", d.level)),
            );
            (level, d.name.to_string(), d.kind.to_string())
        })
        .collect();

    TableIterator::new(rows)
}

/// Full session for `root` (store, journal, failure), or NULL
#[pg_extern]
fn mvdeps_session(root: &str) -> Option<JsonB> {
    let config = or_raise(MigrationConfig::from_gucs());
    let key = root_key(root, &config);
    let last_failure = registry::last_failure(&key);

    match registry::get(&key) {
        Some(session) => {
            let JsonB(mut json) = or_raise(persistence::to_jsonb(&session));
            if let Some(object) = json.as_object_mut() {
                object.insert(
                    "last_failure".to_string(),
                    or_raise(serde_json::to_value(last_failure).map_err(DepsError::from)),
                );
            }
            Some(JsonB(json))
        }
        None => last_failure.map(|failure| {
            JsonB(serde_json::json!({
                "root": key.to_string(),
                "last_failure": failure,
            }))
        }),
    }
}

/// Roots with a session in this backend
#[pg_extern]
fn mvdeps_sessions() -> Vec<String> {
    registry::roots().iter().map(ToString::to_string).collect()
}

/// Drop the session for `root` without restoring it
#[pg_extern]
fn mvdeps_discard(root: &str) -> bool {
    let config = or_raise(MigrationConfig::from_gucs());
    let key = root_key(root, &config);

    registry::track_transaction();
    let discarded = registry::discard(&key);
    if discarded {
        info!("pg_mvdeps: discarded session for {}", key);
    }
    discarded
}

/// Session for `root` as a portable compressed blob, or NULL
#[pg_extern]
fn mvdeps_export(root: &str) -> Option<Vec<u8>> {
    let config = or_raise(MigrationConfig::from_gucs());
    let key = root_key(root, &config);

    registry::get(&key).map(|session| or_raise(SessionEnvelope::new(session).to_bytes()))
}

/// Install a session produced by `mvdeps_export()`; returns its root
#[pg_extern]
fn mvdeps_import(data: &[u8]) -> String {
    let envelope = or_raise(SessionEnvelope::from_bytes(data));
    let root = envelope.session.root.clone();

    if let Some(existing) = registry::get(&root) {
        if existing.holds_torn_down_state() {
            raise(&DepsError::SessionAlreadyActive { root: root.to_string() });
        }
    }

    registry::track_transaction();
    registry::insert(envelope.session);
    info!(
        "pg_mvdeps: imported session for {} exported at {}",
        root, envelope.exported_at
    );
    root.to_string()
}

#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod tests {
    use pgrx::prelude::*;
    use pgrx::{IntoDatum, JsonB};

    fn prepare(root: &str) -> serde_json::Value {
        let sql = format!("SELECT mvdeps_prepare('{root}')");
        Spi::get_one::<JsonB>(&sql).unwrap().unwrap().0
    }

    fn exists(relation: &str) -> bool {
        let sql = format!("SELECT to_regclass('{relation}') IS NOT NULL");
        Spi::get_one::<bool>(&sql).unwrap().unwrap()
    }

    fn viewdef(relation: &str) -> String {
        let sql = format!("SELECT pg_get_viewdef('{relation}'::regclass, true)");
        Spi::get_one::<String>(&sql).unwrap().unwrap()
    }

    fn populated(relation: &str) -> bool {
        let sql = format!("SELECT relispopulated FROM pg_class WHERE oid = '{relation}'::regclass");
        Spi::get_one::<bool>(&sql).unwrap().unwrap()
    }

    fn sales_fixture() {
        Spi::run("CREATE TABLE public.tb_e2e_sale (id INT PRIMARY KEY, amount INT)").unwrap();
        Spi::run("INSERT INTO public.tb_e2e_sale VALUES (1, 10), (2, 20)").unwrap();
        Spi::run("CREATE MATERIALIZED VIEW public.mvw_e2e_root AS SELECT id, amount FROM public.tb_e2e_sale")
            .unwrap();
        Spi::run("CREATE VIEW public.v_e2e_a AS SELECT id, amount FROM public.mvw_e2e_root").unwrap();
        Spi::run(
            "CREATE MATERIALIZED VIEW public.mvw_e2e_b AS SELECT id, amount * 2 AS doubled FROM public.v_e2e_a",
        )
        .unwrap();
        Spi::run("CREATE MATERIALIZED VIEW public.report_e2e_c AS SELECT id FROM public.v_e2e_a").unwrap();
    }

    #[pg_test]
    fn test_version() {
        let version = Spi::get_one::<String>("SELECT mvdeps_version()").unwrap().unwrap();
        assert_eq!(version, env!("CARGO_PKG_VERSION"));
    }

    #[pg_test]
    fn test_prepare_redefine_restore() {
        sales_fixture();
        Spi::run("CREATE UNIQUE INDEX mvw_e2e_b_id ON public.mvw_e2e_b (id)").unwrap();
        Spi::run("COMMENT ON VIEW public.v_e2e_a IS 'passthrough'").unwrap();
        Spi::run("GRANT SELECT ON public.v_e2e_a TO PUBLIC").unwrap();
        let before = viewdef("public.mvw_e2e_b");

        let summary = prepare("mvw_e2e_root");
        assert_eq!(summary["phase"], "captured");
        assert_eq!(summary["relations"], 3);
        assert_eq!(summary["indexes"], 1);
        assert!(!exists("public.v_e2e_a"));
        assert!(!exists("public.mvw_e2e_b"));

        Spi::run("DROP MATERIALIZED VIEW public.mvw_e2e_root").unwrap();
        Spi::run(
            "CREATE MATERIALIZED VIEW public.mvw_e2e_root AS \
             SELECT id, amount, amount + 1 AS bumped FROM public.tb_e2e_sale",
        )
        .unwrap();

        Spi::run("SELECT mvdeps_restore('mvw_e2e_root')").unwrap();

        assert_eq!(viewdef("public.mvw_e2e_b"), before);
        assert!(exists("public.mvw_e2e_b_id"));

        let comment = Spi::get_one::<String>("SELECT obj_description('public.v_e2e_a'::regclass, 'pg_class')")
            .unwrap()
            .unwrap();
        assert_eq!(comment, "passthrough");

        let public_select = Spi::get_one::<bool>(
            "SELECT EXISTS (SELECT 1 FROM pg_class c, aclexplode(c.relacl) a \
             WHERE c.oid = 'public.v_e2e_a'::regclass AND a.grantee = 0 AND a.privilege_type = 'SELECT')",
        )
        .unwrap()
        .unwrap();
        assert!(public_select);

        // mvw_ prefix is refreshed, report_ is populated by its create
        assert!(populated("public.mvw_e2e_b"));
        assert!(populated("public.report_e2e_c"));

        let count = Spi::get_one::<i64>("SELECT count(*) FROM public.mvw_e2e_b").unwrap().unwrap();
        assert_eq!(count, 2);

        let sessions = Spi::get_one::<Vec<String>>("SELECT mvdeps_sessions()").unwrap().unwrap();
        assert!(sessions.is_empty());
    }

    #[pg_test]
    fn test_prefixed_view_over_report_view() {
        Spi::run("CREATE TABLE public.tb_e2e_chain (id INT)").unwrap();
        Spi::run("INSERT INTO public.tb_e2e_chain VALUES (1), (2), (3)").unwrap();
        Spi::run("CREATE MATERIALIZED VIEW public.mvw_e2e_chain AS SELECT id FROM public.tb_e2e_chain").unwrap();
        Spi::run("CREATE MATERIALIZED VIEW public.report_e2e_a AS SELECT id FROM public.mvw_e2e_chain").unwrap();
        Spi::run("CREATE MATERIALIZED VIEW public.mvw_e2e_chain_b AS SELECT id FROM public.report_e2e_a").unwrap();

        prepare("mvw_e2e_chain");
        Spi::run("SELECT mvdeps_restore('mvw_e2e_chain')").unwrap();

        assert!(populated("public.report_e2e_a"));
        assert!(populated("public.mvw_e2e_chain_b"));
        let count = Spi::get_one::<i64>("SELECT count(*) FROM public.mvw_e2e_chain_b").unwrap().unwrap();
        assert_eq!(count, 3);
    }

    #[pg_test]
    fn test_prepare_missing_root() {
        let summary = prepare("public.mvw_e2e_nowhere");
        assert_eq!(summary["root_found"], false);
        assert_eq!(summary["phase"], "completed");
        assert_eq!(summary["relations"], 0);
    }

    #[pg_test]
    fn test_restore_without_session_is_noop() {
        Spi::run("SELECT mvdeps_restore('public.mvw_e2e_never_prepared')").unwrap();
    }

    #[pg_test]
    fn test_zero_dependents() {
        Spi::run("CREATE TABLE public.tb_e2e_lonely (id INT)").unwrap();
        Spi::run("CREATE MATERIALIZED VIEW public.mvw_e2e_lonely AS SELECT id FROM public.tb_e2e_lonely")
            .unwrap();

        let summary = prepare("mvw_e2e_lonely");
        assert_eq!(summary["phase"], "completed");
        assert_eq!(summary["statements"], 0);

        Spi::run("SELECT mvdeps_restore('mvw_e2e_lonely')").unwrap();
        assert!(exists("public.mvw_e2e_lonely"));
    }

    #[pg_test]
    #[should_panic(expected = "already torn down")]
    fn test_second_prepare_refused() {
        sales_fixture();
        prepare("mvw_e2e_root");
        prepare("mvw_e2e_root");
    }

    #[pg_test]
    fn test_closure_preview() {
        sales_fixture();

        let rows: Vec<(i32, String, String)> = Spi::connect(|client| {
            client
                .select(
                    "SELECT level, relation, kind FROM mvdeps_closure('mvw_e2e_root') ORDER BY level, relation",
                    None,
                    None,
                )
                .unwrap()
                .map(|row| {
                    (
                        row["level"].value::<i32>().unwrap().unwrap(),
                        row["relation"].value::<String>().unwrap().unwrap(),
                        row["kind"].value::<String>().unwrap().unwrap(),
                    )
                })
                .collect()
        });

        assert_eq!(
            rows,
            vec![
                (1, "public.v_e2e_a".to_string(), "view".to_string()),
                (2, "public.mvw_e2e_b".to_string(), "materialized view".to_string()),
                (2, "public.report_e2e_c".to_string(), "materialized view".to_string()),
            ]
        );
        // nothing was dropped
        assert!(exists("public.v_e2e_a"));
    }

    #[pg_test]
    fn test_session_inspection_and_discard() {
        sales_fixture();
        prepare("mvw_e2e_root");

        let session = Spi::get_one::<JsonB>("SELECT mvdeps_session('mvw_e2e_root')")
            .unwrap()
            .unwrap()
            .0;
        assert_eq!(session["phase"], "captured");
        assert_eq!(session["store"]["relations"].as_array().unwrap().len(), 3);
        assert!(session["last_failure"].is_null());

        let discarded = Spi::get_one::<bool>("SELECT mvdeps_discard('mvw_e2e_root')").unwrap().unwrap();
        assert!(discarded);
        let none = Spi::get_one::<JsonB>("SELECT mvdeps_session('mvw_e2e_root')").unwrap();
        assert!(none.is_none());
    }

    #[pg_test]
    fn test_export_import_then_restore() {
        sales_fixture();
        prepare("mvw_e2e_root");

        let blob = Spi::get_one::<Vec<u8>>("SELECT mvdeps_export('mvw_e2e_root')").unwrap().unwrap();
        Spi::run("SELECT mvdeps_discard('mvw_e2e_root')").unwrap();

        let root = Spi::get_one_with_args::<String>(
            "SELECT mvdeps_import($1)",
            vec![(PgOid::BuiltIn(PgBuiltInOids::BYTEAOID), blob.into_datum())],
        )
        .unwrap()
        .unwrap();
        assert_eq!(root, "public.mvw_e2e_root");

        Spi::run("SELECT mvdeps_restore('mvw_e2e_root')").unwrap();
        assert!(exists("public.v_e2e_a"));
        assert!(exists("public.mvw_e2e_b"));
    }

    #[pg_test]
    #[should_panic(expected = "Unsupported session envelope version")]
    fn test_import_rejects_foreign_version() {
        use crate::session::persistence::{SessionEnvelope, ENVELOPE_VERSION};
        use crate::session::MigrationSession;

        let mut envelope = SessionEnvelope::new(MigrationSession::new(crate::ddl::QualifiedName::new(
            "public",
            "mvw_e2e_future",
        )));
        envelope.version = ENVELOPE_VERSION + 1;
        let blob = envelope.to_bytes().unwrap();

        Spi::get_one_with_args::<String>(
            "SELECT mvdeps_import($1)",
            vec![(PgOid::BuiltIn(PgBuiltInOids::BYTEAOID), blob.into_datum())],
        )
        .unwrap();
    }
}
