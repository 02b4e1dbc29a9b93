use std::ffi::CStr;

use pgrx::{GucContext, GucFlags, GucRegistry, GucSetting};

pub const SCHEMA_GUC: &str = "pg_mvdeps.schema";
pub const REFRESH_PREFIX_GUC: &str = "pg_mvdeps.refresh_prefix";

static SCHEMA: GucSetting<Option<&'static CStr>> =
    GucSetting::<Option<&'static CStr>>::new(Some(c"public"));

static REFRESH_PREFIX: GucSetting<Option<&'static CStr>> =
    GucSetting::<Option<&'static CStr>>::new(Some(c"mvw"));

/// Register the `pg_mvdeps.*` settings; called once from `_PG_init`
pub fn register() {
    GucRegistry::define_string_guc(
        SCHEMA_GUC,
        "Schema used to qualify unqualified root relation names",
        "mvdeps_prepare() and friends resolve a bare relation name in this schema.",
        &SCHEMA,
        GucContext::Userset,
        GucFlags::default(),
    );

    GucRegistry::define_string_guc(
        REFRESH_PREFIX_GUC,
        "Name prefix of materialized views refreshed after restore",
        "Rebuilt materialized views whose name starts with this prefix are refreshed WITH DATA; \
         others stay unpopulated.",
        &REFRESH_PREFIX,
        GucContext::Userset,
        GucFlags::default(),
    );
}

pub fn schema() -> Option<String> {
    SCHEMA.get().and_then(|s| s.to_str().ok().map(str::to_owned))
}

pub fn refresh_prefix() -> Option<String> {
    REFRESH_PREFIX.get().and_then(|s| s.to_str().ok().map(str::to_owned))
}
