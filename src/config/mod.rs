pub mod guc;

use serde::{Deserialize, Serialize};

use crate::ddl::QualifiedName;
use crate::error::{DepsError, DepsResult};

/// Maximum number of expansion rounds in dependency discovery
/// The catalog forbids view cycles, so hitting this means the catalog is not what we expect
pub const MAX_DEPENDENCY_DEPTH: usize = 64;

/// Namespace used for unqualified root names
pub const DEFAULT_SCHEMA: &str = "public";

/// Materialized dependents whose name starts with this are repopulated on restore
pub const DEFAULT_REFRESH_PREFIX: &str = "mvw";

/// Settings threaded through every prepare/restore call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationConfig {
    pub schema: String,
    pub refresh_prefix: String,
    pub max_depth: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            schema: DEFAULT_SCHEMA.to_string(),
            refresh_prefix: DEFAULT_REFRESH_PREFIX.to_string(),
            max_depth: MAX_DEPENDENCY_DEPTH,
        }
    }
}

impl MigrationConfig {
    /// Snapshot the `pg_mvdeps.*` settings of the current session
    pub fn from_gucs() -> DepsResult<Self> {
        let schema = guc::schema().unwrap_or_else(|| DEFAULT_SCHEMA.to_string());
        let refresh_prefix =
            guc::refresh_prefix().unwrap_or_else(|| DEFAULT_REFRESH_PREFIX.to_string());

        let config = Self {
            schema,
            refresh_prefix,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DepsResult<()> {
        if self.schema.trim().is_empty() {
            return Err(DepsError::ConfigError {
                setting: guc::SCHEMA_GUC.to_string(),
                value: self.schema.clone(),
                reason: "schema cannot be empty".to_string(),
            });
        }
        if self.max_depth == 0 {
            return Err(DepsError::ConfigError {
                setting: "max_depth".to_string(),
                value: self.max_depth.to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Naming-convention predicate for refresh-with-data after rebuild
    pub fn should_refresh(&self, relation: &QualifiedName) -> bool {
        relation.name.starts_with(&self.refresh_prefix)
    }
}
