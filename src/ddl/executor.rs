use pgrx::pg_sys::panic::CaughtError;
use pgrx::prelude::*;

use super::statement::Statement;

/// Narrow port every drop/create/refresh goes through
///
/// A rejected statement comes back as `Err(reason)`; the caller decides
/// what to do with the rest of the phase.
pub trait DdlExecutor {
    fn execute(&mut self, statement: &Statement) -> Result<(), String>;
}

/// Runs statements in the current transaction through SPI
///
/// A PostgreSQL ERROR raised by the statement is caught and turned into the
/// failure reason, so the orchestrator can record which step broke before the
/// error is re-raised to the client.
#[derive(Debug, Default)]
pub struct SpiExecutor {
    executed: usize,
}

impl SpiExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of statements that completed successfully
    pub fn executed(&self) -> usize {
        self.executed
    }
}

impl DdlExecutor for SpiExecutor {
    fn execute(&mut self, statement: &Statement) -> Result<(), String> {
        let sql = statement.render();
        debug1!("pg_mvdeps: {} {}: {}", statement.step(), statement.relation(), sql);

        PgTryBuilder::new(|| Spi::run(&sql).map_err(|e| e.to_string()))
            .catch_others(|caught| match caught {
                CaughtError::PostgresError(report) | CaughtError::ErrorReport(report) => {
                    Err(report.message().to_string())
                }
                CaughtError::RustPanic { ereport, .. } => Err(ereport.message().to_string()),
            })
            .execute()?;

        self.executed += 1;
        Ok(())
    }
}
