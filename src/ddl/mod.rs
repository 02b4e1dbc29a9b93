pub mod executor;
pub mod ident;
pub mod statement;

pub use executor::{DdlExecutor, SpiExecutor};
pub use ident::{quote_ident, quote_literal, QualifiedName};
pub use statement::{PolicyCommand, RelationKind, Statement, GRANTABLE_PRIVILEGES};
