// reql-core - streaming evaluation engine for the ReQL document query language

#![warn(rust_2018_idioms)]

pub mod query;
pub mod reql;

// Re-exports for convenience
pub use query::{run_query, Env, Evaluator, Gensym, Limits, MemTables, TableSource};
pub use reql::{Datum, ErrorKind, QueryError, Term, TermType};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
