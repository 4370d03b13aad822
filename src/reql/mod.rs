//! ReQL (RethinkDB Query Language) term-tree definitions.
//!
//! This module provides the language-level pieces of the engine:
//!
//! - **Term Types**: the supported ReQL operations with their argument
//!   specifications and evaluation flags
//! - **AST**: Abstract Syntax Tree for representing queries
//! - **Datum**: JSON-like data type for values, with size-limited builders
//! - **Errors**: structured query errors carrying term-tree backtraces
//!
//! # Architecture
//!
//! The implementation follows a three-layer design:
//!
//! 1. **Terms Layer** (`terms.rs`): operation kinds and per-operator contracts
//! 2. **AST Layer** (`ast.rs`): query structure with Term nodes
//! 3. **Execution Layer** (`query`): rewrites sugared terms and evaluates the
//!    resulting primitive tree
//!
//! # Example
//!
//! ```rust,ignore
//! use reql_core::reql::{Term, Datum};
//!
//! // Build a query: r.table("users").nth(0)
//! let query = Term::nth(Term::table("users"), 0);
//! ```

pub mod ast;
pub mod datum;
pub mod error;
pub mod terms;

pub use ast::{FrameHint, Term};
pub use datum::{ArrayBuilder, Datum, ObjectBuilder};
pub use error::{Backtrace, ErrorKind, Frame, QueryError, Result};
pub use terms::{ArgSpec, Optargs, TermType};
