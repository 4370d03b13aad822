//! Query engine: rewrite, then evaluate.
//!
//! A term tree coming from the external parser goes through two stages:
//!
//! 1. The [`rewrite`] compiler expands sugared terms into primitive trees,
//!    exactly once per query.
//! 2. The [`executor`] evaluates the primitive tree against an [`Env`],
//!    pulling sequence data through the [`stream`] layer.

pub mod arrays;
pub mod env;
pub mod executor;
pub mod indexing;
pub mod rewrite;
pub mod stream;

pub use env::{Env, Limits, MemTables, Scope, TableRef, TableSource};
pub use executor::{Args, Evaluator, FuncVal, SingleRow, Val};
pub use rewrite::{compile, Gensym};
pub use stream::{BatchSpec, GroupedData, SeqProducer, Sequence};

use crate::reql::ast::Term;
use crate::reql::datum::Datum;
use crate::reql::error::Result;
use tracing::{debug, instrument};

/// Compile and evaluate a query term against the given environment.
#[instrument(skip(env, term))]
pub async fn run_query(env: Env, term: Term) -> Result<Datum> {
    let mut gensym = Gensym::new();
    let compiled = rewrite::compile(term, &mut gensym)?;
    debug!("query compiled; evaluating");
    Evaluator::new(env).run(&compiled).await
}
