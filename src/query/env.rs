//! Query evaluation environment.
//!
//! The [`Env`] is the query-wide state every term evaluation runs against:
//! the read-only size-limit configuration, the cooperative cancellation
//! signal, and the handle to the external table source. Variable bindings
//! live in a separate [`Scope`], created fresh per closure invocation and
//! never shared across sibling subtrees.

use crate::reql::datum::Datum;
use crate::reql::error::{QueryError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Resource limits enforced during evaluation.
///
/// Read-only from the evaluator's point of view. Serializable so an
/// embedding server can load it from its configuration layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    /// Maximum number of elements in a built array (or keys in an object).
    pub array_size_limit: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            array_size_limit: 100_000,
        }
    }
}

/// Reference to a table in the external table source.
///
/// Sequences that still represent rows of a table carry one of these so that
/// downstream write terms can resolve against the right table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub name: String,
}

impl TableRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// The storage collaborator the evaluator consumes.
///
/// The real storage engine lives outside this crate; the evaluator only
/// needs scans, primary-key point lookups, and row replacement. Rows are
/// objects keyed by the `id` attribute.
#[async_trait]
pub trait TableSource: Send + Sync {
    /// All rows of a table, in storage order.
    async fn scan(&self, table: &str) -> Result<Vec<Datum>>;

    /// Point lookup by primary key.
    async fn get(&self, table: &str, key: &Datum) -> Result<Option<Datum>>;

    /// Replace (or with `None`, delete) the row with the given primary key.
    async fn store(&self, table: &str, key: &Datum, row: Option<Datum>) -> Result<()>;
}

/// In-memory [`TableSource`] used by tests and embedders without a real
/// storage engine.
#[derive(Default)]
pub struct MemTables {
    tables: RwLock<HashMap<String, Vec<Datum>>>,
}

impl MemTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table with the given rows.
    pub fn with_table(self, name: impl Into<String>, rows: Vec<Datum>) -> Self {
        self.tables.write().insert(name.into(), rows);
        self
    }
}

fn row_key(row: &Datum) -> Option<&Datum> {
    row.as_object().and_then(|obj| obj.get("id"))
}

#[async_trait]
impl TableSource for MemTables {
    async fn scan(&self, table: &str) -> Result<Vec<Datum>> {
        self.tables
            .read()
            .get(table)
            .cloned()
            .ok_or_else(|| QueryError::non_existence(format!("Table `{}` does not exist.", table)))
    }

    async fn get(&self, table: &str, key: &Datum) -> Result<Option<Datum>> {
        let rows = self.scan(table).await?;
        Ok(rows.into_iter().find(|row| row_key(row) == Some(key)))
    }

    async fn store(&self, table: &str, key: &Datum, row: Option<Datum>) -> Result<()> {
        let mut tables = self.tables.write();
        let rows = tables
            .get_mut(table)
            .ok_or_else(|| QueryError::non_existence(format!("Table `{}` does not exist.", table)))?;
        let pos = rows.iter().position(|r| row_key(r) == Some(key));
        match (pos, row) {
            (Some(i), Some(new)) => rows[i] = new,
            (Some(i), None) => {
                rows.remove(i);
            }
            (None, Some(new)) => rows.push(new),
            (None, None) => {}
        }
        Ok(())
    }
}

/// Currently bound closure variables.
///
/// Immutable and cheaply cloneable; extending a scope produces a new one, so
/// sibling subtrees can never observe each other's bindings.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    vars: Arc<HashMap<i64, Datum>>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: i64) -> Option<&Datum> {
        self.vars.get(&id)
    }

    /// A new scope with the given bindings added on top of this one.
    pub fn extend<I: IntoIterator<Item = (i64, Datum)>>(&self, bindings: I) -> Scope {
        let mut vars: HashMap<i64, Datum> = (*self.vars).clone();
        vars.extend(bindings);
        Scope {
            vars: Arc::new(vars),
        }
    }
}

/// Query-wide evaluation environment.
///
/// Cheap to clone: the table source and interruptor are shared handles.
/// Evaluation is single-threaded per environment; the only suspension points
/// are stream pulls.
#[derive(Clone)]
pub struct Env {
    limits: Limits,
    source: Arc<dyn TableSource>,
    interrupt: Arc<AtomicBool>,
}

impl Env {
    /// An environment with default limits and an empty in-memory table source.
    pub fn new() -> Self {
        Self::with_source(Arc::new(MemTables::new()))
    }

    pub fn with_source(source: Arc<dyn TableSource>) -> Self {
        Self {
            limits: Limits::default(),
            source,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn source(&self) -> &Arc<dyn TableSource> {
        &self.source
    }

    /// Shared cancellation signal. Setting it makes the next interrupt check
    /// unwind with the `Cancelled` error kind.
    pub fn interruptor(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Checked at the top of every term evaluation and at every stream pull.
    pub fn check_interrupt(&self) -> Result<()> {
        if self.interrupt.load(Ordering::Relaxed) {
            Err(QueryError::cancelled())
        } else {
            Ok(())
        }
    }
}

impl Default for Env {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reql::error::ErrorKind;

    #[test]
    fn test_scope_isolation() {
        let base = Scope::new();
        let a = base.extend([(1, Datum::Number(1.0))]);
        let b = base.extend([(2, Datum::Number(2.0))]);
        assert!(a.get(2).is_none());
        assert!(b.get(1).is_none());
        assert_eq!(a.get(1), Some(&Datum::Number(1.0)));
    }

    #[test]
    fn test_scope_shadowing() {
        let outer = Scope::new().extend([(1, Datum::Number(1.0))]);
        let inner = outer.extend([(1, Datum::Number(9.0))]);
        assert_eq!(inner.get(1), Some(&Datum::Number(9.0)));
        assert_eq!(outer.get(1), Some(&Datum::Number(1.0)));
    }

    #[test]
    fn test_interrupt() {
        let env = Env::new();
        assert!(env.check_interrupt().is_ok());
        env.interruptor().store(true, Ordering::Relaxed);
        let err = env.check_interrupt().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_mem_tables() {
        let rows = vec![
            Datum::object([("id", Datum::Number(1.0)), ("name", Datum::from("a"))]),
            Datum::object([("id", Datum::Number(2.0)), ("name", Datum::from("b"))]),
        ];
        let tables = MemTables::new().with_table("users", rows);

        let key = Datum::Number(2.0);
        let row = tables.get("users", &key).await.unwrap().unwrap();
        assert_eq!(
            row.as_object().unwrap().get("name"),
            Some(&Datum::from("b"))
        );

        tables.store("users", &key, None).await.unwrap();
        assert!(tables.get("users", &key).await.unwrap().is_none());
        assert_eq!(tables.scan("users").await.unwrap().len(), 1);

        let err = tables.scan("missing").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NonExistence);
    }
}
