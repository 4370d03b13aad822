//! Lazy, batched sequences and grouped data.
//!
//! A [`Sequence`] is a pull-based producer of datums. Every pull goes through
//! a [`BatchSpec`] describing how many elements the caller wants and whether
//! it intends to consume the whole remainder in one terminal pull (which lets
//! producers buffer more aggressively). Pulls are the evaluator's only
//! suspension points; cancellation is checked on each one.
//!
//! A sequence may carry a table binding - the "selection" context - which
//! window operators (slice, limit) preserve and value-producing operators
//! drop.
//!
//! [`GroupedData`] is the side-channel for sequences partitioned by a group
//! key: an ordered mapping from key to per-group value, preserving the order
//! keys were first seen in.

use crate::query::env::{Env, TableRef};
use crate::reql::datum::{ArrayBuilder, Datum};
use crate::reql::error::Result;
use async_trait::async_trait;
use std::collections::VecDeque;

/// Default number of rows pulled per batch when scanning a stream without a
/// better size estimate.
pub(crate) const DEFAULT_BATCH_ROWS: usize = 256;

/// How much a single pull may return.
///
/// Created per operator invocation, never retained across calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSpec {
    max: usize,
    terminal: bool,
}

impl BatchSpec {
    /// Exactly one element per pull.
    pub fn single() -> Self {
        Self {
            max: 1,
            terminal: false,
        }
    }

    /// A bounded pull of up to `n` elements (at least one).
    pub fn at_most(n: usize) -> Self {
        Self {
            max: n.max(1),
            terminal: false,
        }
    }

    /// The caller intends to consume the entire remaining stream.
    pub fn all() -> Self {
        Self {
            max: usize::MAX,
            terminal: true,
        }
    }

    pub fn max_els(&self) -> usize {
        self.max
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }
}

/// The producer side of a sequence.
///
/// An empty batch means the stream is exhausted. Producers may block on
/// external I/O inside `next_batch`; this is the evaluator's cooperative
/// suspension point.
#[async_trait]
pub trait SeqProducer: Send {
    async fn next_batch(&mut self, env: &Env, batch: &BatchSpec) -> Result<Vec<Datum>>;
}

/// Materialized in-memory producer.
pub struct VecSource {
    items: VecDeque<Datum>,
}

impl VecSource {
    pub fn new(items: Vec<Datum>) -> Self {
        Self {
            items: items.into(),
        }
    }
}

#[async_trait]
impl SeqProducer for VecSource {
    async fn next_batch(&mut self, _env: &Env, batch: &BatchSpec) -> Result<Vec<Datum>> {
        let n = batch.max_els().min(self.items.len());
        Ok(self.items.drain(..n).collect())
    }
}

/// Lazy window over an inner sequence: drop `to_skip` elements, then serve at
/// most `remaining` (unbounded when `None`).
struct SliceSource {
    inner: Box<Sequence>,
    to_skip: u64,
    remaining: Option<u64>,
}

#[async_trait]
impl SeqProducer for SliceSource {
    async fn next_batch(&mut self, env: &Env, batch: &BatchSpec) -> Result<Vec<Datum>> {
        while self.to_skip > 0 {
            let want = self.to_skip.min(DEFAULT_BATCH_ROWS as u64) as usize;
            let skipped = self.inner.next_batch(env, &BatchSpec::at_most(want)).await?;
            if skipped.is_empty() {
                self.remaining = Some(0);
                return Ok(Vec::new());
            }
            self.to_skip -= skipped.len() as u64;
        }

        if self.remaining == Some(0) {
            return Ok(Vec::new());
        }

        let spec = match self.remaining {
            None => batch.clone(),
            Some(rem) => BatchSpec::at_most(batch.max_els().min(rem as usize)),
        };
        let chunk = self.inner.next_batch(env, &spec).await?;
        if let Some(rem) = &mut self.remaining {
            *rem -= chunk.len() as u64;
        }
        Ok(chunk)
    }
}

/// A lazy, finite, ordered sequence of datums, possibly bound to a source
/// table (a selection).
pub struct Sequence {
    source: Box<dyn SeqProducer>,
    binding: Option<TableRef>,
}

impl Sequence {
    pub fn from_vec(items: Vec<Datum>) -> Self {
        Self {
            source: Box::new(VecSource::new(items)),
            binding: None,
        }
    }

    pub fn from_producer(source: Box<dyn SeqProducer>) -> Self {
        Self {
            source,
            binding: None,
        }
    }

    /// Tag this sequence as a selection over the given table.
    pub fn with_binding(mut self, table: TableRef) -> Self {
        self.binding = Some(table);
        self
    }

    /// The selection context, if this sequence still represents table rows.
    pub fn binding(&self) -> Option<&TableRef> {
        self.binding.as_ref()
    }

    /// Pull the next batch. Checks the interruptor first: stream pulls are
    /// the evaluator's cancellation points.
    pub async fn next_batch(&mut self, env: &Env, batch: &BatchSpec) -> Result<Vec<Datum>> {
        env.check_interrupt()?;
        self.source.next_batch(env, batch).await
    }

    /// Pull a single element.
    pub async fn next(&mut self, env: &Env) -> Result<Option<Datum>> {
        let mut batch = self.next_batch(env, &BatchSpec::single()).await?;
        Ok(batch.pop())
    }

    /// Consume the entire remainder into an array, enforcing the array size
    /// limit.
    pub async fn drain(&mut self, env: &Env) -> Result<Vec<Datum>> {
        let mut builder = ArrayBuilder::new(env.limits());
        let spec = BatchSpec::all();
        loop {
            let chunk = self.next_batch(env, &spec).await?;
            if chunk.is_empty() {
                return Ok(builder.into_vec());
            }
            builder.extend(chunk)?;
        }
    }

    /// A lazily-sliced view: skip `skip` elements, then yield at most `take`.
    /// Preserves the selection context - a slice of table rows is still table
    /// rows.
    pub fn slice(mut self, skip: u64, take: Option<u64>) -> Sequence {
        let binding = self.binding.take();
        Sequence {
            source: Box::new(SliceSource {
                inner: Box::new(self),
                to_skip: skip,
                remaining: take,
            }),
            binding,
        }
    }
}

/// A sequence partitioned by group key.
///
/// Key order is first-seen and fixed once produced; operators that are not
/// group-aware fan out per key and reassemble a grouped result with the same
/// key set.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GroupedData {
    groups: Vec<(Datum, Datum)>,
}

impl GroupedData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs(groups: Vec<(Datum, Datum)>) -> Self {
        Self { groups }
    }

    pub fn push(&mut self, key: Datum, value: Datum) {
        self.groups.push((key, value));
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Datum, Datum)> {
        self.groups.iter()
    }

    pub fn into_pairs(self) -> Vec<(Datum, Datum)> {
        self.groups
    }

    /// The datum rendering of grouped data, used when a grouped value is the
    /// final query result.
    pub fn to_datum(self) -> Datum {
        let data = self
            .groups
            .into_iter()
            .map(|(k, v)| Datum::Array(vec![k, v]))
            .collect();
        Datum::object([
            ("$reql_type$", Datum::from("GROUPED_DATA")),
            ("data", Datum::Array(data)),
        ])
    }
}

/// Accumulates rows under their group key, preserving first-seen key order.
#[derive(Default)]
pub struct GroupAccumulator {
    groups: Vec<(Datum, Vec<Datum>)>,
}

impl GroupAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: Datum, item: Datum) {
        match self.groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, items)) => items.push(item),
            None => self.groups.push((key, vec![item])),
        }
    }

    /// Grouped data with each group's rows materialized as an array.
    pub fn finish(self) -> GroupedData {
        GroupedData::from_pairs(
            self.groups
                .into_iter()
                .map(|(k, items)| (k, Datum::Array(items)))
                .collect(),
        )
    }
}
