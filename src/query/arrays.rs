//! The array/sequence operator family.
//!
//! Positional operators canonicalize their indexes through
//! [`crate::query::indexing`]: element mode (`[0, size)`) for NTH, CHANGE_AT
//! and DELETE_AT, space mode (`[0, size]`, referencing gaps) for INSERT_AT
//! and SPLICE_AT. Set operators deduplicate by value equality and preserve
//! first-occurrence order, left argument first.
//!
//! APPEND and PREPEND copy the whole array into a fresh builder; there is no
//! structural sharing, so both are O(size).
//!
//! Stream-shaped inputs are pulled through batch specs sized to the
//! operation: NTH pulls up to `index + 1` elements, IS_EMPTY pulls a single
//! bounded element, CONTAINS consumes the remainder with one terminal pull.

use crate::query::env::TableRef;
use crate::query::executor::{Args, Evaluator, FuncVal, SingleRow, Val};
use crate::query::indexing::{canonicalize, slice_bounds};
use crate::query::stream::{BatchSpec, GroupedData, Sequence, DEFAULT_BATCH_ROWS};
use crate::reql::datum::{ArrayBuilder, Datum};
use crate::reql::error::{QueryError, Result};

/// A CONTAINS/OFFSETS_OF needle: a literal value matched by equality, or a
/// predicate function.
enum Needle {
    Value(Datum),
    Pred(FuncVal),
}

fn needle_of(val: Val) -> Result<Needle> {
    match val {
        Val::Func(f) => Ok(Needle::Pred(f)),
        Val::Datum(d) => Ok(Needle::Value(d)),
        other => Err(QueryError::type_error(format!(
            "Expected type DATUM but found {}.",
            other.type_string()
        ))),
    }
}

fn nth_of_array(items: &[Datum], index: i64) -> Result<Datum> {
    let idx = canonicalize(index, items.len() as u64, None)?;
    items
        .get(idx as usize)
        .cloned()
        .ok_or_else(|| QueryError::non_existence(format!("Index out of bounds: {}", index)))
}

/// A row pulled out of a selection keeps its table context.
fn wrap_selection(binding: Option<TableRef>, row: Datum) -> Val {
    match binding {
        Some(table) => {
            let key = row
                .as_object()
                .and_then(|obj| obj.get("id"))
                .cloned()
                .unwrap_or(Datum::Null);
            Val::Row(SingleRow { table, key, row })
        }
        None => Val::Datum(row),
    }
}

fn seq_type_error(val: &Val) -> QueryError {
    QueryError::type_error(format!(
        "Expected type SEQUENCE but found {}.",
        val.type_string()
    ))
}

impl Evaluator {
    async fn needle_matches(&self, needle: &Needle, row: &Datum) -> Result<bool> {
        match needle {
            Needle::Value(value) => Ok(value == row),
            Needle::Pred(func) => Ok(self
                .call_func_datum(func, vec![row.clone()])
                .await?
                .is_truthy()),
        }
    }

    // ========================================================================
    // Indexing
    // ========================================================================

    /// NTH is group-aware: on grouped data it indexes into each group's
    /// array directly instead of going through the generic fan-out.
    pub(crate) async fn nth(&self, args: &mut Args<'_>) -> Result<Val> {
        let val = args.arg(0).await?;
        let index = args.int_arg(1).await?;
        match val {
            Val::Grouped(groups) => {
                let mut out = GroupedData::new();
                for (key, value) in groups.into_pairs() {
                    let items = value.as_array().ok_or_else(|| {
                        QueryError::type_error(format!(
                            "Expected type ARRAY but found {}.",
                            value.type_name()
                        ))
                    })?;
                    out.push(key, nth_of_array(items, index)?);
                }
                Ok(Val::Grouped(out))
            }
            Val::Datum(Datum::Array(items)) => nth_of_array(&items, index).map(Val::Datum),
            Val::Sequence(_) | Val::Table(_) => {
                let mut seq = self.seq_of(val).await.map_err(|e| args.framed(e, 0))?;
                let binding = seq.binding().cloned();
                if index < -1 {
                    return Err(QueryError::logic(format!(
                        "Cannot use an index < -1 ({}) on a stream.",
                        index
                    )));
                }
                if index == -1 {
                    // The last element: walk the stream one element at a
                    // time, keeping the tail.
                    let mut last = None;
                    loop {
                        match seq.next(self.env()).await? {
                            Some(row) => last = Some(row),
                            None => break,
                        }
                    }
                    let row = last.ok_or_else(|| {
                        QueryError::non_existence("Index out of bounds: -1")
                    })?;
                    Ok(wrap_selection(binding, row))
                } else {
                    let batch = BatchSpec::at_most(index as usize + 1);
                    let mut seen: i64 = 0;
                    loop {
                        let chunk = seq.next_batch(self.env(), &batch).await?;
                        if chunk.is_empty() {
                            return Err(QueryError::non_existence(format!(
                                "Index out of bounds: {}",
                                index
                            )));
                        }
                        for row in chunk {
                            if seen == index {
                                return Ok(wrap_selection(binding, row));
                            }
                            seen += 1;
                        }
                    }
                }
            }
            other => Err(args.framed(seq_type_error(&other), 0)),
        }
    }

    // ========================================================================
    // Windows
    // ========================================================================

    pub(crate) async fn slice(&self, args: &mut Args<'_>) -> Result<Val> {
        let val = args.arg(0).await?;
        let left = args.int_arg(1).await?;
        let right = if args.len() > 2 {
            Some(args.int_arg(2).await?)
        } else {
            None
        };
        let left_open = bound_of(args.optarg_datum("left_bound").await?, "left_bound", false)?;
        let right_open = bound_of(args.optarg_datum("right_bound").await?, "right_bound", true)?;

        match val {
            Val::Datum(Datum::Array(items)) => {
                let (right, right_open) = match right {
                    Some(r) => (r, right_open),
                    // Two-argument form: to the end, inclusively.
                    None => (-1, false),
                };
                let (start, end) =
                    slice_bounds(left, right, left_open, right_open, items.len() as u64)?;
                Ok(Val::Datum(Datum::Array(
                    items[start as usize..end as usize].to_vec(),
                )))
            }
            Val::Datum(Datum::String(s)) => {
                let (right, right_open) = match right {
                    Some(r) => (r, right_open),
                    None => (-1, false),
                };
                // Strings are codepoint-indexed, not byte-indexed.
                let chars: Vec<char> = s.chars().collect();
                let (start, end) =
                    slice_bounds(left, right, left_open, right_open, chars.len() as u64)?;
                Ok(Val::Datum(Datum::String(
                    chars[start as usize..end as usize].iter().collect(),
                )))
            }
            Val::Datum(Datum::Binary(bytes)) => {
                let (right, right_open) = match right {
                    Some(r) => (r, right_open),
                    None => (-1, false),
                };
                let (start, end) =
                    slice_bounds(left, right, left_open, right_open, bytes.len() as u64)?;
                Ok(Val::Datum(Datum::Binary(
                    bytes[start as usize..end as usize].to_vec(),
                )))
            }
            Val::Sequence(_) | Val::Table(_) => {
                let seq = self.seq_of(val).await.map_err(|e| args.framed(e, 0))?;
                if left < 0 {
                    return Err(QueryError::logic(format!(
                        "Cannot use a negative left index ({}) on a stream.",
                        left
                    )));
                }
                let start = if left_open { left as u64 + 1 } else { left as u64 };
                let take = match right {
                    None => None,
                    Some(-1) if !right_open => None,
                    Some(r) if r == -1 => {
                        return Err(QueryError::logic(
                            "Cannot slice to an open right index of -1 on a stream.",
                        ))
                    }
                    Some(r) if r < 0 => {
                        return Err(QueryError::logic(format!(
                            "Cannot use a right index < -1 ({}) on a stream.",
                            r
                        )))
                    }
                    Some(r) => {
                        let end = if right_open { r as u64 } else { r as u64 + 1 };
                        Some(end.saturating_sub(start))
                    }
                };
                Ok(Val::Sequence(seq.slice(start, take)))
            }
            other => Err(args.framed(seq_type_error(&other), 0)),
        }
    }

    pub(crate) async fn limit(&self, args: &mut Args<'_>) -> Result<Val> {
        let val = args.arg(0).await?;
        let n = args.int_arg(1).await?;
        if n < 0 {
            return Err(QueryError::logic(format!(
                "LIMIT takes a non-negative argument (got {}).",
                n
            )));
        }
        match val {
            Val::Datum(Datum::Array(mut items)) => {
                items.truncate(n as usize);
                Ok(Val::Datum(Datum::Array(items)))
            }
            Val::Sequence(_) | Val::Table(_) => {
                let seq = self.seq_of(val).await.map_err(|e| args.framed(e, 0))?;
                Ok(Val::Sequence(seq.slice(0, Some(n as u64))))
            }
            other => Err(args.framed(seq_type_error(&other), 0)),
        }
    }

    // ========================================================================
    // Searches & predicates
    // ========================================================================

    pub(crate) async fn is_empty(&self, args: &mut Args<'_>) -> Result<Val> {
        let mut seq = args.seq_arg(0).await?;
        let chunk = seq.next_batch(self.env(), &BatchSpec::single()).await?;
        Ok(Val::Datum(Datum::Boolean(chunk.is_empty())))
    }

    pub(crate) async fn offsets_of(&self, args: &mut Args<'_>) -> Result<Val> {
        let mut seq = args.seq_arg(0).await?;
        let needle = needle_of(args.arg(1).await?).map_err(|e| args.framed(e, 1))?;

        let mut builder = ArrayBuilder::new(self.env().limits());
        let mut offset: i64 = 0;
        loop {
            let chunk = seq
                .next_batch(self.env(), &BatchSpec::at_most(DEFAULT_BATCH_ROWS))
                .await?;
            if chunk.is_empty() {
                break;
            }
            for row in chunk {
                if self.needle_matches(&needle, &row).await? {
                    builder.push(Datum::Number(offset as f64))?;
                }
                offset += 1;
            }
        }
        // Offsets are plain numbers; any selection context is gone.
        Ok(Val::Sequence(Sequence::from_vec(builder.into_vec())))
    }

    /// Bag semantics: each scanned element consumes at most one of the
    /// remaining unmatched needles, so duplicate needles require duplicate
    /// matching elements.
    pub(crate) async fn contains(&self, args: &mut Args<'_>) -> Result<Val> {
        let mut seq = args.seq_arg(0).await?;
        let mut remaining = Vec::with_capacity(args.len() - 1);
        for i in 1..args.len() {
            remaining.push(needle_of(args.arg(i).await?).map_err(|e| args.framed(e, i))?);
        }

        let batch = BatchSpec::all();
        loop {
            let chunk = seq.next_batch(self.env(), &batch).await?;
            if chunk.is_empty() {
                break;
            }
            for row in chunk {
                let mut matched = None;
                for (i, needle) in remaining.iter().enumerate() {
                    if self.needle_matches(needle, &row).await? {
                        matched = Some(i);
                        break;
                    }
                }
                if let Some(i) = matched {
                    remaining.remove(i);
                }
                if remaining.is_empty() {
                    return Ok(Val::Datum(Datum::Boolean(true)));
                }
            }
        }
        Ok(Val::Datum(Datum::Boolean(remaining.is_empty())))
    }

    // ========================================================================
    // Copy-on-write array construction
    // ========================================================================

    pub(crate) async fn append(&self, args: &mut Args<'_>) -> Result<Val> {
        let items = args.array_arg(0).await?;
        let value = args.datum_arg(1).await?;
        let mut builder = ArrayBuilder::with_capacity(self.env().limits(), items.len() + 1);
        builder.extend(items)?;
        builder.push(value)?;
        Ok(Val::Datum(builder.finish()))
    }

    pub(crate) async fn prepend(&self, args: &mut Args<'_>) -> Result<Val> {
        let items = args.array_arg(0).await?;
        let value = args.datum_arg(1).await?;
        let mut builder = ArrayBuilder::with_capacity(self.env().limits(), items.len() + 1);
        builder.push(value)?;
        builder.extend(items)?;
        Ok(Val::Datum(builder.finish()))
    }

    /// Removes every occurrence of the right-hand elements; not a set
    /// operator - kept duplicates stay.
    pub(crate) async fn difference(&self, args: &mut Args<'_>) -> Result<Val> {
        let items = args.array_arg(0).await?;
        let remove = args.array_arg(1).await?;
        Ok(Val::Datum(Datum::Array(
            items
                .into_iter()
                .filter(|item| !remove.contains(item))
                .collect(),
        )))
    }

    // ========================================================================
    // Set operators (value-equality bags to sets, first-occurrence order)
    // ========================================================================

    pub(crate) async fn set_insert(&self, args: &mut Args<'_>) -> Result<Val> {
        let items = args.array_arg(0).await?;
        let value = args.datum_arg(1).await?;
        let mut out: Vec<Datum> = Vec::with_capacity(items.len() + 1);
        for item in items {
            if !out.contains(&item) {
                out.push(item);
            }
        }
        if !out.contains(&value) {
            out.push(value);
        }
        self.finish_array(out)
    }

    pub(crate) async fn set_union(&self, args: &mut Args<'_>) -> Result<Val> {
        let left = args.array_arg(0).await?;
        let right = args.array_arg(1).await?;
        let mut out: Vec<Datum> = Vec::with_capacity(left.len() + right.len());
        for item in left.into_iter().chain(right) {
            if !out.contains(&item) {
                out.push(item);
            }
        }
        self.finish_array(out)
    }

    pub(crate) async fn set_intersection(&self, args: &mut Args<'_>) -> Result<Val> {
        let left = args.array_arg(0).await?;
        let right = args.array_arg(1).await?;
        let mut out: Vec<Datum> = Vec::new();
        for item in left {
            if right.contains(&item) && !out.contains(&item) {
                out.push(item);
            }
        }
        Ok(Val::Datum(Datum::Array(out)))
    }

    pub(crate) async fn set_difference(&self, args: &mut Args<'_>) -> Result<Val> {
        let left = args.array_arg(0).await?;
        let right = args.array_arg(1).await?;
        let mut out: Vec<Datum> = Vec::new();
        for item in left {
            if !right.contains(&item) && !out.contains(&item) {
                out.push(item);
            }
        }
        Ok(Val::Datum(Datum::Array(out)))
    }

    /// Run a combined result back through the size limit.
    fn finish_array(&self, items: Vec<Datum>) -> Result<Val> {
        let mut builder = ArrayBuilder::with_capacity(self.env().limits(), items.len());
        builder.extend(items)?;
        Ok(Val::Datum(builder.finish()))
    }

    // ========================================================================
    // Positional mutations
    // ========================================================================

    pub(crate) async fn insert_at(&self, args: &mut Args<'_>) -> Result<Val> {
        let items = args.array_arg(0).await?;
        let index = args.int_arg(1).await?;
        let value = args.datum_arg(2).await?;
        let size = items.len() as u64;
        // Space mode: gaps before/after elements are addressable, so -1 is
        // the gap after the last element.
        let idx = canonicalize(index, size + 1, None)?;
        if idx > size {
            return Err(QueryError::non_existence(format!(
                "Index out of bounds: {}",
                index
            )));
        }
        let mut builder = ArrayBuilder::with_capacity(self.env().limits(), items.len() + 1);
        let mut items = items.into_iter();
        for _ in 0..idx {
            builder.push(items.next().expect("index within bounds"))?;
        }
        builder.push(value)?;
        builder.extend(items)?;
        Ok(Val::Datum(builder.finish()))
    }

    pub(crate) async fn splice_at(&self, args: &mut Args<'_>) -> Result<Val> {
        let items = args.array_arg(0).await?;
        let index = args.int_arg(1).await?;
        let values = args.array_arg(2).await?;
        let size = items.len() as u64;
        let idx = canonicalize(index, size + 1, None)?;
        if idx > size {
            return Err(QueryError::non_existence(format!(
                "Index out of bounds: {}",
                index
            )));
        }
        let mut builder =
            ArrayBuilder::with_capacity(self.env().limits(), items.len() + values.len());
        let mut items = items.into_iter();
        for _ in 0..idx {
            builder.push(items.next().expect("index within bounds"))?;
        }
        builder.extend(values)?;
        builder.extend(items)?;
        Ok(Val::Datum(builder.finish()))
    }

    pub(crate) async fn delete_at(&self, args: &mut Args<'_>) -> Result<Val> {
        let mut items = args.array_arg(0).await?;
        let index = args.int_arg(1).await?;
        let size = items.len() as u64;
        let start = canonicalize(index, size, None)?;
        if start >= size {
            return Err(QueryError::non_existence(format!(
                "Index out of bounds: {}",
                index
            )));
        }
        let end = if args.len() > 2 {
            let end_index = args.int_arg(2).await?;
            let end = canonicalize(end_index, size, None)?;
            if end > size {
                return Err(QueryError::non_existence(format!(
                    "Index out of bounds: {}",
                    end_index
                )));
            }
            end
        } else {
            start + 1
        };
        if start > end {
            return Err(QueryError::logic(format!(
                "Start index {} is greater than end index {}.",
                start, end
            )));
        }
        items.drain(start as usize..end as usize);
        Ok(Val::Datum(Datum::Array(items)))
    }

    pub(crate) async fn change_at(&self, args: &mut Args<'_>) -> Result<Val> {
        let mut items = args.array_arg(0).await?;
        let index = args.int_arg(1).await?;
        let value = args.datum_arg(2).await?;
        let size = items.len() as u64;
        let idx = canonicalize(index, size, None)?;
        if idx >= size {
            return Err(QueryError::non_existence(format!(
                "Index out of bounds: {}",
                index
            )));
        }
        items[idx as usize] = value;
        Ok(Val::Datum(Datum::Array(items)))
    }
}

/// Parse a slice bound optarg: `"open"` or `"closed"`.
fn bound_of(datum: Option<Datum>, name: &str, default_open: bool) -> Result<bool> {
    match datum {
        None => Ok(default_open),
        Some(d) => match d.as_string() {
            Some("open") => Ok(true),
            Some("closed") => Ok(false),
            _ => Err(QueryError::logic(format!(
                "Invalid bound {} for `{}`; expected `open` or `closed`.",
                d, name
            ))),
        },
    }
}
