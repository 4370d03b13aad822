//! ReQL term evaluator.
//!
//! Evaluates rewritten (primitive-only) term trees and returns datums.
//!
//! # Architecture
//!
//! The evaluator follows a pattern-matching design:
//!
//! 1. **AST Traversal**: Recursively walks the Term tree via boxed futures
//! 2. **Contract Check**: validates arity and declared optional arguments
//!    before dispatch
//! 3. **Operation Dispatch**: Matches on TermType and calls the handler
//! 4. **Grouped Fan-Out**: sequence-consuming operators that are not
//!    group-aware are re-run per group when their input is grouped data
//!
//! Arguments are evaluated lazily through the [`Args`] accessor, so operators
//! with control-flow semantics (BRANCH, AND, OR) never touch untaken
//! subtrees. Every argument boundary attaches a backtrace frame to errors
//! crossing it, honoring the frame hints left by the rewrite compiler.
//!
//! The interruptor is checked at the top of every term evaluation; stream
//! pulls check it again. Cancellation unwinds through the normal error path
//! with the `Cancelled` kind.

use crate::query::env::{Env, Scope, TableRef};
use crate::query::stream::{BatchSpec, GroupAccumulator, GroupedData, Sequence, DEFAULT_BATCH_ROWS};
use crate::reql::ast::{FrameHint, Term};
use crate::reql::datum::{ArrayBuilder, Datum, ObjectBuilder};
use crate::reql::error::{Frame, QueryError, Result};
use crate::reql::terms::{Optargs, TermType};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A function closure: parameter ids, body, and the scope captured at the
/// point the FUNC term was evaluated.
#[derive(Clone)]
pub struct FuncVal {
    pub params: Arc<Vec<i64>>,
    pub body: Arc<Term>,
    pub scope: Scope,
    /// Frame reported for errors raised inside the body, so a relocated
    /// predicate still points at the argument position the user wrote.
    pub origin: Option<Frame>,
}

/// A single row selected from a table by primary key.
///
/// `row` is `Null` when no row with that key exists; write terms use this to
/// short-circuit.
pub struct SingleRow {
    pub table: TableRef,
    pub key: Datum,
    pub row: Datum,
}

/// A runtime value: what evaluating one term produces.
pub enum Val {
    Datum(Datum),
    Sequence(Sequence),
    Grouped(GroupedData),
    Func(FuncVal),
    Table(TableRef),
    Row(SingleRow),
}

impl Val {
    /// The type name reported by TYPE_OF and used in error messages.
    pub fn type_string(&self) -> String {
        match self {
            Val::Datum(d) => d.type_name().to_string(),
            Val::Sequence(seq) => {
                if seq.binding().is_some() {
                    "SELECTION<STREAM>".to_string()
                } else {
                    "STREAM".to_string()
                }
            }
            Val::Grouped(_) => "GROUPED_DATA".to_string(),
            Val::Func(_) => "FUNCTION".to_string(),
            Val::Table(_) => "TABLE".to_string(),
            Val::Row(_) => "SELECTION<OBJECT>".to_string(),
        }
    }

    /// Strict datum extraction; sequences are not implicitly materialized.
    pub fn into_datum_strict(self) -> Result<Datum> {
        match self {
            Val::Datum(d) => Ok(d),
            Val::Row(row) => Ok(row.row),
            other => Err(QueryError::type_error(format!(
                "Expected type DATUM but found {}.",
                other.type_string()
            ))),
        }
    }
}

/// Resolve the backtrace frame a child reports, honoring rewrite hints.
fn frame_for(child: &Term, default: Frame) -> Option<Frame> {
    match &child.frame_hint {
        Some(FrameHint::Elide) => None,
        Some(FrameHint::At(frame)) => Some(frame.clone()),
        None => Some(default),
    }
}

/// Lazy argument accessor handed to every operator implementation.
///
/// `arg(0)` may have been pre-evaluated by the dispatch layer (for the
/// grouped fan-out check); every other argument is evaluated on first
/// request.
pub struct Args<'a> {
    ev: &'a Evaluator,
    term: &'a Term,
    scope: &'a Scope,
    first: Option<Val>,
}

impl<'a> Args<'a> {
    fn new(ev: &'a Evaluator, term: &'a Term, scope: &'a Scope, first: Option<Val>) -> Self {
        Self {
            ev,
            term,
            scope,
            first,
        }
    }

    pub fn len(&self) -> usize {
        self.term.num_args()
    }

    pub fn is_empty(&self) -> bool {
        self.term.num_args() == 0
    }

    pub fn term(&self) -> &'a Term {
        self.term
    }

    pub fn scope(&self) -> &'a Scope {
        self.scope
    }

    /// Attach the frame for argument `index` to an error produced while
    /// consuming that argument's already-evaluated value.
    pub fn framed(&self, err: QueryError, index: usize) -> QueryError {
        let Some(child) = self.term.arg(index) else {
            return err;
        };
        match frame_for(child, Frame::Pos(index)) {
            Some(frame) => err.with_frame(frame),
            None => err,
        }
    }

    /// Evaluate positional argument `index`.
    pub async fn arg(&mut self, index: usize) -> Result<Val> {
        if index == 0 {
            if let Some(val) = self.first.take() {
                return Ok(val);
            }
        }
        self.ev.eval_arg(self.term, index, self.scope).await
    }

    /// Evaluate argument `index` and require a datum.
    pub async fn datum_arg(&mut self, index: usize) -> Result<Datum> {
        let val = self.arg(index).await?;
        val.into_datum_strict().map_err(|e| self.framed(e, index))
    }

    /// Evaluate argument `index` and require an integer.
    pub async fn int_arg(&mut self, index: usize) -> Result<i64> {
        let datum = self.datum_arg(index).await?;
        datum.as_int().map_err(|e| self.framed(e, index))
    }

    /// Evaluate argument `index` and require a number.
    pub async fn number_arg(&mut self, index: usize) -> Result<f64> {
        let datum = self.datum_arg(index).await?;
        datum.as_number().ok_or_else(|| {
            self.framed(
                QueryError::type_error(format!(
                    "Expected type NUMBER but found {}.",
                    datum.type_name()
                )),
                index,
            )
        })
    }

    /// Evaluate argument `index` and require a string.
    pub async fn string_arg(&mut self, index: usize) -> Result<String> {
        let datum = self.datum_arg(index).await?;
        match datum {
            Datum::String(s) => Ok(s),
            other => Err(self.framed(
                QueryError::type_error(format!(
                    "Expected type STRING but found {}.",
                    other.type_name()
                )),
                index,
            )),
        }
    }

    /// Evaluate argument `index` and require a datum array.
    pub async fn array_arg(&mut self, index: usize) -> Result<Vec<Datum>> {
        let datum = self.datum_arg(index).await?;
        match datum {
            Datum::Array(items) => Ok(items),
            other => Err(self.framed(
                QueryError::type_error(format!(
                    "Expected type ARRAY but found {}.",
                    other.type_name()
                )),
                index,
            )),
        }
    }

    /// Evaluate argument `index` as a sequence (arrays convert; tables scan).
    pub async fn seq_arg(&mut self, index: usize) -> Result<Sequence> {
        let val = self.arg(index).await?;
        self.ev
            .seq_of(val)
            .await
            .map_err(|e| self.framed(e, index))
    }

    /// Evaluate argument `index` and require a function closure.
    pub async fn func_arg(&mut self, index: usize) -> Result<FuncVal> {
        let val = self.arg(index).await?;
        match val {
            Val::Func(mut f) => {
                if f.origin.is_none() {
                    f.origin = self
                        .term
                        .arg(index)
                        .and_then(|child| frame_for(child, Frame::Pos(index)));
                }
                Ok(f)
            }
            other => Err(self.framed(
                QueryError::type_error(format!(
                    "Expected type FUNCTION but found {}.",
                    other.type_string()
                )),
                index,
            )),
        }
    }

    /// The optional argument's raw term, if supplied.
    pub fn optarg_term(&self, name: &str) -> Option<&'a Term> {
        self.term.optarg(name)
    }

    /// Evaluate an optional argument to a datum, if supplied.
    pub async fn optarg_datum(&mut self, name: &str) -> Result<Option<Datum>> {
        self.ev.eval_optarg(self.term, name, self.scope).await
    }
}

/// Per-row write outcome counters for REPLACE.
#[derive(Default)]
pub(crate) struct WriteReport {
    replaced: u64,
    unchanged: u64,
    deleted: u64,
    inserted: u64,
    skipped: u64,
}

impl WriteReport {
    fn to_datum(&self) -> Datum {
        Datum::object([
            ("replaced", Datum::Number(self.replaced as f64)),
            ("unchanged", Datum::Number(self.unchanged as f64)),
            ("deleted", Datum::Number(self.deleted as f64)),
            ("inserted", Datum::Number(self.inserted as f64)),
            ("skipped", Datum::Number(self.skipped as f64)),
            ("errors", Datum::Number(0.0)),
        ])
    }
}

/// ReQL term evaluator.
///
/// Owns the evaluation environment; one evaluator per query-evaluation
/// context. The term tree is never mutated and may be evaluated many times.
pub struct Evaluator {
    env: Env,
}

impl Evaluator {
    pub fn new(env: Env) -> Self {
        Self { env }
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    /// Evaluate a rewritten term tree to a final datum.
    pub async fn run(&self, term: &Term) -> Result<Datum> {
        let scope = Scope::new();
        let val = self.eval(term, &scope).await?;
        self.materialize(val).await
    }

    /// Evaluate one term in the given scope.
    pub(crate) fn eval<'a>(&'a self, term: &'a Term, scope: &'a Scope) -> BoxFut<'a, Result<Val>> {
        Box::pin(async move {
            self.env.check_interrupt()?;

            if term.is_datum() {
                return term
                    .as_datum()
                    .cloned()
                    .map(Val::Datum)
                    .ok_or_else(|| QueryError::internal("Datum term missing value"));
            }

            debug!(term = %term.term_type, args = term.num_args(), "evaluating term");

            if term.term_type.is_sugar() {
                return Err(QueryError::internal(format!(
                    "Sugared term {} reached the evaluator; rewrite the tree first",
                    term.term_type
                )));
            }

            self.check_contract(term)?;

            // Grouped fan-out: materialize the grouped input and re-run the
            // operator once per group, reassembling a grouped result with the
            // same key set and key order.
            let first = if term.term_type.takes_sequence() && !term.term_type.is_group_aware() {
                let val = self.eval_arg(term, 0, scope).await?;
                if let Val::Grouped(groups) = val {
                    return self.fan_out(term, scope, groups).await;
                }
                Some(val)
            } else {
                None
            };

            let mut args = Args::new(self, term, scope, first);
            self.eval_op(term.term_type, &mut args).await
        })
    }

    /// Arity and optional-argument validation, before any argument runs.
    fn check_contract(&self, term: &Term) -> Result<()> {
        let spec = term.term_type.arg_spec();
        let n = term.num_args();
        let in_range = n >= spec.min && spec.max.map_or(true, |max| n <= max);
        if !in_range {
            let expected = match (spec.min, spec.max) {
                (min, Some(max)) if min == max => format!("{}", min),
                (min, Some(max)) => format!("between {} and {}", min, max),
                (min, None) => format!("{} or more", min),
            };
            return Err(QueryError::arity(format!(
                "{} expected {} arguments but found {}.",
                term.term_type.name(),
                expected,
                n
            )));
        }
        if let Optargs::Only(declared) = spec.optargs {
            for name in term.optargs.keys() {
                if !declared.contains(&name.as_str()) {
                    return Err(QueryError::unrecognized_optarg(name));
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn eval_arg(&self, term: &Term, index: usize, scope: &Scope) -> Result<Val> {
        let child = term.arg(index).ok_or_else(|| {
            QueryError::internal(format!(
                "Missing argument {} of {}",
                index, term.term_type
            ))
        })?;
        self.eval(child, scope)
            .await
            .map_err(|e| match frame_for(child, Frame::Pos(index)) {
                Some(frame) => e.with_frame(frame),
                None => e,
            })
    }

    async fn eval_optarg(&self, term: &Term, name: &str, scope: &Scope) -> Result<Option<Datum>> {
        let Some(child) = term.optarg(name) else {
            return Ok(None);
        };
        let datum = self
            .eval(child, scope)
            .await
            .and_then(Val::into_datum_strict)
            .map_err(|e| match frame_for(child, Frame::Opt(name.to_string())) {
                Some(frame) => e.with_frame(frame),
                None => e,
            })?;
        Ok(Some(datum))
    }

    /// Re-run a non-group-aware operator once per group. Values passed to
    /// each run are the group's materialized array; results are materialized
    /// datums under the same keys, in the same order.
    async fn fan_out(&self, term: &Term, scope: &Scope, groups: GroupedData) -> Result<Val> {
        let mut out = GroupedData::new();
        for (key, value) in groups.into_pairs() {
            let items = match value {
                Datum::Array(items) => items,
                other => {
                    return Err(QueryError::type_error(format!(
                        "Expected type ARRAY but found {}.",
                        other.type_name()
                    )))
                }
            };
            let first = Some(Val::Datum(Datum::Array(items)));
            let mut args = Args::new(self, term, scope, first);
            let val = self.eval_op(term.term_type, &mut args).await?;
            out.push(key, self.materialize(val).await?);
        }
        Ok(Val::Grouped(out))
    }

    /// Operator dispatch. The enum is closed; adding a term type without a
    /// handler fails to compile.
    async fn eval_op(&self, term_type: TermType, args: &mut Args<'_>) -> Result<Val> {
        match term_type {
            // Handled before dispatch.
            TermType::Datum
            | TermType::Skip
            | TermType::Update
            | TermType::Delete
            | TermType::GroupBy
            | TermType::InnerJoin
            | TermType::OuterJoin
            | TermType::EqJoin => Err(QueryError::internal(format!(
                "{} cannot be dispatched",
                term_type
            ))),

            // === Core data constructors ===
            TermType::MakeArray => self.make_array(args).await,
            TermType::MakeObj => self.make_obj(args).await,

            // === Functions & control flow ===
            TermType::Var => self.var(args).await,
            TermType::Func => self.make_func(args).await,
            TermType::Funcall => self.funcall(args).await,
            TermType::Branch => self.branch(args).await,
            TermType::And => self.and(args).await,
            TermType::Or => self.or(args).await,
            TermType::Not => self.not(args).await,

            // === Comparison ===
            TermType::Eq
            | TermType::Ne
            | TermType::Lt
            | TermType::Le
            | TermType::Gt
            | TermType::Ge => self.compare(term_type, args).await,

            // === Math ===
            TermType::Add | TermType::Sub | TermType::Mul => {
                self.arith_fold(term_type, args).await
            }
            TermType::Div => self.div(args).await,
            TermType::Mod => self.mod_op(args).await,

            // === Objects ===
            TermType::GetField => self.get_field(args).await,
            TermType::Pluck => self.pluck(args).await,
            TermType::Merge => self.merge(args).await,

            // === Transformations ===
            TermType::Filter => self.filter(args).await,
            TermType::Map => self.map(args).await,
            TermType::ConcatMap => self.concat_map(args).await,
            TermType::Reduce => self.reduce(args).await,

            // === Aggregations ===
            TermType::Count => self.count(args).await,
            TermType::Sum => self.sum(args).await,
            TermType::Avg => self.avg(args).await,
            TermType::Min => self.min_max(args, true).await,
            TermType::Max => self.min_max(args, false).await,
            TermType::Group => self.group(args).await,
            TermType::GroupedMapReduce => self.grouped_map_reduce(args).await,

            // === Tables & writes ===
            TermType::Table => self.table(args).await,
            TermType::Get => self.get(args).await,
            TermType::Replace => self.replace(args).await,

            // === Types ===
            TermType::TypeOf => self.type_of(args).await,
            TermType::CoerceTo => self.coerce_to(args).await,

            // === Array/sequence family (arrays.rs) ===
            TermType::Nth => self.nth(args).await,
            TermType::Slice => self.slice(args).await,
            TermType::Limit => self.limit(args).await,
            TermType::IsEmpty => self.is_empty(args).await,
            TermType::OffsetsOf => self.offsets_of(args).await,
            TermType::Contains => self.contains(args).await,
            TermType::Append => self.append(args).await,
            TermType::Prepend => self.prepend(args).await,
            TermType::Difference => self.difference(args).await,
            TermType::SetInsert => self.set_insert(args).await,
            TermType::SetIntersection => self.set_intersection(args).await,
            TermType::SetUnion => self.set_union(args).await,
            TermType::SetDifference => self.set_difference(args).await,
            TermType::InsertAt => self.insert_at(args).await,
            TermType::DeleteAt => self.delete_at(args).await,
            TermType::ChangeAt => self.change_at(args).await,
            TermType::SpliceAt => self.splice_at(args).await,
        }
    }

    /// Materialize a runtime value into a datum (terminal consumption for
    /// sequences, enforcing the array size limit).
    pub(crate) async fn materialize(&self, val: Val) -> Result<Datum> {
        match val {
            Val::Datum(d) => Ok(d),
            Val::Row(row) => Ok(row.row),
            Val::Sequence(mut seq) => Ok(Datum::Array(seq.drain(&self.env).await?)),
            Val::Grouped(groups) => Ok(groups.to_datum()),
            Val::Table(table) => {
                let rows = self.env.source().scan(&table.name).await?;
                Ok(Datum::Array(rows))
            }
            Val::Func(_) => Err(QueryError::type_error(
                "Query result must be a datum, not a FUNCTION.",
            )),
        }
    }

    /// Convert a runtime value into a sequence; tables scan, arrays wrap.
    pub(crate) async fn seq_of(&self, val: Val) -> Result<Sequence> {
        match val {
            Val::Sequence(seq) => Ok(seq),
            Val::Datum(Datum::Array(items)) => Ok(Sequence::from_vec(items)),
            Val::Table(table) => {
                let rows = self.env.source().scan(&table.name).await?;
                Ok(Sequence::from_vec(rows).with_binding(table))
            }
            other => Err(QueryError::type_error(format!(
                "Expected type SEQUENCE but found {}.",
                other.type_string()
            ))),
        }
    }

    /// Invoke a function closure. The scope is the closure's captured scope
    /// extended with the parameter bindings - never the caller's scope.
    pub(crate) async fn call_func(&self, func: &FuncVal, call_args: Vec<Datum>) -> Result<Val> {
        if call_args.len() != func.params.len() {
            return Err(QueryError::arity(format!(
                "Function expected {} arguments but found {}.",
                func.params.len(),
                call_args.len()
            )));
        }
        let scope = func
            .scope
            .extend(func.params.iter().copied().zip(call_args));
        let result = self.eval(&func.body, &scope).await;
        match (&func.origin, result) {
            (Some(frame), Err(e)) => Err(e.with_frame(frame.clone())),
            (_, result) => result,
        }
    }

    /// Invoke a function closure and materialize the result.
    pub(crate) async fn call_func_datum(
        &self,
        func: &FuncVal,
        call_args: Vec<Datum>,
    ) -> Result<Datum> {
        let val = self.call_func(func, call_args).await?;
        self.materialize(val).await
    }

    // ========================================================================
    // Core data constructors
    // ========================================================================

    async fn make_array(&self, args: &mut Args<'_>) -> Result<Val> {
        let mut builder = ArrayBuilder::with_capacity(self.env.limits(), args.len());
        for i in 0..args.len() {
            builder.push(args.datum_arg(i).await?)?;
        }
        Ok(Val::Datum(builder.finish()))
    }

    async fn make_obj(&self, args: &mut Args<'_>) -> Result<Val> {
        let mut builder = ObjectBuilder::new(self.env.limits());
        let names: Vec<String> = args.term().optargs.keys().cloned().collect();
        for name in names {
            let value = args
                .optarg_datum(&name)
                .await?
                .ok_or_else(|| QueryError::internal("MAKE_OBJ optarg vanished"))?;
            builder.insert(name, value)?;
        }
        Ok(Val::Datum(builder.finish()))
    }

    // ========================================================================
    // Functions & control flow
    // ========================================================================

    async fn var(&self, args: &mut Args<'_>) -> Result<Val> {
        let id = args.int_arg(0).await?;
        match args.scope().get(id) {
            Some(datum) => Ok(Val::Datum(datum.clone())),
            None => Err(QueryError::logic(format!(
                "Variable {} is not in scope.",
                id
            ))),
        }
    }

    async fn make_func(&self, args: &mut Args<'_>) -> Result<Val> {
        let params_datum = args.datum_arg(0).await?;
        let params: Vec<i64> = match &params_datum {
            Datum::Array(items) => items
                .iter()
                .map(|d| d.as_int())
                .collect::<Result<Vec<i64>>>()
                .map_err(|e| args.framed(e, 0))?,
            other => {
                return Err(args.framed(
                    QueryError::type_error(format!(
                        "Expected type ARRAY but found {}.",
                        other.type_name()
                    )),
                    0,
                ))
            }
        };
        let body = args
            .term()
            .arg(1)
            .cloned()
            .ok_or_else(|| QueryError::internal("FUNC missing body"))?;
        let origin = match &args.term().frame_hint {
            Some(FrameHint::At(frame)) => Some(frame.clone()),
            _ => None,
        };
        Ok(Val::Func(FuncVal {
            params: Arc::new(params),
            body: Arc::new(body),
            scope: args.scope().clone(),
            origin,
        }))
    }

    async fn funcall(&self, args: &mut Args<'_>) -> Result<Val> {
        let func = args.func_arg(0).await?;
        let mut call_args = Vec::with_capacity(args.len() - 1);
        for i in 1..args.len() {
            call_args.push(args.datum_arg(i).await?);
        }
        self.call_func(&func, call_args).await
    }

    async fn branch(&self, args: &mut Args<'_>) -> Result<Val> {
        let cond = args.datum_arg(0).await?;
        if cond.is_truthy() {
            args.arg(1).await
        } else {
            args.arg(2).await
        }
    }

    async fn and(&self, args: &mut Args<'_>) -> Result<Val> {
        for i in 0..args.len() {
            let datum = args.datum_arg(i).await?;
            if !datum.is_truthy() {
                return Ok(Val::Datum(Datum::Boolean(false)));
            }
        }
        Ok(Val::Datum(Datum::Boolean(true)))
    }

    async fn or(&self, args: &mut Args<'_>) -> Result<Val> {
        for i in 0..args.len() {
            let datum = args.datum_arg(i).await?;
            if datum.is_truthy() {
                return Ok(Val::Datum(Datum::Boolean(true)));
            }
        }
        Ok(Val::Datum(Datum::Boolean(false)))
    }

    async fn not(&self, args: &mut Args<'_>) -> Result<Val> {
        let datum = args.datum_arg(0).await?;
        Ok(Val::Datum(Datum::Boolean(!datum.is_truthy())))
    }

    // ========================================================================
    // Comparison & math
    // ========================================================================

    async fn compare(&self, term_type: TermType, args: &mut Args<'_>) -> Result<Val> {
        use std::cmp::Ordering;
        let a = args.datum_arg(0).await?;
        let b = args.datum_arg(1).await?;
        let result = match term_type {
            TermType::Eq => a == b,
            TermType::Ne => a != b,
            TermType::Lt => a.total_cmp(&b) == Ordering::Less,
            TermType::Le => a.total_cmp(&b) != Ordering::Greater,
            TermType::Gt => a.total_cmp(&b) == Ordering::Greater,
            TermType::Ge => a.total_cmp(&b) != Ordering::Less,
            _ => return Err(QueryError::internal("compare on non-comparison term")),
        };
        Ok(Val::Datum(Datum::Boolean(result)))
    }

    async fn arith_fold(&self, term_type: TermType, args: &mut Args<'_>) -> Result<Val> {
        let mut acc = args.number_arg(0).await?;
        for i in 1..args.len() {
            let n = args.number_arg(i).await?;
            acc = match term_type {
                TermType::Add => acc + n,
                TermType::Sub => acc - n,
                TermType::Mul => acc * n,
                _ => return Err(QueryError::internal("arith_fold on non-arith term")),
            };
        }
        Ok(Val::Datum(Datum::Number(acc)))
    }

    async fn div(&self, args: &mut Args<'_>) -> Result<Val> {
        let a = args.number_arg(0).await?;
        let b = args.number_arg(1).await?;
        if b == 0.0 {
            return Err(QueryError::logic("Cannot divide by zero."));
        }
        Ok(Val::Datum(Datum::Number(a / b)))
    }

    async fn mod_op(&self, args: &mut Args<'_>) -> Result<Val> {
        let a = args.number_arg(0).await?;
        let b = args.number_arg(1).await?;
        if b == 0.0 {
            return Err(QueryError::logic("Cannot take a number modulo 0."));
        }
        Ok(Val::Datum(Datum::Number(a % b)))
    }

    // ========================================================================
    // Objects
    // ========================================================================

    async fn get_field(&self, args: &mut Args<'_>) -> Result<Val> {
        let obj = args.datum_arg(0).await?;
        let field = args.string_arg(1).await?;
        match obj {
            Datum::Object(map) => map
                .get(&field)
                .cloned()
                .map(Val::Datum)
                .ok_or_else(|| {
                    QueryError::non_existence(format!("No attribute `{}` in object.", field))
                }),
            other => Err(args.framed(
                QueryError::type_error(format!(
                    "Expected type OBJECT but found {}.",
                    other.type_name()
                )),
                0,
            )),
        }
    }

    async fn pluck(&self, args: &mut Args<'_>) -> Result<Val> {
        fn pluck_obj(map: &HashMap<String, Datum>, fields: &[String]) -> Datum {
            let mut out = HashMap::new();
            for field in fields {
                if let Some(value) = map.get(field) {
                    out.insert(field.clone(), value.clone());
                }
            }
            Datum::Object(out)
        }

        let val = args.arg(0).await?;
        let mut fields = Vec::with_capacity(args.len() - 1);
        for i in 1..args.len() {
            fields.push(args.string_arg(i).await?);
        }

        match val {
            Val::Datum(Datum::Object(map)) => Ok(Val::Datum(pluck_obj(&map, &fields))),
            Val::Row(row) => match &row.row {
                Datum::Object(map) => Ok(Val::Datum(pluck_obj(map, &fields))),
                Datum::Null => Ok(Val::Datum(Datum::Null)),
                other => Err(QueryError::type_error(format!(
                    "Expected type OBJECT but found {}.",
                    other.type_name()
                ))),
            },
            other => {
                let mut seq = self.seq_of(other).await.map_err(|e| args.framed(e, 0))?;
                let mut builder = ArrayBuilder::new(self.env.limits());
                loop {
                    let chunk = seq
                        .next_batch(&self.env, &BatchSpec::at_most(DEFAULT_BATCH_ROWS))
                        .await?;
                    if chunk.is_empty() {
                        break;
                    }
                    for row in chunk {
                        match row {
                            Datum::Object(map) => builder.push(pluck_obj(&map, &fields))?,
                            other => {
                                return Err(QueryError::type_error(format!(
                                    "Expected type OBJECT but found {}.",
                                    other.type_name()
                                )))
                            }
                        }
                    }
                }
                Ok(Val::Datum(builder.finish()))
            }
        }
    }

    /// Deep merge: objects merge recursively, anything else is replaced by
    /// the right-hand side.
    pub(crate) fn deep_merge(left: &Datum, right: &Datum) -> Datum {
        match (left, right) {
            (Datum::Object(a), Datum::Object(b)) => {
                let mut out = a.clone();
                for (key, rv) in b {
                    let merged = match out.get(key) {
                        Some(lv) => Self::deep_merge(lv, rv),
                        None => rv.clone(),
                    };
                    out.insert(key.clone(), merged);
                }
                Datum::Object(out)
            }
            (_, other) => other.clone(),
        }
    }

    async fn merge(&self, args: &mut Args<'_>) -> Result<Val> {
        let mut acc = args.datum_arg(0).await?;
        if !matches!(acc, Datum::Object(_)) {
            return Err(args.framed(
                QueryError::type_error(format!(
                    "Expected type OBJECT but found {}.",
                    acc.type_name()
                )),
                0,
            ));
        }
        for i in 1..args.len() {
            let next = args.datum_arg(i).await?;
            if !matches!(next, Datum::Object(_)) {
                return Err(args.framed(
                    QueryError::type_error(format!(
                        "Expected type OBJECT but found {}.",
                        next.type_name()
                    )),
                    i,
                ));
            }
            acc = Self::deep_merge(&acc, &next);
        }
        Ok(Val::Datum(acc))
    }

    // ========================================================================
    // Transformations
    // ========================================================================

    async fn filter(&self, args: &mut Args<'_>) -> Result<Val> {
        let mut seq = args.seq_arg(0).await?;
        let binding = seq.binding().cloned();
        let predicate = args.arg(1).await?;

        enum Pred {
            Func(FuncVal),
            Pattern(HashMap<String, Datum>),
        }
        let predicate = match predicate {
            Val::Func(f) => Pred::Func(f),
            Val::Datum(Datum::Object(map)) => Pred::Pattern(map),
            other => {
                return Err(args.framed(
                    QueryError::type_error(format!(
                        "Expected type FUNCTION but found {}.",
                        other.type_string()
                    )),
                    1,
                ))
            }
        };

        let mut builder = ArrayBuilder::new(self.env.limits());
        loop {
            let chunk = seq
                .next_batch(&self.env, &BatchSpec::at_most(DEFAULT_BATCH_ROWS))
                .await?;
            if chunk.is_empty() {
                break;
            }
            for row in chunk {
                let keep = match &predicate {
                    Pred::Func(f) => self.call_func_datum(f, vec![row.clone()]).await?.is_truthy(),
                    Pred::Pattern(pattern) => match row.as_object() {
                        Some(obj) => pattern.iter().all(|(k, v)| obj.get(k) == Some(v)),
                        None => false,
                    },
                };
                if keep {
                    builder.push(row)?;
                }
            }
        }
        let mut result = Sequence::from_vec(builder.into_vec());
        if let Some(table) = binding {
            // Filtered table rows are still table rows.
            result = result.with_binding(table);
        }
        Ok(Val::Sequence(result))
    }

    async fn map(&self, args: &mut Args<'_>) -> Result<Val> {
        let mut seq = args.seq_arg(0).await?;
        let func = args.func_arg(1).await?;
        let mut builder = ArrayBuilder::new(self.env.limits());
        loop {
            let chunk = seq
                .next_batch(&self.env, &BatchSpec::at_most(DEFAULT_BATCH_ROWS))
                .await?;
            if chunk.is_empty() {
                break;
            }
            for row in chunk {
                builder.push(self.call_func_datum(&func, vec![row]).await?)?;
            }
        }
        Ok(Val::Sequence(Sequence::from_vec(builder.into_vec())))
    }

    async fn concat_map(&self, args: &mut Args<'_>) -> Result<Val> {
        let mut seq = args.seq_arg(0).await?;
        let func = args.func_arg(1).await?;
        let mut builder = ArrayBuilder::new(self.env.limits());
        loop {
            let chunk = seq
                .next_batch(&self.env, &BatchSpec::at_most(DEFAULT_BATCH_ROWS))
                .await?;
            if chunk.is_empty() {
                break;
            }
            for row in chunk {
                let val = self.call_func(&func, vec![row]).await?;
                let mut inner = self.seq_of(val).await?;
                builder.extend(inner.drain(&self.env).await?)?;
            }
        }
        Ok(Val::Sequence(Sequence::from_vec(builder.into_vec())))
    }

    async fn reduce(&self, args: &mut Args<'_>) -> Result<Val> {
        let mut seq = args.seq_arg(0).await?;
        let func = args.func_arg(1).await?;
        let mut acc: Option<Datum> = None;
        loop {
            let chunk = seq.next_batch(&self.env, &BatchSpec::all()).await?;
            if chunk.is_empty() {
                break;
            }
            for row in chunk {
                acc = Some(match acc {
                    None => row,
                    Some(prev) => self.call_func_datum(&func, vec![prev, row]).await?,
                });
            }
        }
        acc.map(Val::Datum)
            .ok_or_else(|| QueryError::non_existence("Cannot reduce over an empty stream."))
    }

    // ========================================================================
    // Aggregations
    // ========================================================================

    async fn count(&self, args: &mut Args<'_>) -> Result<Val> {
        let mut seq = args.seq_arg(0).await?;
        let mut n: u64 = 0;
        loop {
            let chunk = seq.next_batch(&self.env, &BatchSpec::all()).await?;
            if chunk.is_empty() {
                break;
            }
            n += chunk.len() as u64;
        }
        Ok(Val::Datum(Datum::Number(n as f64)))
    }

    /// Numeric values contributed by one row for SUM/AVG: either the row
    /// itself, or its value under the optional field name (rows missing the
    /// field are skipped).
    fn numeric_of(row: Datum, field: Option<&str>) -> Result<Option<f64>> {
        let value = match field {
            None => row,
            Some(name) => match row.as_object().and_then(|obj| obj.get(name)) {
                Some(v) => v.clone(),
                None => return Ok(None),
            },
        };
        value
            .as_number()
            .map(Some)
            .ok_or_else(|| {
                QueryError::type_error(format!(
                    "Expected type NUMBER but found {}.",
                    value.type_name()
                ))
            })
    }

    async fn sum(&self, args: &mut Args<'_>) -> Result<Val> {
        let mut seq = args.seq_arg(0).await?;
        let field = if args.len() > 1 {
            Some(args.string_arg(1).await?)
        } else {
            None
        };
        let mut total = 0.0;
        loop {
            let chunk = seq.next_batch(&self.env, &BatchSpec::all()).await?;
            if chunk.is_empty() {
                break;
            }
            for row in chunk {
                if let Some(n) = Self::numeric_of(row, field.as_deref())? {
                    total += n;
                }
            }
        }
        Ok(Val::Datum(Datum::Number(total)))
    }

    async fn avg(&self, args: &mut Args<'_>) -> Result<Val> {
        let mut seq = args.seq_arg(0).await?;
        let field = if args.len() > 1 {
            Some(args.string_arg(1).await?)
        } else {
            None
        };
        let mut total = 0.0;
        let mut n: u64 = 0;
        loop {
            let chunk = seq.next_batch(&self.env, &BatchSpec::all()).await?;
            if chunk.is_empty() {
                break;
            }
            for row in chunk {
                if let Some(value) = Self::numeric_of(row, field.as_deref())? {
                    total += value;
                    n += 1;
                }
            }
        }
        if n == 0 {
            return Ok(Val::Datum(Datum::Null));
        }
        Ok(Val::Datum(Datum::Number(total / n as f64)))
    }

    async fn min_max(&self, args: &mut Args<'_>, minimum: bool) -> Result<Val> {
        use std::cmp::Ordering;
        let mut seq = args.seq_arg(0).await?;
        let mut best: Option<Datum> = None;
        loop {
            let chunk = seq.next_batch(&self.env, &BatchSpec::all()).await?;
            if chunk.is_empty() {
                break;
            }
            for row in chunk {
                best = Some(match best {
                    None => row,
                    Some(prev) => {
                        let replace = match row.total_cmp(&prev) {
                            Ordering::Less => minimum,
                            Ordering::Greater => !minimum,
                            Ordering::Equal => false,
                        };
                        if replace {
                            row
                        } else {
                            prev
                        }
                    }
                });
            }
        }
        best.map(Val::Datum).ok_or_else(|| {
            QueryError::non_existence(if minimum {
                "Cannot take the minimum of an empty stream."
            } else {
                "Cannot take the maximum of an empty stream."
            })
        })
    }

    async fn group(&self, args: &mut Args<'_>) -> Result<Val> {
        let val = args.arg(0).await?;
        if matches!(val, Val::Grouped(_)) {
            return Err(QueryError::type_error(
                "Expected type SEQUENCE but found GROUPED_DATA.",
            ));
        }
        let mut seq = self.seq_of(val).await.map_err(|e| args.framed(e, 0))?;
        let grouping = args.arg(1).await?;

        enum KeyOf {
            Func(FuncVal),
            Field(String),
        }
        let grouping = match grouping {
            Val::Func(f) => KeyOf::Func(f),
            Val::Datum(Datum::String(field)) => KeyOf::Field(field),
            other => {
                return Err(args.framed(
                    QueryError::type_error(format!(
                        "Expected type FUNCTION but found {}.",
                        other.type_string()
                    )),
                    1,
                ))
            }
        };

        let mut acc = GroupAccumulator::new();
        loop {
            let chunk = seq.next_batch(&self.env, &BatchSpec::all()).await?;
            if chunk.is_empty() {
                break;
            }
            for row in chunk {
                let key = match &grouping {
                    KeyOf::Func(f) => self.call_func_datum(f, vec![row.clone()]).await?,
                    KeyOf::Field(name) => row
                        .as_object()
                        .and_then(|obj| obj.get(name))
                        .cloned()
                        .unwrap_or(Datum::Null),
                };
                acc.push(key, row);
            }
        }
        Ok(Val::Grouped(acc.finish()))
    }

    /// Group rows by `group_fn`, map each with `map_fn`, and fold each
    /// group's mapped values pairwise with `reduce_fn`. Produces an array of
    /// `{group, reduction}` rows in first-seen key order.
    async fn grouped_map_reduce(&self, args: &mut Args<'_>) -> Result<Val> {
        let mut seq = args.seq_arg(0).await?;
        let group_fn = args.func_arg(1).await?;
        let map_fn = args.func_arg(2).await?;
        let reduce_fn = args.func_arg(3).await?;

        let mut groups: Vec<(Datum, Datum)> = Vec::new();
        loop {
            let chunk = seq.next_batch(&self.env, &BatchSpec::all()).await?;
            if chunk.is_empty() {
                break;
            }
            for row in chunk {
                let key = self.call_func_datum(&group_fn, vec![row.clone()]).await?;
                let mapped = self.call_func_datum(&map_fn, vec![row]).await?;
                match groups.iter_mut().find(|(k, _)| *k == key) {
                    Some((_, acc)) => {
                        *acc = self
                            .call_func_datum(&reduce_fn, vec![acc.clone(), mapped])
                            .await?;
                    }
                    None => groups.push((key, mapped)),
                }
            }
        }

        let mut builder = ArrayBuilder::with_capacity(self.env.limits(), groups.len());
        for (key, reduction) in groups {
            builder.push(Datum::object([
                ("group", key),
                ("reduction", reduction),
            ]))?;
        }
        Ok(Val::Datum(builder.finish()))
    }

    // ========================================================================
    // Tables & writes
    // ========================================================================

    async fn table(&self, args: &mut Args<'_>) -> Result<Val> {
        let name = args.string_arg(0).await?;
        Ok(Val::Table(TableRef::new(name)))
    }

    async fn get(&self, args: &mut Args<'_>) -> Result<Val> {
        let val = args.arg(0).await?;
        let table = match val {
            Val::Table(table) => table,
            other => {
                return Err(args.framed(
                    QueryError::type_error(format!(
                        "Expected type TABLE but found {}.",
                        other.type_string()
                    )),
                    0,
                ))
            }
        };
        let key = args.datum_arg(1).await?;
        let row = self
            .env
            .source()
            .get(&table.name, &key)
            .await?
            .unwrap_or(Datum::Null);
        Ok(Val::Row(SingleRow { table, key, row }))
    }

    async fn replace(&self, args: &mut Args<'_>) -> Result<Val> {
        let val = args.arg(0).await?;
        let func = args.func_arg(1).await?;
        let mut report = WriteReport::default();
        match val {
            Val::Row(row) => {
                self.replace_row(&func, &row.table, row.key, row.row, &mut report)
                    .await?;
            }
            Val::Table(table) => {
                let rows = self.env.source().scan(&table.name).await?;
                for row in rows {
                    let key = Self::primary_key(&row)?;
                    self.replace_row(&func, &table, key, row, &mut report).await?;
                }
            }
            Val::Sequence(mut seq) => {
                let table = seq.binding().cloned().ok_or_else(|| {
                    args.framed(
                        QueryError::type_error("Expected type SELECTION but found STREAM."),
                        0,
                    )
                })?;
                let rows = seq.drain(&self.env).await?;
                for row in rows {
                    let key = Self::primary_key(&row)?;
                    self.replace_row(&func, &table, key, row, &mut report).await?;
                }
            }
            other => {
                return Err(args.framed(
                    QueryError::type_error(format!(
                        "Expected type SELECTION but found {}.",
                        other.type_string()
                    )),
                    0,
                ))
            }
        }
        Ok(Val::Datum(report.to_datum()))
    }

    fn primary_key(row: &Datum) -> Result<Datum> {
        row.as_object()
            .and_then(|obj| obj.get("id"))
            .cloned()
            .ok_or_else(|| QueryError::logic("Row has no primary key `id`."))
    }

    async fn replace_row(
        &self,
        func: &FuncVal,
        table: &TableRef,
        key: Datum,
        old: Datum,
        report: &mut WriteReport,
    ) -> Result<()> {
        let new = self.call_func_datum(func, vec![old.clone()]).await?;
        match (&old, &new) {
            (Datum::Null, Datum::Null) => {
                report.skipped += 1;
            }
            (Datum::Null, Datum::Object(_)) => {
                if Self::primary_key(&new)? != key {
                    return Err(QueryError::logic(format!(
                        "Primary key `id` cannot be changed ({} -> {}).",
                        key,
                        Self::primary_key(&new)?
                    )));
                }
                self.env.source().store(&table.name, &key, Some(new)).await?;
                report.inserted += 1;
            }
            (_, Datum::Null) => {
                self.env.source().store(&table.name, &key, None).await?;
                report.deleted += 1;
            }
            (_, Datum::Object(_)) => {
                if new == old {
                    report.unchanged += 1;
                } else {
                    if Self::primary_key(&new)? != key {
                        return Err(QueryError::logic(format!(
                            "Primary key `id` cannot be changed ({} -> {}).",
                            key,
                            Self::primary_key(&new)?
                        )));
                    }
                    self.env.source().store(&table.name, &key, Some(new)).await?;
                    report.replaced += 1;
                }
            }
            (_, other) => {
                return Err(QueryError::type_error(format!(
                    "Inserted value must be an OBJECT (got {}).",
                    other.type_name()
                )));
            }
        }
        Ok(())
    }

    // ========================================================================
    // Type operations
    // ========================================================================

    async fn type_of(&self, args: &mut Args<'_>) -> Result<Val> {
        let val = args.arg(0).await?;
        Ok(Val::Datum(Datum::String(val.type_string())))
    }

    async fn coerce_to(&self, args: &mut Args<'_>) -> Result<Val> {
        let val = args.arg(0).await?;
        let target = args.string_arg(1).await?.to_uppercase();
        let source_type = val.type_string();

        let coerce_err = |from: &str, to: &str| {
            QueryError::type_error(format!("Cannot coerce {} to {}.", from, to))
        };

        match target.as_str() {
            "ARRAY" => match val {
                Val::Datum(Datum::Array(items)) => Ok(Val::Datum(Datum::Array(items))),
                Val::Sequence(_) | Val::Table(_) => {
                    let mut seq = self.seq_of(val).await?;
                    Ok(Val::Datum(Datum::Array(seq.drain(&self.env).await?)))
                }
                _ => Err(coerce_err(&source_type, "ARRAY")),
            },
            "OBJECT" => {
                let datum = match val {
                    Val::Datum(d) => d,
                    Val::Row(row) => row.row,
                    Val::Sequence(_) | Val::Table(_) => {
                        let mut seq = self.seq_of(val).await?;
                        Datum::Array(seq.drain(&self.env).await?)
                    }
                    _ => return Err(coerce_err(&source_type, "OBJECT")),
                };
                match datum {
                    Datum::Object(map) => Ok(Val::Datum(Datum::Object(map))),
                    Datum::Array(pairs) => {
                        let mut builder = ObjectBuilder::new(self.env.limits());
                        for pair in pairs {
                            let items = pair
                                .as_array()
                                .filter(|p| p.len() == 2)
                                .ok_or_else(|| {
                                    QueryError::type_error(
                                        "Expected a 2-element [key, value] pair.",
                                    )
                                })?;
                            let key = items[0].as_string().ok_or_else(|| {
                                QueryError::type_error(format!(
                                    "Expected type STRING but found {}.",
                                    items[0].type_name()
                                ))
                            })?;
                            builder.insert(key, items[1].clone())?;
                        }
                        Ok(Val::Datum(builder.finish()))
                    }
                    other => Err(coerce_err(other.type_name(), "OBJECT")),
                }
            }
            "STRING" => {
                let datum = val.into_datum_strict()?;
                match datum {
                    Datum::String(s) => Ok(Val::Datum(Datum::String(s))),
                    Datum::Binary(bytes) => String::from_utf8(bytes)
                        .map(|s| Val::Datum(Datum::String(s)))
                        .map_err(|_| QueryError::logic("Binary is not valid UTF-8.")),
                    other => {
                        let json: serde_json::Value = other.into();
                        Ok(Val::Datum(Datum::String(json.to_string())))
                    }
                }
            }
            "NUMBER" => {
                let datum = val.into_datum_strict()?;
                match datum {
                    Datum::Number(n) => Ok(Val::Datum(Datum::Number(n))),
                    Datum::String(s) => s
                        .trim()
                        .parse::<f64>()
                        .map(|n| Val::Datum(Datum::Number(n)))
                        .map_err(|_| {
                            QueryError::logic(format!("Could not coerce `{}` to NUMBER.", s))
                        }),
                    other => Err(coerce_err(other.type_name(), "NUMBER")),
                }
            }
            "BINARY" => {
                let datum = val.into_datum_strict()?;
                match datum {
                    Datum::Binary(bytes) => Ok(Val::Datum(Datum::Binary(bytes))),
                    Datum::String(s) => Ok(Val::Datum(Datum::Binary(s.into_bytes()))),
                    other => Err(coerce_err(other.type_name(), "BINARY")),
                }
            }
            "BOOL" => {
                let datum = val.into_datum_strict()?;
                Ok(Val::Datum(Datum::Boolean(datum.is_truthy())))
            }
            other => Err(QueryError::logic(format!("Unknown type name `{}`.", other))),
        }
    }
}
