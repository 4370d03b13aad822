//! ReQL Abstract Syntax Tree (AST) implementation.
//!
//! A query is represented as a tree of `Term` nodes, where each node has:
//!
//! - A `TermType` specifying the operation
//! - Positional arguments (`args`): child terms
//! - Optional named arguments (`optargs`): key-value pairs
//! - Optional datum value for literal data
//!
//! Term trees are built once (by an external parser or the fluent builders
//! below), passed through the rewrite compiler, and then evaluated possibly
//! many times; evaluation never mutates the tree.
//!
//! # Backtrace hints
//!
//! The rewrite compiler relocates user-supplied subtrees into synthetic
//! expansions. So that errors raised inside an expansion still report the
//! argument positions the user actually wrote, a node may carry a
//! [`FrameHint`]: `At(frame)` pins the frame reported when this node fails as
//! a child, `Elide` suppresses the frame entirely (synthetic plumbing nodes).
//! Nodes without a hint report their physical position.
//!
//! # Example
//!
//! Building a query: `r.table("users").filter({age: 25})`
//!
//! ```rust,ignore
//! use reql_core::reql::{Term, TermType, Datum};
//!
//! let query = Term::new(TermType::Filter)
//!     .with_arg(Term::table("users"))
//!     .with_arg(Term::datum(Datum::object([("age", Datum::Number(25.0))])));
//! ```

use super::datum::Datum;
use super::error::Frame;
use super::terms::TermType;
use std::collections::HashMap;

/// How a node reports itself in backtraces when it fails as a child of its
/// parent. Set only by the rewrite compiler.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameHint {
    /// Report this frame instead of the physical argument position.
    At(Frame),
    /// Report no frame at all; the node does not correspond to anything the
    /// user wrote.
    Elide,
}

/// A ReQL Term - the fundamental building block of queries.
///
/// Represents a single node in the query AST tree. Each term consists of:
/// - `term_type`: The operation to perform (e.g., FILTER, MAP, NTH)
/// - `args`: Positional arguments (child terms)
/// - `optargs`: Named optional arguments
/// - `datum`: For DATUM terms, the actual value
#[derive(Debug, Clone, PartialEq)]
pub struct Term {
    /// The type of this term
    pub term_type: TermType,

    /// Positional arguments
    pub args: Vec<Term>,

    /// Optional named arguments
    pub optargs: HashMap<String, Term>,

    /// Datum value (for Datum terms)
    pub datum: Option<Datum>,

    /// Backtrace reporting hint, set by the rewrite compiler
    pub frame_hint: Option<FrameHint>,
}

impl Term {
    /// Create a new term with given type
    pub fn new(term_type: TermType) -> Self {
        Self {
            term_type,
            args: Vec::new(),
            optargs: HashMap::new(),
            datum: None,
            frame_hint: None,
        }
    }

    /// Create a datum term
    pub fn datum(datum: impl Into<Datum>) -> Self {
        Self {
            term_type: TermType::Datum,
            args: Vec::new(),
            optargs: HashMap::new(),
            datum: Some(datum.into()),
            frame_hint: None,
        }
    }

    /// Add a positional argument
    pub fn with_arg(mut self, arg: Term) -> Self {
        self.args.push(arg);
        self
    }

    /// Add multiple positional arguments
    pub fn with_args(mut self, args: Vec<Term>) -> Self {
        self.args.extend(args);
        self
    }

    /// Add an optional named argument
    pub fn with_optarg<S: Into<String>>(mut self, name: S, value: Term) -> Self {
        self.optargs.insert(name.into(), value);
        self
    }

    /// Add multiple optional arguments
    pub fn with_optargs(mut self, optargs: HashMap<String, Term>) -> Self {
        self.optargs.extend(optargs);
        self
    }

    /// Pin the backtrace frame this node reports when it fails as a child
    pub fn at_frame(mut self, frame: Frame) -> Self {
        self.frame_hint = Some(FrameHint::At(frame));
        self
    }

    /// Suppress this node's backtrace frame (synthetic rewrite plumbing)
    pub fn elided(mut self) -> Self {
        self.frame_hint = Some(FrameHint::Elide);
        self
    }

    /// Get the first argument
    pub fn first_arg(&self) -> Option<&Term> {
        self.args.first()
    }

    /// Get argument at index
    pub fn arg(&self, index: usize) -> Option<&Term> {
        self.args.get(index)
    }

    /// Get optional argument by name
    pub fn optarg(&self, name: &str) -> Option<&Term> {
        self.optargs.get(name)
    }

    /// Number of positional arguments
    pub fn num_args(&self) -> usize {
        self.args.len()
    }

    /// Check if this is a datum term
    pub fn is_datum(&self) -> bool {
        self.term_type == TermType::Datum
    }

    /// Get datum value if this is a datum term
    pub fn as_datum(&self) -> Option<&Datum> {
        self.datum.as_ref()
    }

    /// Pretty print the term tree
    pub fn pretty_print(&self, indent: usize) -> String {
        let indent_str = "  ".repeat(indent);
        let mut result = format!("{}{}(", indent_str, self.term_type.name());

        if let Some(datum) = &self.datum {
            result.push_str(&format!("{:?}", datum));
        }

        if !self.args.is_empty() {
            result.push('\n');
            for (i, arg) in self.args.iter().enumerate() {
                result.push_str(&arg.pretty_print(indent + 1));
                if i < self.args.len() - 1 {
                    result.push(',');
                }
                result.push('\n');
            }
            result.push_str(&indent_str);
        }

        if !self.optargs.is_empty() {
            result.push_str(" {");
            for (key, value) in &self.optargs {
                result.push_str(&format!("\n{}  {}: ", indent_str, key));
                result.push_str(&value.pretty_print(indent + 2));
            }
            result.push_str(&format!("\n{}}}", indent_str));
        }

        result.push(')');
        result
    }
}

// === Convenience constructors ===

impl Term {
    // Tables & rows
    pub fn table<S: Into<String>>(name: S) -> Self {
        Term::new(TermType::Table).with_arg(Term::datum(Datum::String(name.into())))
    }

    pub fn get(table: Term, key: impl Into<Datum>) -> Self {
        Term::new(TermType::Get)
            .with_arg(table)
            .with_arg(Term::datum(key))
    }

    // Sequence access
    pub fn nth(seq: Term, index: i64) -> Self {
        Term::new(TermType::Nth)
            .with_arg(seq)
            .with_arg(Term::datum(index))
    }

    pub fn slice(seq: Term, left: i64, right: i64) -> Self {
        Term::new(TermType::Slice)
            .with_arg(seq)
            .with_arg(Term::datum(left))
            .with_arg(Term::datum(right))
    }

    pub fn limit(seq: Term, n: i64) -> Self {
        Term::new(TermType::Limit)
            .with_arg(seq)
            .with_arg(Term::datum(n))
    }

    pub fn skip(seq: Term, n: i64) -> Self {
        Term::new(TermType::Skip)
            .with_arg(seq)
            .with_arg(Term::datum(n))
    }

    pub fn is_empty(seq: Term) -> Self {
        Term::new(TermType::IsEmpty).with_arg(seq)
    }

    pub fn contains(seq: Term, needles: Vec<Term>) -> Self {
        Term::new(TermType::Contains).with_arg(seq).with_args(needles)
    }

    pub fn offsets_of(seq: Term, needle: Term) -> Self {
        Term::new(TermType::OffsetsOf).with_arg(seq).with_arg(needle)
    }

    // Array mutations
    pub fn append(arr: Term, value: Term) -> Self {
        Term::new(TermType::Append).with_arg(arr).with_arg(value)
    }

    pub fn prepend(arr: Term, value: Term) -> Self {
        Term::new(TermType::Prepend).with_arg(arr).with_arg(value)
    }

    pub fn insert_at(arr: Term, index: i64, value: Term) -> Self {
        Term::new(TermType::InsertAt)
            .with_arg(arr)
            .with_arg(Term::datum(index))
            .with_arg(value)
    }

    pub fn splice_at(arr: Term, index: i64, values: Term) -> Self {
        Term::new(TermType::SpliceAt)
            .with_arg(arr)
            .with_arg(Term::datum(index))
            .with_arg(values)
    }

    pub fn delete_at(arr: Term, index: i64) -> Self {
        Term::new(TermType::DeleteAt)
            .with_arg(arr)
            .with_arg(Term::datum(index))
    }

    pub fn change_at(arr: Term, index: i64, value: Term) -> Self {
        Term::new(TermType::ChangeAt)
            .with_arg(arr)
            .with_arg(Term::datum(index))
            .with_arg(value)
    }

    // Transformations
    pub fn filter(seq: Term, predicate: Term) -> Self {
        Term::new(TermType::Filter).with_arg(seq).with_arg(predicate)
    }

    pub fn map(seq: Term, mapping: Term) -> Self {
        Term::new(TermType::Map).with_arg(seq).with_arg(mapping)
    }

    pub fn concat_map(seq: Term, mapping: Term) -> Self {
        Term::new(TermType::ConcatMap).with_arg(seq).with_arg(mapping)
    }

    pub fn reduce(seq: Term, reduction: Term) -> Self {
        Term::new(TermType::Reduce).with_arg(seq).with_arg(reduction)
    }

    // Aggregations
    pub fn count(seq: Term) -> Self {
        Term::new(TermType::Count).with_arg(seq)
    }

    pub fn group(seq: Term, key: Term) -> Self {
        Term::new(TermType::Group).with_arg(seq).with_arg(key)
    }

    pub fn group_by(seq: Term, attrs: Vec<&str>, reduction: Datum) -> Self {
        Term::new(TermType::GroupBy)
            .with_arg(seq)
            .with_arg(Term::datum(Datum::Array(
                attrs.into_iter().map(Datum::from).collect(),
            )))
            .with_arg(Term::datum(reduction))
    }

    // Joins
    pub fn inner_join(left: Term, right: Term, predicate: Term) -> Self {
        Term::new(TermType::InnerJoin)
            .with_arg(left)
            .with_arg(right)
            .with_arg(predicate)
    }

    pub fn outer_join(left: Term, right: Term, predicate: Term) -> Self {
        Term::new(TermType::OuterJoin)
            .with_arg(left)
            .with_arg(right)
            .with_arg(predicate)
    }

    pub fn eq_join(left: Term, field: &str, right: Term) -> Self {
        Term::new(TermType::EqJoin)
            .with_arg(left)
            .with_arg(Term::datum(field))
            .with_arg(right)
    }

    // Write operations
    pub fn update(selection: Term, mapping: Term) -> Self {
        Term::new(TermType::Update).with_arg(selection).with_arg(mapping)
    }

    pub fn delete(selection: Term) -> Self {
        Term::new(TermType::Delete).with_arg(selection)
    }

    pub fn replace(selection: Term, func: Term) -> Self {
        Term::new(TermType::Replace).with_arg(selection).with_arg(func)
    }

    // Functions
    pub fn var(id: i64) -> Self {
        Term::new(TermType::Var).with_arg(Term::datum(id))
    }

    pub fn func(params: Vec<i64>, body: Term) -> Self {
        Term::new(TermType::Func)
            .with_arg(Term::datum(Datum::Array(
                params.into_iter().map(Datum::from).collect(),
            )))
            .with_arg(body)
    }

    pub fn funcall(func: Term, args: Vec<Term>) -> Self {
        Term::new(TermType::Funcall).with_arg(func).with_args(args)
    }

    // Control flow
    pub fn branch(cond: Term, if_true: Term, if_false: Term) -> Self {
        Term::new(TermType::Branch)
            .with_arg(cond)
            .with_arg(if_true)
            .with_arg(if_false)
    }

    // Objects
    pub fn get_field(obj: Term, field: &str) -> Self {
        Term::new(TermType::GetField)
            .with_arg(obj)
            .with_arg(Term::datum(field))
    }

    pub fn merge(left: Term, right: Term) -> Self {
        Term::new(TermType::Merge).with_arg(left).with_arg(right)
    }

    // Math operations
    pub fn add(terms: Vec<Term>) -> Self {
        Term::new(TermType::Add).with_args(terms)
    }

    pub fn sub(terms: Vec<Term>) -> Self {
        Term::new(TermType::Sub).with_args(terms)
    }

    pub fn mul(terms: Vec<Term>) -> Self {
        Term::new(TermType::Mul).with_args(terms)
    }

    pub fn div(left: Term, right: Term) -> Self {
        Term::new(TermType::Div).with_arg(left).with_arg(right)
    }

    // Logic operations
    pub fn eq(left: Term, right: Term) -> Self {
        Term::new(TermType::Eq).with_arg(left).with_arg(right)
    }

    pub fn ne(left: Term, right: Term) -> Self {
        Term::new(TermType::Ne).with_arg(left).with_arg(right)
    }

    pub fn lt(left: Term, right: Term) -> Self {
        Term::new(TermType::Lt).with_arg(left).with_arg(right)
    }

    pub fn gt(left: Term, right: Term) -> Self {
        Term::new(TermType::Gt).with_arg(left).with_arg(right)
    }

    pub fn not(term: Term) -> Self {
        Term::new(TermType::Not).with_arg(term)
    }

    // Types
    pub fn type_of(term: Term) -> Self {
        Term::new(TermType::TypeOf).with_arg(term)
    }

    pub fn coerce_to(term: Term, target: &str) -> Self {
        Term::new(TermType::CoerceTo)
            .with_arg(term)
            .with_arg(Term::datum(target))
    }

    /// An array literal built from MAKE_ARRAY
    pub fn make_array(items: Vec<Term>) -> Self {
        Term::new(TermType::MakeArray).with_args(items)
    }

    /// An object literal built from MAKE_OBJ optargs
    pub fn make_obj<S: Into<String>, I: IntoIterator<Item = (S, Term)>>(fields: I) -> Self {
        let mut term = Term::new(TermType::MakeObj);
        for (k, v) in fields {
            term = term.with_optarg(k, v);
        }
        term
    }
}
