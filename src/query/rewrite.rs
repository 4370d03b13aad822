//! Compile-time expansion of sugared terms into primitive trees.
//!
//! GROUP_BY, INNER_JOIN, OUTER_JOIN, EQ_JOIN, UPDATE, DELETE and SKIP are not
//! primitive: before evaluation they are expanded, exactly once, into trees
//! built from MAP, CONCAT_MAP, BRANCH, GET_FIELD, MERGE, FUNCALL and
//! anonymous function literals. The expanded tree is what gets evaluated and
//! what errors unwind through.
//!
//! # Variable hygiene
//!
//! Fresh bound variables come from a [`Gensym`] threaded through the whole
//! query compilation. Identifiers are negative and never reused, so they
//! cannot collide with client-assigned (non-negative) variables or with each
//! other across sibling rewrites.
//!
//! # Backtrace fidelity
//!
//! Frames reported for errors inside an expansion must reference the
//! argument positions the user wrote, not the expansion's internal shape.
//! Relocated user subtrees are pinned with [`Term::at_frame`]; synthetic
//! plumbing nodes are [`Term::elided`]. Optional arguments given to the
//! sugared term are threaded unchanged onto the root of its expansion.

use crate::reql::ast::{FrameHint, Term};
use crate::reql::datum::Datum;
use crate::reql::error::{Frame, QueryError, Result};
use crate::reql::terms::TermType;
use std::collections::HashMap;

/// Fresh-variable source for rewrite-introduced bindings.
///
/// Yields -1, -2, ... : monotonically decreasing, never reused within one
/// query compilation.
#[derive(Debug, Default)]
pub struct Gensym {
    next: i64,
}

impl Gensym {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn var(&mut self) -> i64 {
        self.next -= 1;
        self.next
    }
}

/// Expand every sugared node in the tree, bottom-up.
pub fn compile(term: Term, gensym: &mut Gensym) -> Result<Term> {
    let Term {
        term_type,
        args,
        optargs,
        datum,
        frame_hint,
    } = term;

    let args = args
        .into_iter()
        .map(|arg| compile(arg, gensym))
        .collect::<Result<Vec<Term>>>()?;
    let optargs = optargs
        .into_iter()
        .map(|(name, value)| compile(value, gensym).map(|value| (name, value)))
        .collect::<Result<HashMap<String, Term>>>()?;

    let node = Term {
        term_type,
        args,
        optargs,
        datum,
        frame_hint,
    };
    if !term_type.is_sugar() {
        return Ok(node);
    }

    check_sugar_arity(&node)?;
    match term_type {
        TermType::Skip => Ok(expand_skip(node)),
        TermType::Update => Ok(expand_update(node, gensym)),
        TermType::Delete => Ok(expand_delete(node, gensym)),
        TermType::GroupBy => expand_group_by(node, gensym),
        TermType::InnerJoin => Ok(expand_inner_join(node, gensym)),
        TermType::OuterJoin => Ok(expand_outer_join(node, gensym)),
        TermType::EqJoin => Ok(expand_eq_join(node, gensym)),
        _ => Err(QueryError::internal(format!(
            "{} is not a sugared term",
            term_type
        ))),
    }
}

fn check_sugar_arity(node: &Term) -> Result<()> {
    let spec = node.term_type.arg_spec();
    let n = node.num_args();
    let in_range = n >= spec.min && spec.max.map_or(true, |max| n <= max);
    if !in_range {
        let expected = match (spec.min, spec.max) {
            (min, Some(max)) if min == max => format!("{}", min),
            (min, Some(max)) => format!("between {} and {}", min, max),
            (min, None) => format!("{} or more", min),
        };
        return Err(QueryError::arity(format!(
            "{} expected {} arguments but found {}.",
            node.term_type.name(),
            expected,
            n
        )));
    }
    Ok(())
}

/// Thread the sugared term's optargs and frame hint onto the expansion root.
fn finish(mut root: Term, optargs: HashMap<String, Term>, hint: Option<FrameHint>) -> Term {
    root.optargs.extend(optargs);
    root.frame_hint = hint;
    root
}

/// Wrap a non-function term into a constant function of the given arity, so
/// literal mappings and predicates can be FUNCALLed uniformly.
fn ensure_func(term: Term, params: usize, gensym: &mut Gensym) -> Term {
    if term.term_type == TermType::Func {
        return term;
    }
    let ids: Vec<i64> = (0..params).map(|_| gensym.var()).collect();
    Term::func(ids, term)
}

/// SKIP(seq, n) => SLICE(seq, n, -1) with a closed right bound.
fn expand_skip(node: Term) -> Term {
    let mut args = node.args.into_iter();
    let seq = args.next().expect("arity checked");
    let n = args.next().expect("arity checked");
    let root = Term::new(TermType::Slice)
        .with_arg(seq)
        .with_arg(n)
        .with_arg(Term::datum(-1i64).elided())
        .with_optarg("right_bound", Term::datum("closed").elided());
    finish(root, node.optargs, node.frame_hint)
}

/// UPDATE(sel, f) => REPLACE(sel, row -> branch(row == null, null,
/// merge(row, f(row)))).
fn expand_update(node: Term, gensym: &mut Gensym) -> Term {
    let mut args = node.args.into_iter();
    let sel = args.next().expect("arity checked");
    let mapping = ensure_func(args.next().expect("arity checked"), 1, gensym)
        .at_frame(Frame::Pos(1));

    let row = gensym.var();
    let body = Term::branch(
        Term::eq(
            Term::var(row).elided(),
            Term::datum(Datum::Null).elided(),
        )
        .elided(),
        Term::datum(Datum::Null).elided(),
        Term::merge(
            Term::var(row).elided(),
            Term::funcall(mapping, vec![Term::var(row).elided()]).elided(),
        )
        .elided(),
    )
    .elided();

    let root = Term::replace(sel, Term::func(vec![row], body).elided());
    finish(root, node.optargs, node.frame_hint)
}

/// DELETE(sel) => REPLACE(sel, row -> null).
fn expand_delete(node: Term, gensym: &mut Gensym) -> Term {
    let mut args = node.args.into_iter();
    let sel = args.next().expect("arity checked");
    let row = gensym.var();
    let root = Term::replace(
        sel,
        Term::func(vec![row], Term::datum(Datum::Null).elided()).elided(),
    );
    finish(root, node.optargs, node.frame_hint)
}

/// The `[{left, right}]` / `[]` inner branch shared by the join expansions.
fn join_pair_branch(cond: Term, left_var: i64, right_var: i64) -> Term {
    Term::branch(
        cond,
        Term::make_array(vec![Term::make_obj([
            ("left", Term::var(left_var).elided()),
            ("right", Term::var(right_var).elided()),
        ])
        .elided()])
        .elided(),
        Term::make_array(vec![]).elided(),
    )
    .elided()
}

/// INNER_JOIN(left, right, pred) => for each left row, for each right row,
/// emit `{left, right}` when the predicate holds.
fn expand_inner_join(node: Term, gensym: &mut Gensym) -> Term {
    let mut args = node.args.into_iter();
    let left = args.next().expect("arity checked");
    let right = args.next().expect("arity checked").at_frame(Frame::Pos(1));
    let pred = ensure_func(args.next().expect("arity checked"), 2, gensym)
        .at_frame(Frame::Pos(2));

    let lv = gensym.var();
    let rv = gensym.var();

    let test = Term::funcall(
        pred,
        vec![Term::var(lv).elided(), Term::var(rv).elided()],
    )
    .elided();
    let inner = Term::concat_map(
        right,
        Term::func(vec![rv], join_pair_branch(test, lv, rv)).elided(),
    )
    .elided();
    let root = Term::concat_map(left, Term::func(vec![lv], inner).elided());
    finish(root, node.optargs, node.frame_hint)
}

/// OUTER_JOIN(left, right, pred): like INNER_JOIN, but a left row with no
/// match emits `{left}` alone. The inner concat-map result is bound once and
/// tested with IS_EMPTY.
fn expand_outer_join(node: Term, gensym: &mut Gensym) -> Term {
    let mut args = node.args.into_iter();
    let left = args.next().expect("arity checked");
    let right = args.next().expect("arity checked").at_frame(Frame::Pos(1));
    let pred = ensure_func(args.next().expect("arity checked"), 2, gensym)
        .at_frame(Frame::Pos(2));

    let lv = gensym.var();
    let rv = gensym.var();
    let mv = gensym.var();

    let test = Term::funcall(
        pred,
        vec![Term::var(lv).elided(), Term::var(rv).elided()],
    )
    .elided();
    let matches = Term::coerce_to(
        Term::concat_map(
            right,
            Term::func(vec![rv], join_pair_branch(test, lv, rv)).elided(),
        )
        .elided(),
        "ARRAY",
    )
    .elided();

    let chooser = Term::func(
        vec![mv],
        Term::branch(
            Term::is_empty(Term::var(mv).elided()).elided(),
            Term::make_array(vec![Term::make_obj([(
                "left",
                Term::var(lv).elided(),
            )])
            .elided()])
            .elided(),
            Term::var(mv).elided(),
        )
        .elided(),
    )
    .elided();

    let body = Term::funcall(chooser, vec![matches]).elided();
    let root = Term::concat_map(left, Term::func(vec![lv], body).elided());
    finish(root, node.optargs, node.frame_hint)
}

/// EQ_JOIN(left, field, right) => the inner-join shape with the predicate
/// `left[field] == right["id"]`. Resolving against a storage index instead
/// of a scan is the storage layer's concern, not the rewriter's.
fn expand_eq_join(node: Term, gensym: &mut Gensym) -> Term {
    let mut args = node.args.into_iter();
    let left = args.next().expect("arity checked");
    let field = args.next().expect("arity checked").at_frame(Frame::Pos(1));
    let right = args.next().expect("arity checked").at_frame(Frame::Pos(2));

    let lv = gensym.var();
    let rv = gensym.var();

    let test = Term::eq(
        Term::new(TermType::GetField)
            .with_arg(Term::var(lv).elided())
            .with_arg(field)
            .elided(),
        Term::new(TermType::GetField)
            .with_arg(Term::var(rv).elided())
            .with_arg(Term::datum("id").elided())
            .elided(),
    )
    .elided();
    let inner = Term::concat_map(
        right,
        Term::func(vec![rv], join_pair_branch(test, lv, rv)).elided(),
    )
    .elided();
    let root = Term::concat_map(left, Term::func(vec![lv], inner).elided());
    finish(root, node.optargs, node.frame_hint)
}

/// The aggregation triple a GROUP_BY reduction object describes.
struct Reduction {
    map_fn: Term,
    reduce_fn: Term,
    final_fn: Option<Term>,
}

fn literal_strings(term: &Term) -> Option<Vec<String>> {
    match term.as_datum() {
        Some(Datum::Array(items)) => items
            .iter()
            .map(|d| d.as_string().map(str::to_string))
            .collect(),
        _ if term.term_type == TermType::MakeArray => term
            .args
            .iter()
            .map(|arg| {
                arg.as_datum()
                    .and_then(|d| d.as_string())
                    .map(str::to_string)
            })
            .collect(),
        _ => None,
    }
}

fn parse_reduction(term: &Term, gensym: &mut Gensym) -> Result<Reduction> {
    let map = term
        .as_datum()
        .and_then(|d| d.as_object())
        .ok_or_else(|| QueryError::logic("GROUP_BY reduction must be a literal object."))?;
    if map.len() != 1 {
        return Err(QueryError::logic(
            "Invalid GROUP_BY reduction; expected exactly one of COUNT, SUM, or AVG.",
        ));
    }
    let (name, value) = map.iter().next().expect("length checked");

    let field_of = |value: &Datum, agg: &str| -> Result<String> {
        value.as_string().map(str::to_string).ok_or_else(|| {
            QueryError::logic(format!("{} requires a field name.", agg))
        })
    };

    let add2 = |gensym: &mut Gensym| {
        let a = gensym.var();
        let b = gensym.var();
        Term::func(
            vec![a, b],
            Term::add(vec![Term::var(a).elided(), Term::var(b).elided()]).elided(),
        )
    };

    match name.as_str() {
        "COUNT" => {
            let v = gensym.var();
            Ok(Reduction {
                map_fn: Term::func(vec![v], Term::datum(1).elided()),
                reduce_fn: add2(gensym),
                final_fn: None,
            })
        }
        "SUM" => {
            let field = field_of(value, "SUM")?;
            let v = gensym.var();
            Ok(Reduction {
                map_fn: Term::func(
                    vec![v],
                    Term::get_field(Term::var(v).elided(), &field).elided(),
                ),
                reduce_fn: add2(gensym),
                final_fn: None,
            })
        }
        "AVG" => {
            let field = field_of(value, "AVG")?;
            // Map to [value, 1] pairs, add componentwise, divide at the end.
            let v = gensym.var();
            let map_fn = Term::func(
                vec![v],
                Term::make_array(vec![
                    Term::get_field(Term::var(v).elided(), &field).elided(),
                    Term::datum(1).elided(),
                ])
                .elided(),
            );
            let a = gensym.var();
            let b = gensym.var();
            let component = |x: i64, i: i64| Term::nth(Term::var(x).elided(), i).elided();
            let reduce_fn = Term::func(
                vec![a, b],
                Term::make_array(vec![
                    Term::add(vec![component(a, 0), component(b, 0)]).elided(),
                    Term::add(vec![component(a, 1), component(b, 1)]).elided(),
                ])
                .elided(),
            );
            let f = gensym.var();
            let pair = || {
                Term::get_field(Term::var(f).elided(), "reduction").elided()
            };
            let final_fn = Term::func(
                vec![f],
                Term::merge(
                    Term::var(f).elided(),
                    Term::make_obj([(
                        "reduction",
                        Term::div(
                            Term::nth(pair(), 0).elided(),
                            Term::nth(pair(), 1).elided(),
                        )
                        .elided(),
                    )])
                    .elided(),
                )
                .elided(),
            );
            Ok(Reduction {
                map_fn,
                reduce_fn,
                final_fn: Some(final_fn),
            })
        }
        other => Err(QueryError::logic(format!(
            "Unknown GROUP_BY reduction `{}`; expected COUNT, SUM, or AVG.",
            other
        ))),
    }
}

/// GROUP_BY(seq, attrs, reduction) => GROUPED_MAP_REDUCE with a pluck-based
/// group function and the reduction's map/reduce pair; AVG wraps the result
/// in a final dividing MAP.
fn expand_group_by(node: Term, gensym: &mut Gensym) -> Result<Term> {
    let mut args = node.args.into_iter();
    let seq = args.next().expect("arity checked").at_frame(Frame::Pos(0));
    let attrs_term = args.next().expect("arity checked");
    let reduction_term = args.next().expect("arity checked");

    let attrs = literal_strings(&attrs_term).ok_or_else(|| {
        QueryError::logic("GROUP_BY attributes must be a literal array of field names.")
    })?;
    let reduction = parse_reduction(&reduction_term, gensym)?;

    let g = gensym.var();
    let mut pluck = Term::new(TermType::Pluck).with_arg(Term::var(g).elided());
    for attr in &attrs {
        pluck = pluck.with_arg(Term::datum(attr.as_str()).elided());
    }
    let group_fn = Term::func(vec![g], pluck.elided());

    let gmr = Term::new(TermType::GroupedMapReduce)
        .with_arg(seq)
        .with_arg(group_fn.elided())
        .with_arg(reduction.map_fn.elided())
        .with_arg(reduction.reduce_fn.elided());

    let root = match reduction.final_fn {
        None => gmr,
        Some(final_fn) => Term::map(gmr.elided(), final_fn.elided()),
    };
    Ok(finish(root, node.optargs, node.frame_hint))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arr(items: Vec<i64>) -> Term {
        Term::datum(Datum::Array(items.into_iter().map(Datum::from).collect()))
    }

    #[test]
    fn test_primitives_unchanged() {
        let mut gensym = Gensym::new();
        let term = Term::nth(arr(vec![1, 2, 3]), 0);
        let compiled = compile(term.clone(), &mut gensym).unwrap();
        assert_eq!(compiled, term);
    }

    #[test]
    fn test_skip_becomes_closed_slice() {
        let mut gensym = Gensym::new();
        let compiled = compile(Term::skip(arr(vec![1, 2, 3]), 1), &mut gensym).unwrap();
        assert_eq!(compiled.term_type, TermType::Slice);
        assert_eq!(compiled.num_args(), 3);
        assert_eq!(
            compiled.arg(2).unwrap().as_datum().unwrap().as_number(),
            Some(-1.0)
        );
        let bound = compiled.optarg("right_bound").unwrap();
        assert_eq!(bound.as_datum().unwrap().as_string(), Some("closed"));
    }

    #[test]
    fn test_update_becomes_replace() {
        let mut gensym = Gensym::new();
        let mapping = Term::func(vec![1], Term::datum(Datum::object([("x", Datum::from(1))])));
        let compiled =
            compile(Term::update(Term::table("users"), mapping), &mut gensym).unwrap();
        assert_eq!(compiled.term_type, TermType::Replace);
        assert_eq!(compiled.arg(0).unwrap().term_type, TermType::Table);
        assert_eq!(compiled.arg(1).unwrap().term_type, TermType::Func);
    }

    #[test]
    fn test_delete_becomes_null_replace() {
        let mut gensym = Gensym::new();
        let compiled = compile(Term::delete(Term::table("users")), &mut gensym).unwrap();
        assert_eq!(compiled.term_type, TermType::Replace);
        let body = compiled.arg(1).unwrap().arg(1).unwrap();
        assert_eq!(body.as_datum(), Some(&Datum::Null));
    }

    #[test]
    fn test_inner_join_shape() {
        let mut gensym = Gensym::new();
        let pred = Term::func(vec![1, 2], Term::eq(Term::var(1), Term::var(2)));
        let compiled = compile(
            Term::inner_join(arr(vec![1]), arr(vec![2]), pred),
            &mut gensym,
        )
        .unwrap();
        // concat_map(left, fn -> concat_map(right, fn -> branch(...)))
        assert_eq!(compiled.term_type, TermType::ConcatMap);
        let outer_fn = compiled.arg(1).unwrap();
        assert_eq!(outer_fn.term_type, TermType::Func);
        let inner = outer_fn.arg(1).unwrap();
        assert_eq!(inner.term_type, TermType::ConcatMap);
        // The user predicate keeps its original argument position.
        assert_eq!(
            inner.arg(0).unwrap().frame_hint,
            Some(FrameHint::At(Frame::Pos(1)))
        );
    }

    #[test]
    fn test_group_by_shapes() {
        let mut gensym = Gensym::new();
        let count = Term::group_by(
            arr(vec![]),
            vec!["city"],
            Datum::object([("COUNT", Datum::Boolean(true))]),
        );
        let compiled = compile(count, &mut gensym).unwrap();
        assert_eq!(compiled.term_type, TermType::GroupedMapReduce);

        let avg = Term::group_by(
            arr(vec![]),
            vec!["city"],
            Datum::object([("AVG", Datum::from("price"))]),
        );
        let compiled = compile(avg, &mut gensym).unwrap();
        // AVG gains a final dividing MAP around the GMR.
        assert_eq!(compiled.term_type, TermType::Map);
        assert_eq!(
            compiled.arg(0).unwrap().term_type,
            TermType::GroupedMapReduce
        );
    }

    #[test]
    fn test_group_by_rejects_bad_reduction() {
        let mut gensym = Gensym::new();
        let bad = Term::group_by(
            arr(vec![]),
            vec!["city"],
            Datum::object([("MEDIAN", Datum::from("price"))]),
        );
        let err = compile(bad, &mut gensym).unwrap_err();
        assert_eq!(err.kind(), crate::reql::error::ErrorKind::Logic);
    }

    #[test]
    fn test_gensym_never_reuses_ids() {
        let mut gensym = Gensym::new();
        let make = || {
            Term::update(
                Term::table("t"),
                Term::func(vec![1], Term::datum(Datum::object([("x", Datum::from(1))]))),
            )
        };
        let first = compile(make(), &mut gensym).unwrap();
        let second = compile(make(), &mut gensym).unwrap();

        fn collect_func_params(term: &Term, out: &mut Vec<i64>) {
            if term.term_type == TermType::Func {
                if let Some(Datum::Array(ids)) = term.arg(0).and_then(Term::as_datum) {
                    out.extend(ids.iter().filter_map(|d| d.as_number()).map(|n| n as i64));
                }
            }
            for arg in &term.args {
                collect_func_params(arg, out);
            }
            for value in term.optargs.values() {
                collect_func_params(value, out);
            }
        }

        let mut first_ids = Vec::new();
        let mut second_ids = Vec::new();
        collect_func_params(&first, &mut first_ids);
        collect_func_params(&second, &mut second_ids);
        // Rewrite-introduced ids are negative and disjoint across rewrites.
        for id in first_ids.iter().filter(|id| **id < 0) {
            assert!(!second_ids.contains(id));
        }
    }

    #[test]
    fn test_sugar_arity_checked_at_compile_time() {
        let mut gensym = Gensym::new();
        let term = Term::new(TermType::Skip).with_arg(arr(vec![1]));
        let err = compile(term, &mut gensym).unwrap_err();
        assert_eq!(err.kind(), crate::reql::error::ErrorKind::Arity);
    }

    #[test]
    fn test_nested_sugar_expands_everywhere() {
        let mut gensym = Gensym::new();
        // skip nested inside a skip argument
        let inner = Term::skip(arr(vec![1, 2, 3]), 1);
        let outer = Term::skip(inner, 1);
        let compiled = compile(outer, &mut gensym).unwrap();
        assert_eq!(compiled.term_type, TermType::Slice);
        assert_eq!(compiled.arg(0).unwrap().term_type, TermType::Slice);
    }
}
