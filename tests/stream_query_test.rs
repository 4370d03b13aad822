//! Streams, selections, grouped-data fan-out, and write terms, end to end.

use reql_core::reql::{Datum, ErrorKind, Term};
use reql_core::{run_query, Env, Limits, MemTables};
use std::sync::Arc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn row(id: i64, fields: Vec<(&str, Datum)>) -> Datum {
    let mut pairs = vec![("id", Datum::from(id))];
    pairs.extend(fields);
    Datum::object(pairs)
}

fn users_env() -> Env {
    let rows = vec![
        row(1, vec![("name", Datum::from("alice")), ("age", Datum::from(31))]),
        row(2, vec![("name", Datum::from("bob")), ("age", Datum::from(25))]),
        row(3, vec![("name", Datum::from("carol")), ("age", Datum::from(31))]),
    ];
    Env::with_source(Arc::new(MemTables::new().with_table("users", rows)))
}

fn grouped_pairs(result: &Datum) -> Vec<(Datum, Datum)> {
    let obj = result.as_object().expect("grouped result is an object");
    assert_eq!(
        obj.get("$reql_type$"),
        Some(&Datum::from("GROUPED_DATA"))
    );
    obj.get("data")
        .and_then(Datum::as_array)
        .expect("grouped data array")
        .iter()
        .map(|pair| {
            let pair = pair.as_array().expect("pair");
            (pair[0].clone(), pair[1].clone())
        })
        .collect()
}

#[tokio::test]
async fn test_table_scan_materializes() {
    init_tracing();
    let result = run_query(users_env(), Term::table("users")).await.unwrap();
    assert_eq!(result.as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_nth_on_stream() {
    let env = users_env();
    let first = run_query(env.clone(), Term::nth(Term::table("users"), 0))
        .await
        .unwrap();
    assert_eq!(
        first.as_object().unwrap().get("name"),
        Some(&Datum::from("alice"))
    );

    // -1 means the last element; other negatives are unsupported on streams.
    let last = run_query(env.clone(), Term::nth(Term::table("users"), -1))
        .await
        .unwrap();
    assert_eq!(
        last.as_object().unwrap().get("name"),
        Some(&Datum::from("carol"))
    );

    let err = run_query(env.clone(), Term::nth(Term::table("users"), -2))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Logic);

    let err = run_query(env, Term::nth(Term::table("users"), 9))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NonExistence);
}

#[tokio::test]
async fn test_selection_context_propagation() {
    let env = users_env();

    // Windows over table rows are still selections.
    let sliced = Term::type_of(Term::slice(Term::table("users"), 0, 2));
    assert_eq!(
        run_query(env.clone(), sliced).await.unwrap(),
        Datum::String("SELECTION<STREAM>".into())
    );
    let limited = Term::type_of(Term::limit(Term::table("users"), 1));
    assert_eq!(
        run_query(env.clone(), limited).await.unwrap(),
        Datum::String("SELECTION<STREAM>".into())
    );
    let skipped = Term::type_of(Term::skip(Term::table("users"), 1));
    assert_eq!(
        run_query(env.clone(), skipped).await.unwrap(),
        Datum::String("SELECTION<STREAM>".into())
    );

    // A row pulled from a selection keeps its table context.
    let picked = Term::type_of(Term::nth(Term::table("users"), 0));
    assert_eq!(
        run_query(env.clone(), picked).await.unwrap(),
        Datum::String("SELECTION<OBJECT>".into())
    );

    // Offsets are plain numbers; the context is gone.
    let offsets = Term::type_of(Term::offsets_of(
        Term::table("users"),
        Term::func(vec![1], Term::datum(true)),
    ));
    assert_eq!(
        run_query(env, offsets).await.unwrap(),
        Datum::String("STREAM".into())
    );
}

#[tokio::test]
async fn test_stream_slice_rules() {
    let env = users_env();

    // Negative left index on a stream is a logic error.
    let err = run_query(env.clone(), Term::slice(Term::table("users"), -1, 2))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Logic);

    // A closed right bound of -1 means "to the end".
    let tail = Term::slice(Term::table("users"), 1, -1)
        .with_optarg("right_bound", Term::datum("closed"));
    let result = run_query(env.clone(), tail).await.unwrap();
    assert_eq!(result.as_array().unwrap().len(), 2);

    // Any other negative right bound fails.
    let err = run_query(env.clone(), Term::slice(Term::table("users"), 0, -2))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Logic);

    // An open right bound of -1 fails.
    let open = Term::slice(Term::table("users"), 0, -1)
        .with_optarg("right_bound", Term::datum("open"));
    let err = run_query(env, open).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Logic);
}

#[tokio::test]
async fn test_is_empty_on_streams() {
    let env = Env::with_source(Arc::new(
        MemTables::new()
            .with_table("full", vec![row(1, vec![])])
            .with_table("empty", vec![]),
    ));
    assert_eq!(
        run_query(env.clone(), Term::is_empty(Term::table("empty")))
            .await
            .unwrap(),
        Datum::Boolean(true)
    );
    assert_eq!(
        run_query(env, Term::is_empty(Term::table("full")))
            .await
            .unwrap(),
        Datum::Boolean(false)
    );
}

#[tokio::test]
async fn test_filter_map_count() {
    let env = users_env();

    let adults = Term::count(Term::filter(
        Term::table("users"),
        Term::func(vec![1], Term::gt(Term::get_field(Term::var(1), "age"), Term::datum(30))),
    ));
    assert_eq!(
        run_query(env.clone(), adults).await.unwrap(),
        Datum::Number(2.0)
    );

    let names = Term::map(
        Term::table("users"),
        Term::func(vec![1], Term::get_field(Term::var(1), "name")),
    );
    assert_eq!(
        run_query(env, names).await.unwrap(),
        Datum::Array(vec![
            Datum::from("alice"),
            Datum::from("bob"),
            Datum::from("carol"),
        ])
    );
}

#[tokio::test]
async fn test_grouped_fan_out_limit() {
    // The canonical fan-out example: {A: [1,2,3], B: [4,5]} with limit 1
    // yields {A: [1], B: [4]} - same keys, same order.
    let rows = vec![
        Datum::object([("k", Datum::from("A")), ("v", Datum::from(1))]),
        Datum::object([("k", Datum::from("A")), ("v", Datum::from(2))]),
        Datum::object([("k", Datum::from("A")), ("v", Datum::from(3))]),
        Datum::object([("k", Datum::from("B")), ("v", Datum::from(4))]),
        Datum::object([("k", Datum::from("B")), ("v", Datum::from(5))]),
    ];
    let seq = Term::datum(Datum::Array(rows));

    let grouped_values = Term::map(
        Term::group(seq, Term::datum("k")),
        Term::func(vec![1], Term::get_field(Term::var(1), "v")),
    );
    let limited = Term::limit(grouped_values, 1);
    let result = run_query(Env::new(), limited).await.unwrap();

    let pairs = grouped_pairs(&result);
    assert_eq!(pairs.len(), 2);
    assert_eq!(pairs[0].0, Datum::from("A"));
    assert_eq!(pairs[0].1, Datum::Array(vec![Datum::from(1)]));
    assert_eq!(pairs[1].0, Datum::from("B"));
    assert_eq!(pairs[1].1, Datum::Array(vec![Datum::from(4)]));
}

#[tokio::test]
async fn test_grouped_fan_out_count_and_nth() {
    let env = users_env();

    // count fans out per group.
    let counts = Term::count(Term::group(Term::table("users"), Term::datum("age")));
    let result = run_query(env.clone(), counts).await.unwrap();
    let pairs = grouped_pairs(&result);
    assert_eq!(pairs[0], (Datum::from(31), Datum::from(2)));
    assert_eq!(pairs[1], (Datum::from(25), Datum::from(1)));

    // nth is group-aware and indexes each group directly.
    let firsts = Term::nth(Term::group(Term::table("users"), Term::datum("age")), 0);
    let result = run_query(env, firsts).await.unwrap();
    let pairs = grouped_pairs(&result);
    assert_eq!(
        pairs[0].1.as_object().unwrap().get("name"),
        Some(&Datum::from("alice"))
    );
    assert_eq!(
        pairs[1].1.as_object().unwrap().get("name"),
        Some(&Datum::from("bob"))
    );
}

#[tokio::test]
async fn test_aggregators_on_streams() {
    let env = users_env();

    let sum = Term::new(reql_core::TermType::Sum)
        .with_arg(Term::table("users"))
        .with_arg(Term::datum("age"));
    assert_eq!(run_query(env.clone(), sum).await.unwrap(), Datum::Number(87.0));

    let avg = Term::new(reql_core::TermType::Avg)
        .with_arg(Term::table("users"))
        .with_arg(Term::datum("age"));
    assert_eq!(run_query(env.clone(), avg).await.unwrap(), Datum::Number(29.0));

    let min = Term::new(reql_core::TermType::Min).with_arg(Term::datum(Datum::Array(vec![
        Datum::from(3),
        Datum::from(1),
        Datum::from(2),
    ])));
    assert_eq!(run_query(env, min).await.unwrap(), Datum::Number(1.0));
}

#[tokio::test]
async fn test_reduce() {
    let sum = Term::reduce(
        Term::datum(Datum::Array(vec![
            Datum::from(1),
            Datum::from(2),
            Datum::from(3),
        ])),
        Term::func(vec![1, 2], Term::add(vec![Term::var(1), Term::var(2)])),
    );
    assert_eq!(run_query(Env::new(), sum).await.unwrap(), Datum::Number(6.0));

    let empty = Term::reduce(
        Term::datum(Datum::Array(vec![])),
        Term::func(vec![1, 2], Term::var(1)),
    );
    let err = run_query(Env::new(), empty).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NonExistence);
}

#[tokio::test]
async fn test_array_limit_enforced_on_materialization() {
    let env = users_env().with_limits(Limits {
        array_size_limit: 2,
    });
    let err = run_query(env, Term::coerce_to(Term::table("users"), "array"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceLimit);
}

#[tokio::test]
async fn test_update_merges_rows() {
    let env = users_env();

    let bump = Term::update(
        Term::table("users"),
        Term::func(
            vec![1],
            Term::datum(Datum::object([("age", Datum::from(40))])),
        ),
    );
    let report = run_query(env.clone(), bump).await.unwrap();
    let report = report.as_object().unwrap();
    assert_eq!(report.get("replaced"), Some(&Datum::Number(3.0)));
    assert_eq!(report.get("errors"), Some(&Datum::Number(0.0)));

    // The merge is deep: untouched fields survive.
    let alice = run_query(env, Term::get(Term::table("users"), 1))
        .await
        .unwrap();
    let alice = alice.as_object().unwrap();
    assert_eq!(alice.get("age"), Some(&Datum::Number(40.0)));
    assert_eq!(alice.get("name"), Some(&Datum::from("alice")));
}

#[tokio::test]
async fn test_update_literal_mapping_and_unchanged() {
    let env = users_env();

    // A literal (non-function) mapping is wrapped into a constant function.
    let noop = Term::update(
        Term::get(Term::table("users"), 2),
        Term::datum(Datum::object([("name", Datum::from("bob"))])),
    );
    let report = run_query(env, noop).await.unwrap();
    assert_eq!(
        report.as_object().unwrap().get("unchanged"),
        Some(&Datum::Number(1.0))
    );
}

#[tokio::test]
async fn test_update_missing_row_skipped() {
    let env = users_env();
    let term = Term::update(
        Term::get(Term::table("users"), 99),
        Term::datum(Datum::object([("age", Datum::from(1))])),
    );
    let report = run_query(env, term).await.unwrap();
    assert_eq!(
        report.as_object().unwrap().get("skipped"),
        Some(&Datum::Number(1.0))
    );
}

#[tokio::test]
async fn test_delete_selection() {
    let env = users_env();

    let one = Term::delete(Term::get(Term::table("users"), 1));
    let report = run_query(env.clone(), one).await.unwrap();
    assert_eq!(
        report.as_object().unwrap().get("deleted"),
        Some(&Datum::Number(1.0))
    );

    let remaining = run_query(env.clone(), Term::count(Term::table("users")))
        .await
        .unwrap();
    assert_eq!(remaining, Datum::Number(2.0));

    // Deleting a filtered selection removes only matching rows.
    let adults = Term::delete(Term::filter(
        Term::table("users"),
        Term::func(vec![1], Term::gt(Term::get_field(Term::var(1), "age"), Term::datum(30))),
    ));
    let report = run_query(env.clone(), adults).await.unwrap();
    assert_eq!(
        report.as_object().unwrap().get("deleted"),
        Some(&Datum::Number(1.0))
    );
    let remaining = run_query(env, Term::count(Term::table("users")))
        .await
        .unwrap();
    assert_eq!(remaining, Datum::Number(1.0));
}

#[tokio::test]
async fn test_replace_cannot_change_primary_key() {
    let env = users_env();
    let term = Term::replace(
        Term::get(Term::table("users"), 1),
        Term::func(vec![1], Term::datum(row(9, vec![]))),
    );
    let err = run_query(env, term).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Logic);
}

#[tokio::test]
async fn test_missing_table() {
    let err = run_query(users_env(), Term::count(Term::table("nope")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NonExistence);
}

#[tokio::test]
async fn test_cancellation_mid_query() {
    let env = users_env();
    env.interruptor().store(true, std::sync::atomic::Ordering::Relaxed);
    let err = run_query(env, Term::count(Term::table("users")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}
