//! End-to-end tests for the array operator family.

use reql_core::reql::{Datum, ErrorKind, Term, TermType};
use reql_core::{run_query, Env};

fn arr(items: Vec<i64>) -> Term {
    Term::datum(Datum::Array(items.into_iter().map(Datum::from).collect()))
}

fn nums(items: Vec<i64>) -> Datum {
    Datum::Array(items.into_iter().map(Datum::from).collect())
}

async fn eval(term: Term) -> Result<Datum, reql_core::QueryError> {
    run_query(Env::new(), term).await
}

#[tokio::test]
async fn test_nth_full_index_contract() {
    // Non-negative indexes address from the front.
    assert_eq!(
        eval(Term::nth(arr(vec![10, 20, 30]), 0)).await.unwrap(),
        Datum::Number(10.0)
    );
    assert_eq!(
        eval(Term::nth(arr(vec![10, 20, 30]), 2)).await.unwrap(),
        Datum::Number(30.0)
    );
    // Negative indexes wrap from the end.
    assert_eq!(
        eval(Term::nth(arr(vec![10, 20, 30]), -3)).await.unwrap(),
        Datum::Number(10.0)
    );
    // Outside [-size, size) is a non-existence error.
    for bad in [3i64, -4, 99] {
        let err = eval(Term::nth(arr(vec![10, 20, 30]), bad)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NonExistence, "index {}", bad);
    }
}

#[tokio::test]
async fn test_nth_wrong_type() {
    let err = eval(Term::nth(Term::datum(42), 0)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Type);
}

#[tokio::test]
async fn test_slice_defaults_closed_left_open_right() {
    assert_eq!(
        eval(Term::slice(arr(vec![0, 1, 2, 3, 4]), 1, 3)).await.unwrap(),
        nums(vec![1, 2])
    );
    // Right bound clamps to the array size.
    assert_eq!(
        eval(Term::slice(arr(vec![0, 1, 2]), 1, 99)).await.unwrap(),
        nums(vec![1, 2])
    );
    // Crossed bounds produce an empty array, not an error.
    assert_eq!(
        eval(Term::slice(arr(vec![0, 1, 2]), 2, 1)).await.unwrap(),
        nums(vec![])
    );
}

#[tokio::test]
async fn test_slice_bound_optargs() {
    let base = arr(vec![0, 1, 2, 3, 4]);
    let closed_right = Term::slice(base.clone(), 1, 3)
        .with_optarg("right_bound", Term::datum("closed"));
    assert_eq!(eval(closed_right).await.unwrap(), nums(vec![1, 2, 3]));

    let open_left = Term::slice(base.clone(), 1, 3)
        .with_optarg("left_bound", Term::datum("open"));
    assert_eq!(eval(open_left).await.unwrap(), nums(vec![2]));

    let bad = Term::slice(base, 1, 3).with_optarg("right_bound", Term::datum("sideways"));
    assert_eq!(eval(bad).await.unwrap_err().kind(), ErrorKind::Logic);
}

#[tokio::test]
async fn test_slice_negative_bounds() {
    // Drop the first and last element.
    assert_eq!(
        eval(Term::slice(arr(vec![0, 1, 2, 3, 4]), 1, -1)).await.unwrap(),
        nums(vec![1, 2, 3])
    );
    // -1 with a closed right bound reaches the end.
    let to_end = Term::slice(arr(vec![0, 1, 2]), 1, -1)
        .with_optarg("right_bound", Term::datum("closed"));
    assert_eq!(eval(to_end).await.unwrap(), nums(vec![1, 2]));
}

#[tokio::test]
async fn test_slice_non_integer_index() {
    let term = Term::new(TermType::Slice)
        .with_arg(arr(vec![1, 2, 3]))
        .with_arg(Term::datum(1.5))
        .with_arg(Term::datum(2));
    let err = eval(term).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Logic);
    assert!(err.message().contains("1.5"));
}

#[tokio::test]
async fn test_limit() {
    assert_eq!(
        eval(Term::limit(arr(vec![1, 2, 3]), 2)).await.unwrap(),
        nums(vec![1, 2])
    );
    assert_eq!(
        eval(Term::limit(arr(vec![1, 2]), 99)).await.unwrap(),
        nums(vec![1, 2])
    );
    let err = eval(Term::limit(arr(vec![1]), -1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Logic);
}

#[tokio::test]
async fn test_append_prepend_contract() {
    // append leaves the first `size` elements unchanged and puts the new
    // value at index `size`; prepend mirrors at index 0.
    let appended = eval(Term::append(arr(vec![1, 2, 3]), Term::datum(9)))
        .await
        .unwrap();
    assert_eq!(appended, nums(vec![1, 2, 3, 9]));

    let prepended = eval(Term::prepend(arr(vec![1, 2, 3]), Term::datum(9)))
        .await
        .unwrap();
    assert_eq!(prepended, nums(vec![9, 1, 2, 3]));
}

#[tokio::test]
async fn test_set_union_distinct() {
    let union = Term::new(TermType::SetUnion)
        .with_arg(arr(vec![3, 1, 3, 2]))
        .with_arg(arr(vec![2, 4, 4]));
    // First-occurrence order, left argument first.
    assert_eq!(eval(union).await.unwrap(), nums(vec![3, 1, 2, 4]));
}

#[tokio::test]
async fn test_set_intersection_and_difference_disjoint() {
    let a = vec![1, 2, 2, 3];
    let b = vec![2, 3, 5];
    let inter = eval(
        Term::new(TermType::SetIntersection)
            .with_arg(arr(a.clone()))
            .with_arg(arr(b.clone())),
    )
    .await
    .unwrap();
    let diff = eval(
        Term::new(TermType::SetDifference)
            .with_arg(arr(a))
            .with_arg(arr(b)),
    )
    .await
    .unwrap();
    assert_eq!(inter, nums(vec![2, 3]));
    assert_eq!(diff, nums(vec![1]));
    // No value appears in both.
    for item in inter.as_array().unwrap() {
        assert!(!diff.as_array().unwrap().contains(item));
    }
}

#[tokio::test]
async fn test_insert_delete_round_trip() {
    // delete_at(insert_at(arr, i, v), i) == arr for every valid space index,
    // including negatives: both sides resolve to the same physical offset
    // because deletion canonicalizes against the grown array.
    for i in [0i64, 1, 3, -1, -4] {
        let inserted = Term::insert_at(arr(vec![1, 2, 3]), i, Term::datum(9));
        let deleted = Term::delete_at(inserted, i);
        assert_eq!(eval(deleted).await.unwrap(), nums(vec![1, 2, 3]), "index {}", i);
    }
}

#[tokio::test]
async fn test_splice_at_range() {
    let spliced = eval(Term::splice_at(arr(vec![1, 5]), 1, arr(vec![2, 3, 4])))
        .await
        .unwrap();
    assert_eq!(spliced, nums(vec![1, 2, 3, 4, 5]));

    // Splicing a non-array is a type error.
    let err = eval(Term::splice_at(arr(vec![1]), 0, Term::datum(2)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Type);
}

#[tokio::test]
async fn test_change_at_bounds() {
    let changed = eval(Term::change_at(arr(vec![1, 2]), -1, Term::datum(9)))
        .await
        .unwrap();
    assert_eq!(changed, nums(vec![1, 9]));

    let err = eval(Term::change_at(arr(vec![1, 2]), 2, Term::datum(9)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NonExistence);
}

#[tokio::test]
async fn test_contains_matches_linear_scan() {
    for needle in 0i64..5 {
        let expected = vec![1i64, 3].contains(&needle);
        let term = Term::contains(arr(vec![1, 3]), vec![Term::datum(needle)]);
        assert_eq!(
            eval(term).await.unwrap(),
            Datum::Boolean(expected),
            "needle {}",
            needle
        );
    }
}

#[tokio::test]
async fn test_contains_duplicate_needles() {
    let one = Term::contains(arr(vec![1]), vec![Term::datum(1), Term::datum(1)]);
    assert_eq!(eval(one).await.unwrap(), Datum::Boolean(false));

    let two = Term::contains(arr(vec![1, 1]), vec![Term::datum(1), Term::datum(1)]);
    assert_eq!(eval(two).await.unwrap(), Datum::Boolean(true));
}

#[tokio::test]
async fn test_contains_mixed_needles() {
    let pred = Term::func(vec![1], Term::gt(Term::var(1), Term::datum(10)));
    let term = Term::contains(arr(vec![5, 20]), vec![Term::datum(5), pred]);
    assert_eq!(eval(term).await.unwrap(), Datum::Boolean(true));
}

#[tokio::test]
async fn test_offsets_of_value_and_predicate() {
    assert_eq!(
        eval(Term::offsets_of(arr(vec![7, 1, 7, 7]), Term::datum(7)))
            .await
            .unwrap(),
        nums(vec![0, 2, 3])
    );

    let pred = Term::func(vec![1], Term::lt(Term::var(1), Term::datum(5)));
    assert_eq!(
        eval(Term::offsets_of(arr(vec![9, 1, 9, 2]), pred))
            .await
            .unwrap(),
        nums(vec![1, 3])
    );
}

#[tokio::test]
async fn test_strings_and_binary_slice() {
    assert_eq!(
        eval(Term::slice(Term::datum("abcdef"), 1, 4)).await.unwrap(),
        Datum::String("bcd".into())
    );
    // Codepoints, not bytes.
    assert_eq!(
        eval(Term::slice(Term::datum("aéiöu"), 1, 4)).await.unwrap(),
        Datum::String("éiö".into())
    );
    assert_eq!(
        eval(Term::slice(Term::datum(Datum::Binary(vec![9, 8, 7, 6])), 0, 2))
            .await
            .unwrap(),
        Datum::Binary(vec![9, 8])
    );
    // Slicing a number is a type error.
    let err = eval(Term::slice(Term::datum(1), 0, 1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Type);
}
