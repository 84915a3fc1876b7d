use crate::{ColumnPredicate, PredicateOp};
use columnar::FileStats;
use data_types::Value;
use std::cmp::Ordering;

/// Decide whether a file could contain rows matching all `predicates`,
/// judging only by its column statistics.
///
/// Conservative by construction: a column without statistics (untyped at
/// encode time, or all-null ranges) never prunes the file. `false` means
/// the scan may skip the file outright.
pub fn may_match(stats: &FileStats, predicates: &[ColumnPredicate]) -> bool {
    predicates.iter().all(|p| predicate_may_match(stats, p))
}

fn predicate_may_match(stats: &FileStats, predicate: &ColumnPredicate) -> bool {
    let Some(column) = stats.column(&predicate.column) else {
        return true;
    };
    let (Some(min), Some(max)) = (&column.min, &column.max) else {
        // all-null column: only pure null conditions could match, and those
        // never push down
        return false;
    };

    match predicate.op {
        PredicateOp::Eq => {
            in_range(&predicate.value, min, max)
        }
        PredicateOp::In => match &predicate.value {
            Value::Array(items) => items.iter().any(|v| in_range(v, min, max)),
            _ => true,
        },
        // only an all-equal column can rule out inequality
        PredicateOp::Ne => {
            !(min.cmp_total(max) == Ordering::Equal
                && min.cmp_total(&predicate.value) == Ordering::Equal)
        }
        PredicateOp::Gt => max.cmp_total(&predicate.value) == Ordering::Greater,
        PredicateOp::Gte => max.cmp_total(&predicate.value) != Ordering::Less,
        PredicateOp::Lt => min.cmp_total(&predicate.value) == Ordering::Less,
        PredicateOp::Lte => min.cmp_total(&predicate.value) != Ordering::Greater,
    }
}

fn in_range(value: &Value, min: &Value, max: &Value) -> bool {
    min.cmp_total(value) != Ordering::Greater && max.cmp_total(value) != Ordering::Less
}

#[cfg(test)]
mod tests {
    use super::*;
    use columnar::ColumnStats;

    fn stats(min: i64, max: i64) -> FileStats {
        let mut s = FileStats {
            num_rows: 10,
            ..Default::default()
        };
        let mut col = ColumnStats::default();
        col.observe(Some(&Value::Int(min)));
        col.observe(Some(&Value::Int(max)));
        s.columns.insert("age".to_string(), col);
        s
    }

    fn pred(op: PredicateOp, v: i64) -> ColumnPredicate {
        ColumnPredicate::new("age", op, Value::Int(v))
    }

    #[test]
    fn equality_prunes_outside_range() {
        let s = stats(10, 20);
        assert!(may_match(&s, &[pred(PredicateOp::Eq, 15)]));
        assert!(may_match(&s, &[pred(PredicateOp::Eq, 10)]));
        assert!(!may_match(&s, &[pred(PredicateOp::Eq, 9)]));
        assert!(!may_match(&s, &[pred(PredicateOp::Eq, 21)]));
    }

    #[test]
    fn range_operators() {
        let s = stats(10, 20);
        assert!(may_match(&s, &[pred(PredicateOp::Gt, 19)]));
        assert!(!may_match(&s, &[pred(PredicateOp::Gt, 20)]));
        assert!(may_match(&s, &[pred(PredicateOp::Gte, 20)]));
        assert!(!may_match(&s, &[pred(PredicateOp::Gte, 21)]));
        assert!(may_match(&s, &[pred(PredicateOp::Lt, 11)]));
        assert!(!may_match(&s, &[pred(PredicateOp::Lt, 10)]));
        assert!(may_match(&s, &[pred(PredicateOp::Lte, 10)]));
        assert!(!may_match(&s, &[pred(PredicateOp::Lte, 9)]));
    }

    #[test]
    fn in_set_checks_each_member() {
        let s = stats(10, 20);
        let p = ColumnPredicate::new(
            "age",
            PredicateOp::In,
            Value::Array(vec![Value::Int(1), Value::Int(15)]),
        );
        assert!(may_match(&s, &[p]));
        let p = ColumnPredicate::new(
            "age",
            PredicateOp::In,
            Value::Array(vec![Value::Int(1), Value::Int(2)]),
        );
        assert!(!may_match(&s, &[p]));
    }

    #[test]
    fn ne_prunes_only_constant_columns() {
        let s = stats(10, 20);
        assert!(may_match(&s, &[pred(PredicateOp::Ne, 15)]));
        let constant = stats(7, 7);
        assert!(!may_match(&constant, &[pred(PredicateOp::Ne, 7)]));
        assert!(may_match(&constant, &[pred(PredicateOp::Ne, 8)]));
    }

    #[test]
    fn unknown_columns_never_prune() {
        let s = stats(10, 20);
        let p = ColumnPredicate::new("other", PredicateOp::Eq, Value::Int(999));
        assert!(may_match(&s, &[p]));
    }

    #[test]
    fn conjunction_prunes_if_any_predicate_does() {
        let s = stats(10, 20);
        assert!(!may_match(
            &s,
            &[pred(PredicateOp::Gte, 15), pred(PredicateOp::Eq, 100)]
        ));
    }
}
