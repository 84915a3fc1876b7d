use crate::{ColumnPredicate, Filter, PredicateOp};
use data_types::{ColumnType, Value};
use std::collections::{BTreeMap, BTreeSet};

fn op_from_key(key: &str) -> Option<PredicateOp> {
    match key {
        "$eq" => Some(PredicateOp::Eq),
        "$ne" => Some(PredicateOp::Ne),
        "$gt" => Some(PredicateOp::Gt),
        "$gte" => Some(PredicateOp::Gte),
        "$lt" => Some(PredicateOp::Lt),
        "$lte" => Some(PredicateOp::Lte),
        "$in" => Some(PredicateOp::In),
        _ => None,
    }
}

/// A scalar a file-statistics comparison can use. Arrays, objects and
/// nulls are out; `null` explicitly never pushes down.
fn is_pushable_scalar(value: &Value) -> bool {
    matches!(
        value,
        Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::String(_) | Value::Date(_)
    )
}

fn column_eligible(column: &str, typed_columns: Option<&BTreeMap<String, ColumnType>>) -> bool {
    // dot-notation means a nested path; statistics only exist for flat,
    // typed columns
    if column.contains('.') || column.starts_with('$') {
        return false;
    }
    match typed_columns {
        Some(typed) => typed.contains_key(column),
        None => true,
    }
}

/// The split of one filter into pushdown predicates and the residual.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushdownAnalysis {
    /// Conditions evaluable against file statistics.
    pub pushdown_predicates: Vec<ColumnPredicate>,
    /// Columns named by the pushdown predicates.
    pub pushdown_columns: BTreeSet<String>,
    /// Everything the scan still has to evaluate per row.
    pub remaining_filter: Filter,
    /// Whether at least one condition pushed down.
    pub can_pushdown: bool,
}

/// Split `filter` against `typed_columns`.
pub fn analyze_filter_for_pushdown(
    filter: &Filter,
    typed_columns: &BTreeMap<String, ColumnType>,
) -> PushdownAnalysis {
    let (predicates, remaining) = split(filter, Some(typed_columns));
    let pushdown_columns = predicates.iter().map(|p| p.column.clone()).collect();
    PushdownAnalysis {
        can_pushdown: !predicates.is_empty(),
        pushdown_predicates: predicates,
        pushdown_columns,
        remaining_filter: remaining,
    }
}

/// Extract the pushdown predicates of `filter`.
///
/// Without `typed_columns` every flat column is considered eligible.
pub fn filter_to_predicates(
    filter: &Filter,
    typed_columns: Option<&BTreeMap<String, ColumnType>>,
) -> Vec<ColumnPredicate> {
    split(filter, typed_columns).0
}

/// The residual filter after removing everything pushable.
pub fn extract_non_pushable_filter(
    filter: &Filter,
    typed_columns: Option<&BTreeMap<String, ColumnType>>,
) -> Filter {
    split(filter, typed_columns).1
}

/// True when nothing remains after pushdown.
pub fn can_fully_pushdown(
    filter: &Filter,
    typed_columns: Option<&BTreeMap<String, ColumnType>>,
) -> bool {
    split(filter, typed_columns).1.is_empty()
}

/// True when at least one condition pushes down.
pub fn has_pushable_conditions(
    filter: &Filter,
    typed_columns: Option<&BTreeMap<String, ColumnType>>,
) -> bool {
    !split(filter, typed_columns).0.is_empty()
}

/// Rebuild the filter equivalent of a predicate list.
///
/// A lone equality renders as the implicit scalar form; everything else
/// renders as an operator object. Types (including dates) survive because
/// the values are carried as [`Value`]s.
pub fn predicates_to_query_filter(predicates: &[ColumnPredicate]) -> Filter {
    let mut by_column: BTreeMap<String, Vec<&ColumnPredicate>> = BTreeMap::new();
    for p in predicates {
        by_column.entry(p.column.clone()).or_default().push(p);
    }

    let mut filter = Filter::new();
    for (column, preds) in by_column {
        if preds.len() == 1 && preds[0].op == PredicateOp::Eq {
            filter.insert(column, preds[0].value.clone());
        } else {
            let mut ops = data_types::Document::new();
            for p in preds {
                ops.insert(p.op.filter_key().to_string(), p.value.clone());
            }
            filter.insert(column, Value::Object(ops));
        }
    }
    filter
}

fn split(
    filter: &Filter,
    typed_columns: Option<&BTreeMap<String, ColumnType>>,
) -> (Vec<ColumnPredicate>, Filter) {
    let mut predicates = vec![];
    let mut remaining = Filter::new();

    for (key, condition) in filter {
        if key == "$and" {
            // recurse; hoist pushable parts out of the conjunction
            if let Value::Array(branches) = condition {
                let mut kept_branches = vec![];
                for branch in branches {
                    match branch {
                        Value::Object(inner) => {
                            let (inner_preds, inner_rest) = split(inner, typed_columns);
                            predicates.extend(inner_preds);
                            if !inner_rest.is_empty() {
                                kept_branches.push(Value::Object(inner_rest));
                            }
                        }
                        other => kept_branches.push(other.clone()),
                    }
                }
                if !kept_branches.is_empty() {
                    remaining.insert(key.clone(), Value::Array(kept_branches));
                }
            } else {
                remaining.insert(key.clone(), condition.clone());
            }
            continue;
        }

        if key.starts_with('$') {
            // $or / $nor / $text / ...: never pushed
            remaining.insert(key.clone(), condition.clone());
            continue;
        }

        if !column_eligible(key, typed_columns) {
            remaining.insert(key.clone(), condition.clone());
            continue;
        }

        match condition {
            // implicit equality on a scalar
            value if is_pushable_scalar(value) => {
                predicates.push(ColumnPredicate::new(key, PredicateOp::Eq, value.clone()));
            }
            Value::Object(ops) if ops.keys().all(|k| k.starts_with('$')) => {
                let mut kept_ops = data_types::Document::new();
                for (op_key, op_value) in ops {
                    let pushed = match op_from_key(op_key) {
                        Some(PredicateOp::In) => match op_value {
                            Value::Array(items)
                                if !items.is_empty()
                                    && items.iter().all(is_pushable_scalar) =>
                            {
                                predicates.push(ColumnPredicate::new(
                                    key,
                                    PredicateOp::In,
                                    op_value.clone(),
                                ));
                                true
                            }
                            _ => false,
                        },
                        Some(op) if is_pushable_scalar(op_value) => {
                            predicates.push(ColumnPredicate::new(key, op, op_value.clone()));
                            true
                        }
                        _ => false,
                    };
                    if !pushed {
                        // $regex/$nin/$exists/... and null operands stay behind
                        kept_ops.insert(op_key.clone(), op_value.clone());
                    }
                }
                if !kept_ops.is_empty() {
                    remaining.insert(key.clone(), Value::Object(kept_ops));
                }
            }
            // null, arrays, non-operator objects: stay behind
            other => {
                remaining.insert(key.clone(), other.clone());
            }
        }
    }

    (predicates, remaining)
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::doc;

    fn typed() -> BTreeMap<String, ColumnType> {
        let mut m = BTreeMap::new();
        m.insert("age".to_string(), ColumnType::Int);
        m.insert("name".to_string(), ColumnType::String);
        m.insert("publishedAt".to_string(), ColumnType::Date);
        m
    }

    #[test]
    fn range_plus_regex_splits() {
        // {age: {$gte: 18, $lt: 65}, name: {$regex: "^J"}}
        let mut filter = Filter::new();
        filter.insert(
            "age".to_string(),
            Value::Object(doc! {"$gte" => 18i64, "$lt" => 65i64}),
        );
        filter.insert(
            "name".to_string(),
            Value::Object(doc! {"$regex" => "^J"}),
        );

        let analysis = analyze_filter_for_pushdown(&filter, &typed());
        assert!(analysis.can_pushdown);
        assert_eq!(
            analysis.pushdown_predicates,
            vec![
                ColumnPredicate::new("age", PredicateOp::Gte, Value::Int(18)),
                ColumnPredicate::new("age", PredicateOp::Lt, Value::Int(65)),
            ]
        );
        assert_eq!(
            analysis.pushdown_columns,
            BTreeSet::from(["age".to_string()])
        );

        let mut expected_rest = Filter::new();
        expected_rest.insert(
            "name".to_string(),
            Value::Object(doc! {"$regex" => "^J"}),
        );
        assert_eq!(analysis.remaining_filter, expected_rest);
    }

    #[test]
    fn implicit_equality_pushes() {
        let filter = doc! {"age" => 30i64};
        let preds = filter_to_predicates(&filter, Some(&typed()));
        assert_eq!(
            preds,
            vec![ColumnPredicate::new("age", PredicateOp::Eq, Value::Int(30))]
        );
        assert!(can_fully_pushdown(&filter, Some(&typed())));
    }

    #[test]
    fn null_never_pushes() {
        let mut filter = Filter::new();
        filter.insert("age".to_string(), Value::Null);
        assert!(filter_to_predicates(&filter, Some(&typed())).is_empty());
        assert!(!has_pushable_conditions(&filter, Some(&typed())));

        let mut filter = Filter::new();
        filter.insert("age".to_string(), Value::Object(doc! {"$eq" => Value::Null}));
        assert!(filter_to_predicates(&filter, Some(&typed())).is_empty());
    }

    #[test]
    fn untyped_and_nested_columns_stay() {
        let filter = doc! {"other" => 1i64, "a.b" => 2i64};
        let (preds, rest) = split(&filter, Some(&typed()));
        assert!(preds.is_empty());
        assert_eq!(rest, filter);
    }

    #[test]
    fn and_hoists_and_reduces() {
        // {$and: [{age: {$gte: 18}}, {name: {$regex: "^J"}}]}
        let mut filter = Filter::new();
        filter.insert(
            "$and".to_string(),
            Value::Array(vec![
                Value::Object({
                    let mut m = Filter::new();
                    m.insert("age".into(), Value::Object(doc! {"$gte" => 18i64}));
                    m
                }),
                Value::Object({
                    let mut m = Filter::new();
                    m.insert("name".into(), Value::Object(doc! {"$regex" => "^J"}));
                    m
                }),
            ]),
        );

        let analysis = analyze_filter_for_pushdown(&filter, &typed());
        assert_eq!(analysis.pushdown_predicates.len(), 1);
        // the $and survives, reduced to the regex branch
        let rest = analysis.remaining_filter.get("$and").unwrap();
        match rest {
            Value::Array(branches) => assert_eq!(branches.len(), 1),
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[test]
    fn fully_pushable_and_is_dropped() {
        let mut filter = Filter::new();
        filter.insert(
            "$and".to_string(),
            Value::Array(vec![Value::Object(doc! {"age" => 1i64})]),
        );
        let analysis = analyze_filter_for_pushdown(&filter, &typed());
        assert_eq!(analysis.pushdown_predicates.len(), 1);
        assert!(analysis.remaining_filter.is_empty());
    }

    #[test]
    fn or_never_pushes() {
        let mut filter = Filter::new();
        filter.insert(
            "$or".to_string(),
            Value::Array(vec![Value::Object(doc! {"age" => 1i64})]),
        );
        let (preds, rest) = split(&filter, Some(&typed()));
        assert!(preds.is_empty());
        assert_eq!(rest, filter);
    }

    #[test]
    fn roundtrip_reconstructs_pushable_subset() {
        let mut filter = Filter::new();
        filter.insert("age".to_string(), Value::Object(doc! {"$gte" => 18i64, "$lt" => 65i64}));
        filter.insert("name".to_string(), Value::String("Jane".into()));
        filter.insert(
            "publishedAt".to_string(),
            Value::Date(1_700_000_000_000),
        );
        filter.insert("bio".to_string(), Value::Object(doc! {"$regex" => "x"}));

        let preds = filter_to_predicates(&filter, Some(&typed()));
        let rebuilt = predicates_to_query_filter(&preds);

        // the rebuilt filter is exactly the pushable subset, types intact
        let mut expected = Filter::new();
        expected.insert("age".to_string(), Value::Object(doc! {"$gte" => 18i64, "$lt" => 65i64}));
        expected.insert("name".to_string(), Value::String("Jane".into()));
        expected.insert("publishedAt".to_string(), Value::Date(1_700_000_000_000));
        assert_eq!(rebuilt, expected);

        // and the non-pushable rest plus the rebuilt subset cover the original
        let rest = extract_non_pushable_filter(&filter, Some(&typed()));
        assert_eq!(rest.len(), 1);
        assert!(rest.contains_key("bio"));
    }

    #[test]
    fn in_pushes_only_clean_scalar_sets() {
        let mut filter = Filter::new();
        filter.insert(
            "age".to_string(),
            Value::Object(doc! {"$in" => Value::Array(vec![Value::Int(1), Value::Int(2)])}),
        );
        assert_eq!(filter_to_predicates(&filter, Some(&typed())).len(), 1);

        let mut filter = Filter::new();
        filter.insert(
            "age".to_string(),
            Value::Object(doc! {"$in" => Value::Array(vec![Value::Int(1), Value::Null])}),
        );
        assert!(filter_to_predicates(&filter, Some(&typed())).is_empty());
    }

    #[test]
    fn nin_never_pushes() {
        let mut filter = Filter::new();
        filter.insert(
            "age".to_string(),
            Value::Object(doc! {"$nin" => Value::Array(vec![Value::Int(1)])}),
        );
        let (preds, rest) = split(&filter, Some(&typed()));
        assert!(preds.is_empty());
        assert_eq!(rest, filter);
    }
}
