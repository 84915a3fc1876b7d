use crate::Filter;
use data_types::{get_path, Document, Value};
use std::cmp::Ordering;
use tracing::warn;

/// Evaluate a filter against one document, row by row.
///
/// This is the residual side of pushdown: it understands the full operator
/// surface, including logical operators, nested dot-paths, regexes and
/// array operators. `$text` and `$vector` are index-served upstream and
/// evaluate as match-all here.
pub fn matches_filter(doc: &Document, filter: &Filter) -> bool {
    filter.iter().all(|(key, condition)| match key.as_str() {
        "$and" => match condition {
            Value::Array(branches) => branches.iter().all(|b| branch_matches(doc, b)),
            _ => false,
        },
        "$or" => match condition {
            Value::Array(branches) => branches.iter().any(|b| branch_matches(doc, b)),
            _ => false,
        },
        "$nor" => match condition {
            Value::Array(branches) => !branches.iter().any(|b| branch_matches(doc, b)),
            _ => false,
        },
        // index-served operators; the store resolves them before the scan
        "$text" | "$vector" | "$geo" => true,
        _ => field_matches(get_path(doc, key), condition),
    })
}

fn branch_matches(doc: &Document, branch: &Value) -> bool {
    match branch {
        Value::Object(filter) => matches_filter(doc, filter),
        _ => false,
    }
}

fn is_operator_object(condition: &Value) -> bool {
    matches!(condition, Value::Object(map) if !map.is_empty() && map.keys().all(|k| k.starts_with('$')))
}

fn field_matches(value: Option<&Value>, condition: &Value) -> bool {
    if let Value::Object(ops) = condition {
        if is_operator_object(condition) {
            return ops.iter().all(|(op, operand)| apply_operator(value, op, operand));
        }
    }

    // implicit equality
    equality(value, condition)
}

/// Equality with array-contains semantics: a field holding an array
/// matches a scalar if any element equals it.
fn equality(value: Option<&Value>, expected: &Value) -> bool {
    match (value, expected) {
        (None, Value::Null) => true,
        (None, _) => false,
        (Some(actual), expected) => {
            if actual == expected {
                return true;
            }
            match (actual, expected) {
                (Value::Array(items), e) if !matches!(e, Value::Array(_)) => {
                    items.iter().any(|item| item == e)
                }
                // numeric cross-representation equality
                _ => numeric_cmp(actual, expected) == Some(Ordering::Equal),
            }
        }
    }
}

/// Ordering comparison, only across comparable types: numbers with
/// numbers, strings with strings, dates with dates, bools with bools.
fn comparable_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Date(x), Value::Date(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => numeric_cmp(a, b),
    }
}

fn numeric_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => Some(x.total_cmp(&y)),
        _ => None,
    }
}

fn ordered(value: Option<&Value>, operand: &Value, pred: impl Fn(Ordering) -> bool) -> bool {
    match value {
        Some(v) => comparable_cmp(v, operand).map(pred).unwrap_or(false),
        None => false,
    }
}

fn regex_match(value: Option<&Value>, operand: &Value) -> bool {
    let (Some(Value::String(s)), Value::String(pattern)) = (value, operand) else {
        return false;
    };
    match regex::Regex::new(pattern) {
        Ok(re) => re.is_match(s),
        Err(e) => {
            warn!(pattern, error = %e, "invalid $regex pattern never matches");
            false
        }
    }
}

fn apply_operator(value: Option<&Value>, op: &str, operand: &Value) -> bool {
    match op {
        "$eq" => equality(value, operand),
        "$ne" => !equality(value, operand),
        "$gt" => ordered(value, operand, |o| o == Ordering::Greater),
        "$gte" => ordered(value, operand, |o| o != Ordering::Less),
        "$lt" => ordered(value, operand, |o| o == Ordering::Less),
        "$lte" => ordered(value, operand, |o| o != Ordering::Greater),
        "$in" => match operand {
            Value::Array(items) => items.iter().any(|item| equality(value, item)),
            _ => false,
        },
        "$nin" => match operand {
            Value::Array(items) => !items.iter().any(|item| equality(value, item)),
            _ => false,
        },
        "$exists" => {
            let wants = matches!(operand, Value::Bool(true));
            value.is_some() == wants
        }
        "$regex" => regex_match(value, operand),
        "$startsWith" => match (value, operand) {
            (Some(Value::String(s)), Value::String(prefix)) => s.starts_with(prefix.as_str()),
            _ => false,
        },
        "$all" => match (value, operand) {
            (Some(Value::Array(items)), Value::Array(wanted)) => {
                wanted.iter().all(|w| items.iter().any(|i| i == w))
            }
            _ => false,
        },
        "$elemMatch" => match (value, operand) {
            (Some(Value::Array(items)), Value::Object(sub)) => items.iter().any(|item| {
                match item {
                    // object elements match the sub-filter as a document
                    Value::Object(element) => matches_filter(element, sub),
                    // scalar elements match operator-object sub-filters
                    scalar => field_matches(Some(scalar), operand),
                }
            }),
            _ => false,
        },
        "$not" => !field_matches(value, operand),
        unknown => {
            warn!(op = unknown, "unknown filter operator evaluates to false");
            false
        }
    }
}
