//! Document filters and their split into columnar pushdown predicates plus
//! a residual row-level filter.
//!
//! Filters use the MongoDB operator surface. The pushdown layer hoists the
//! conditions that columnar file statistics can answer (`$eq`, `$gt`,
//! `$gte`, `$lt`, `$lte`, `$in`, `$ne`, implicit equality) and leaves
//! everything else (logical operators other than `$and`, regexes, nested
//! paths, text/vector search) to be evaluated row by row after the scan.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod eval;
mod prune;
mod pushdown;

pub use eval::matches_filter;
pub use prune::may_match;
pub use pushdown::{
    analyze_filter_for_pushdown, can_fully_pushdown, extract_non_pushable_filter,
    filter_to_predicates, has_pushable_conditions, predicates_to_query_filter, PushdownAnalysis,
};

use data_types::{Document, Value};
use serde::{Deserialize, Serialize};

/// A document filter. Operator objects use `$`-prefixed keys; any other
/// value is an implicit equality condition.
pub type Filter = Document;

/// Comparison operator of a pushdown predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredicateOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Greater than.
    Gt,
    /// Greater or equal.
    Gte,
    /// Less than.
    Lt,
    /// Less or equal.
    Lte,
    /// Member of a value set.
    In,
}

impl PredicateOp {
    /// The `$`-prefixed filter key of this operator.
    pub fn filter_key(&self) -> &'static str {
        match self {
            Self::Eq => "$eq",
            Self::Ne => "$ne",
            Self::Gt => "$gt",
            Self::Gte => "$gte",
            Self::Lt => "$lt",
            Self::Lte => "$lte",
            Self::In => "$in",
        }
    }
}

/// A single column-level condition evaluable against file statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnPredicate {
    /// Flat column name.
    pub column: String,
    /// Comparison operator.
    pub op: PredicateOp,
    /// Comparison value; an array for [`PredicateOp::In`].
    pub value: Value,
}

impl ColumnPredicate {
    /// Build a predicate.
    pub fn new(column: impl Into<String>, op: PredicateOp, value: Value) -> Self {
        Self {
            column: column.into(),
            op,
            value,
        }
    }
}
