//! Streaming views: windowed aggregates folded over the event stream,
//! with watermark-driven late-event handling, plus the materialized-view
//! engine that keeps their outputs in collections and Parquet datasets.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod engine;
mod view;

pub use engine::{MaterializedViewEngine, MvDatasetWriter};
pub use view::{BatchOutput, StreamingView, WindowOutput};

use data_types::EventOp;
use predicate::Filter;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Streaming errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("object store failure: {}", source))]
    Store { source: object_store::Error },

    #[snafu(display("codec failure: {}", source))]
    Codec { source: columnar::Error },

    #[snafu(display("sink failure: {}", source))]
    Sink { source: entity_store::Error },

    #[snafu(display("view {:?} is already registered", name))]
    DuplicateView { name: String },
}

/// Result alias for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Windowing of a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Window {
    /// One window over everything.
    Global,
    /// Fixed, non-overlapping windows of `size_ms`.
    Tumbling {
        /// Window width.
        size_ms: i64,
    },
    /// Overlapping windows of `size_ms` sliding by `slide_ms`.
    Sliding {
        /// Window width.
        size_ms: i64,
        /// Distance between window starts.
        slide_ms: i64,
    },
    /// Per-group sessions closed after `gap_ms` of silence.
    Session {
        /// Inactivity gap that closes a session.
        gap_ms: i64,
    },
}

/// What to do with an event behind the watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LateEventPolicy {
    /// Ignore it.
    #[default]
    Drop,
    /// Fold it in anyway and re-emit the affected window.
    Update,
    /// Divert it to the side-output collection.
    SideOutput,
}

/// Watermark behavior.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkConfig {
    /// How far behind the max seen timestamp events may arrive before
    /// they count as late.
    #[serde(default)]
    pub max_lateness_ms: i64,
    /// Late-event handling.
    #[serde(default)]
    pub late_event_policy: LateEventPolicy,
    /// Where side-output events land (with the `side_output` policy).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side_output_collection: Option<String>,
}

/// Where a view reads from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewSource {
    /// Namespace whose events feed the view.
    pub collection: String,
    /// Optional filter over the event's `after` document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
    /// Which operations count; defaults to all three.
    #[serde(default = "default_event_types")]
    pub event_types: Vec<EventOp>,
    /// Where to start consuming.
    #[serde(default)]
    pub start_position: StartPosition,
}

fn default_event_types() -> Vec<EventOp> {
    vec![EventOp::Create, EventOp::Update, EventOp::Delete]
}

/// Stream start position of a freshly registered view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartPosition {
    /// Only events after registration.
    #[default]
    Latest,
    /// The whole retained stream.
    Earliest,
}

/// Built-in aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregate {
    /// Row count.
    Count,
    /// Numeric sum of `field`.
    Sum,
    /// Numeric average of `field`.
    Avg,
    /// Minimum of `field`.
    Min,
    /// Maximum of `field`.
    Max,
}

/// The transform a view applies per window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transform {
    /// Aggregate function.
    pub aggregate: Aggregate,
    /// Field the aggregate reads (unused for `count`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Optional grouping field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<String>,
}

/// Output sink mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkMode {
    /// One record per `(window, group)`, overwritten as values refresh.
    #[default]
    Upsert,
    /// A new record per emission.
    Append,
}

/// Where view outputs land.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Target collection.
    pub collection: String,
    /// Write mode.
    #[serde(default)]
    pub mode: SinkMode,
}

/// A complete view definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewDefinition {
    /// View name; also the default sink collection.
    pub name: String,
    /// Input side.
    pub source: ViewSource,
    /// Windowing; defaults to [`Window::Global`].
    pub window: Window,
    /// Aggregation.
    pub transform: Transform,
    /// Output sink; defaults to an upsert collection named after the
    /// view.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<SinkConfig>,
    /// Watermark behavior; defaults to dropping late events.
    #[serde(default)]
    pub watermark: WatermarkConfig,
}

impl ViewDefinition {
    /// A counting view over `collection` with all defaults applied.
    pub fn counting(name: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: ViewSource {
                collection: collection.into(),
                filter: None,
                event_types: default_event_types(),
                start_position: StartPosition::default(),
            },
            window: Window::Global,
            transform: Transform {
                aggregate: Aggregate::Count,
                field: None,
                group_by: None,
            },
            output: None,
            watermark: WatermarkConfig::default(),
        }
    }

    /// The effective sink (defaults applied).
    pub fn sink(&self) -> SinkConfig {
        self.output.clone().unwrap_or(SinkConfig {
            collection: self.name.clone(),
            mode: SinkMode::Upsert,
        })
    }
}
