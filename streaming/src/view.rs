use crate::{
    Aggregate, LateEventPolicy, StartPosition, ViewDefinition, Window,
};
use data_types::{Document, Event, Value};
use predicate::matches_filter;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// Running aggregate of one `(window, group)` cell.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct AggState {
    count: u64,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
}

impl AggState {
    fn fold(&mut self, value: Option<f64>) {
        self.count += 1;
        if let Some(v) = value {
            self.sum += v;
            self.min = Some(self.min.map_or(v, |m| m.min(v)));
            self.max = Some(self.max.map_or(v, |m| m.max(v)));
        }
    }

    fn value(&self, aggregate: Aggregate) -> f64 {
        match aggregate {
            Aggregate::Count => self.count as f64,
            Aggregate::Sum => self.sum,
            Aggregate::Avg => {
                if self.count == 0 {
                    0.0
                } else {
                    self.sum / self.count as f64
                }
            }
            Aggregate::Min => self.min.unwrap_or(0.0),
            Aggregate::Max => self.max.unwrap_or(0.0),
        }
    }
}

/// One refreshed `(window, group)` value.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowOutput {
    /// Window start (ms); 0 for the global window.
    pub window_start: i64,
    /// Window end (ms, exclusive); `i64::MAX` for the global window.
    pub window_end: i64,
    /// Group key, empty string when ungrouped.
    pub group: String,
    /// Aggregate value.
    pub value: f64,
}

impl WindowOutput {
    /// The output rendered as a sink document.
    pub fn to_document(&self, view_name: &str) -> Document {
        let mut doc = Document::new();
        doc.insert("view".to_string(), Value::String(view_name.to_string()));
        doc.insert("windowStart".to_string(), Value::Date(self.window_start));
        doc.insert("windowEnd".to_string(), Value::Date(self.window_end));
        if !self.group.is_empty() {
            doc.insert("group".to_string(), Value::String(self.group.clone()));
        }
        doc.insert("value".to_string(), Value::Float(self.value));
        doc
    }

    /// Stable sink record id for upsert mode.
    pub fn sink_id(&self) -> String {
        format!("w{}-{}", self.window_start, sanitize(&self.group))
    }
}

fn sanitize(group: &str) -> String {
    let cleaned: String = group
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "all".to_string()
    } else {
        cleaned
    }
}

/// Everything one batch of events produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutput {
    /// Refreshed `(window, group)` values, ready for the sink.
    pub updates: Vec<WindowOutput>,
    /// Events diverted by the `side_output` policy.
    pub side_output: Vec<Event>,
    /// Events dropped by the `drop` policy.
    pub dropped_late: usize,
}

/// A single view folding the event stream into windowed aggregates.
#[derive(Debug)]
pub struct StreamingView {
    definition: ViewDefinition,
    // (window_start, group) -> running aggregate
    cells: BTreeMap<(i64, String), AggState>,
    // open sessions per group: (session start, last event ts)
    sessions: BTreeMap<String, (i64, i64)>,
    watermark: i64,
    registered_at: i64,
    seen: HashSet<String>,
}

impl StreamingView {
    /// Instantiate a view; `registered_at` anchors the `latest` start
    /// position.
    pub fn new(definition: ViewDefinition, registered_at: i64) -> Self {
        Self {
            definition,
            cells: BTreeMap::new(),
            sessions: BTreeMap::new(),
            watermark: i64::MIN,
            registered_at,
            seen: HashSet::new(),
        }
    }

    /// The definition this view runs.
    pub fn definition(&self) -> &ViewDefinition {
        &self.definition
    }

    /// Current watermark (max event timestamp seen).
    pub fn watermark(&self) -> i64 {
        self.watermark
    }

    fn accepts(&self, event: &Event) -> bool {
        let source = &self.definition.source;
        let Ok(target) = event.target_entity() else {
            return false;
        };
        if target.namespace() != source.collection {
            return false;
        }
        if !source.event_types.contains(&event.op) {
            return false;
        }
        if source.start_position == StartPosition::Latest && event.ts < self.registered_at {
            return false;
        }
        if let Some(filter) = &source.filter {
            let subject = event.after.as_ref().or(event.before.as_ref());
            match subject {
                Some(doc) => {
                    if !matches_filter(doc, filter) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }

    fn group_of(&self, event: &Event) -> String {
        let Some(group_by) = &self.definition.transform.group_by else {
            return String::new();
        };
        event
            .after
            .as_ref()
            .or(event.before.as_ref())
            .and_then(|doc| doc.get(group_by))
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_json().to_string(),
            })
            .unwrap_or_default()
    }

    fn field_of(&self, event: &Event) -> Option<f64> {
        let field = self.definition.transform.field.as_ref()?;
        event
            .after
            .as_ref()
            .or(event.before.as_ref())
            .and_then(|doc| doc.get(field))
            .and_then(Value::as_f64)
    }

    /// Window starts an event at `ts` belongs to.
    fn windows_of(&mut self, ts: i64, group: &str) -> Vec<(i64, i64)> {
        match self.definition.window {
            Window::Global => vec![(0, i64::MAX)],
            Window::Tumbling { size_ms } => {
                let start = ts - ts.rem_euclid(size_ms);
                vec![(start, start + size_ms)]
            }
            Window::Sliding { size_ms, slide_ms } => {
                // every window [s, s+size) with s on the slide grid that
                // contains ts
                let first = (ts - size_ms + slide_ms).max(0);
                let mut start = first - first.rem_euclid(slide_ms);
                if start + size_ms <= ts {
                    start += slide_ms;
                }
                let mut windows = vec![];
                while start <= ts {
                    windows.push((start, start + size_ms));
                    start += slide_ms;
                }
                windows
            }
            Window::Session { gap_ms } => {
                let (start, last) = self
                    .sessions
                    .get(group)
                    .copied()
                    .unwrap_or((ts, ts));
                if ts - last > gap_ms {
                    // silence closed the session; a new one starts here
                    self.sessions.insert(group.to_string(), (ts, ts));
                    vec![(ts, ts + gap_ms)]
                } else {
                    let start = start.min(ts);
                    self.sessions
                        .insert(group.to_string(), (start, last.max(ts)));
                    vec![(start, last.max(ts) + gap_ms)]
                }
            }
        }
    }

    /// Fold one deduplicated, time-ordered batch.
    pub fn apply_batch(&mut self, events: &[Event]) -> BatchOutput {
        let mut output = BatchOutput::default();
        let mut touched: Vec<(i64, i64, String)> = vec![];

        for event in events {
            if !self.seen.insert(event.id.as_str().to_string()) {
                continue;
            }
            if !self.accepts(event) {
                continue;
            }

            let lateness_bound = self
                .watermark
                .saturating_sub(self.definition.watermark.max_lateness_ms);
            let is_late = self.watermark != i64::MIN && event.ts < lateness_bound;
            if is_late {
                match self.definition.watermark.late_event_policy {
                    LateEventPolicy::Drop => {
                        output.dropped_late += 1;
                        debug!(view = self.definition.name.as_str(), id = event.id.as_str(), "late event dropped");
                        continue;
                    }
                    LateEventPolicy::SideOutput => {
                        output.side_output.push(event.clone());
                        continue;
                    }
                    LateEventPolicy::Update => {}
                }
            }
            self.watermark = self.watermark.max(event.ts);

            let group = self.group_of(event);
            let value = self.field_of(event);
            for (start, end) in self.windows_of(event.ts, &group) {
                self.cells
                    .entry((start, group.clone()))
                    .or_default()
                    .fold(value);
                touched.push((start, end, group.clone()));
            }
        }

        touched.sort();
        touched.dedup();
        output.updates = touched
            .into_iter()
            .map(|(start, end, group)| WindowOutput {
                window_start: start,
                window_end: end,
                group: group.clone(),
                value: self
                    .cells
                    .get(&(start, group))
                    .map(|c| c.value(self.definition.transform.aggregate))
                    .unwrap_or(0.0),
            })
            .collect();
        output
    }

    /// Every current `(window, group)` value.
    pub fn results(&self) -> Vec<WindowOutput> {
        self.cells
            .iter()
            .map(|((start, group), state)| WindowOutput {
                window_start: *start,
                window_end: match self.definition.window {
                    Window::Global => i64::MAX,
                    Window::Tumbling { size_ms } => start + size_ms,
                    Window::Sliding { size_ms, .. } => start + size_ms,
                    Window::Session { gap_ms } => {
                        self.sessions
                            .get(group)
                            .map(|(_, last)| last + gap_ms)
                            .unwrap_or(start + gap_ms)
                    }
                },
                group: group.clone(),
                value: state.value(self.definition.transform.aggregate),
            })
            .collect()
    }
}
