use data_types::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Min/max/null statistics of one column across a file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    /// Smallest non-null value, if any non-null value exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<Value>,
    /// Largest non-null value, if any non-null value exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<Value>,
    /// Number of null (or absent) entries.
    #[serde(default)]
    pub null_count: u64,
}

impl ColumnStats {
    /// Fold one observed value into the stats.
    pub fn observe(&mut self, value: Option<&Value>) {
        match value {
            None | Some(Value::Null) => self.null_count += 1,
            Some(v) => {
                let replace_min = self
                    .min
                    .as_ref()
                    .map(|m| v.cmp_total(m).is_lt())
                    .unwrap_or(true);
                if replace_min {
                    self.min = Some(v.clone());
                }
                let replace_max = self
                    .max
                    .as_ref()
                    .map(|m| v.cmp_total(m).is_gt())
                    .unwrap_or(true);
                if replace_max {
                    self.max = Some(v.clone());
                }
            }
        }
    }
}

/// Per-file statistics: row count, per-column min/max, and the event
/// timestamp range for event batches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileStats {
    /// Rows in the file.
    pub num_rows: u64,
    /// Stats per typed column.
    #[serde(default)]
    pub columns: BTreeMap<String, ColumnStats>,
    /// Smallest event timestamp (event batches only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_ts: Option<i64>,
    /// Largest event timestamp (event batches only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ts: Option<i64>,
}

impl FileStats {
    /// Stats of `column`, if it was typed at encode time.
    pub fn column(&self, column: &str) -> Option<&ColumnStats> {
        self.columns.get(column)
    }

    /// Whether `[min_ts, max_ts]` overlaps the query range.
    ///
    /// Files without a timestamp range are not event batches and never
    /// match a ranged scan.
    pub fn overlaps_ts(&self, min_ts: Option<i64>, max_ts: Option<i64>) -> bool {
        match (self.min_ts, self.max_ts) {
            (Some(file_min), Some(file_max)) => {
                min_ts.map(|m| file_max >= m).unwrap_or(true)
                    && max_ts.map(|m| file_min <= m).unwrap_or(true)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_tracks_min_max_and_nulls() {
        let mut stats = ColumnStats::default();
        stats.observe(Some(&Value::Int(5)));
        stats.observe(Some(&Value::Int(2)));
        stats.observe(None);
        stats.observe(Some(&Value::Null));
        stats.observe(Some(&Value::Int(9)));

        assert_eq!(stats.min, Some(Value::Int(2)));
        assert_eq!(stats.max, Some(Value::Int(9)));
        assert_eq!(stats.null_count, 2);
    }

    #[test]
    fn ts_overlap() {
        let stats = FileStats {
            num_rows: 10,
            min_ts: Some(1_000),
            max_ts: Some(2_000),
            ..Default::default()
        };
        assert!(stats.overlaps_ts(None, None));
        assert!(stats.overlaps_ts(Some(1_500), None));
        assert!(stats.overlaps_ts(None, Some(1_000)));
        assert!(!stats.overlaps_ts(Some(2_001), None));
        assert!(!stats.overlaps_ts(None, Some(999)));

        // entity files carry no ts range and never match ranged scans
        assert!(!FileStats::default().overlaps_ts(None, None));
    }

    #[test]
    fn stats_serde_round_trip_preserves_dates() {
        let mut stats = FileStats {
            num_rows: 3,
            ..Default::default()
        };
        let mut col = ColumnStats::default();
        col.observe(Some(&Value::Date(1_658_000_000_000)));
        stats.columns.insert("publishedAt".to_string(), col);

        let json = serde_json::to_string(&stats).unwrap();
        let back: FileStats = serde_json::from_str(&json).unwrap();
        assert_eq!(back, stats);
        assert_eq!(
            back.column("publishedAt").unwrap().min,
            Some(Value::Date(1_658_000_000_000))
        );
    }
}
