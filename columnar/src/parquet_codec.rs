use crate::{ColumnStats, ColumnarCodec, EncodedFile, Error, FileStats, Result};
use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use data_types::{
    sort_for_replay, ColumnType, Document, Event, EventId, EventOp, NamespaceSchema, Value,
};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Key under which [`FileStats`] ride in the Parquet key-value metadata.
const STATS_KEY: &str = "parquedb.stats";

/// Column holding the full JSON document of an entity row.
const BODY_COLUMN: &str = "__body";

/// The Parquet implementation of [`ColumnarCodec`].
///
/// Entity rows materialize their declared typed columns (feeding min/max
/// statistics) next to a JSON column carrying the complete document, so
/// decoding is lossless regardless of schema drift. Event batches use the
/// fixed `(id, ts, op, target, actor, before, after)` schema.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParquetCodec {}

impl ParquetCodec {
    /// Create a codec.
    pub fn new() -> Self {
        Self::default()
    }

    fn write_file(batch: RecordBatch, stats: &FileStats) -> Result<Bytes> {
        let stats_json = serde_json::to_string(stats).map_err(|e| Error::Encode {
            source: Box::new(e),
        })?;
        let props = WriterProperties::builder()
            .set_key_value_metadata(Some(vec![KeyValue::new(
                STATS_KEY.to_string(),
                stats_json,
            )]))
            .build();

        let mut buf = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), Some(props))
            .map_err(|e| Error::Encode {
                source: Box::new(e),
            })?;
        writer.write(&batch).map_err(|e| Error::Encode {
            source: Box::new(e),
        })?;
        writer.close().map_err(|e| Error::Encode {
            source: Box::new(e),
        })?;
        Ok(Bytes::from(buf))
    }

    fn read_batches(bytes: &Bytes) -> Result<(Vec<RecordBatch>, FileStats)> {
        let builder =
            ParquetRecordBatchReaderBuilder::try_new(bytes.clone()).map_err(|e| Error::Decode {
                source: Box::new(e),
            })?;
        let stats = stats_from_metadata(
            builder
                .metadata()
                .file_metadata()
                .key_value_metadata(),
        )?;
        let reader = builder.build().map_err(|e| Error::Decode {
            source: Box::new(e),
        })?;
        let mut batches = vec![];
        for batch in reader {
            batches.push(batch.map_err(|e| Error::Decode {
                source: Box::new(e),
            })?);
        }
        Ok((batches, stats))
    }
}

fn stats_from_metadata(kv: Option<&Vec<KeyValue>>) -> Result<FileStats> {
    let raw = kv
        .and_then(|kvs| kvs.iter().find(|kv| kv.key == STATS_KEY))
        .and_then(|kv| kv.value.as_deref())
        .ok_or(Error::MissingStats)?;
    serde_json::from_str(raw).map_err(|e| Error::Decode {
        source: Box::new(e),
    })
}

fn arrow_type(column_type: ColumnType) -> DataType {
    match column_type {
        ColumnType::Bool => DataType::Boolean,
        ColumnType::Int | ColumnType::Date => DataType::Int64,
        ColumnType::Float => DataType::Float64,
        ColumnType::String => DataType::Utf8,
    }
}

/// Project a document field into the native form of its declared column;
/// anything of the wrong type lands as null (and counts as null in stats).
fn project(value: Option<&Value>, column_type: ColumnType) -> Option<Value> {
    let value = value?;
    match (column_type, value) {
        (ColumnType::Bool, Value::Bool(_))
        | (ColumnType::Int, Value::Int(_))
        | (ColumnType::String, Value::String(_))
        | (ColumnType::Date, Value::Date(_)) => Some(value.clone()),
        (ColumnType::Float, Value::Float(_)) => Some(value.clone()),
        (ColumnType::Float, Value::Int(i)) => Some(Value::Float(*i as f64)),
        _ => None,
    }
}

fn typed_array(
    rows: &[Document],
    name: &str,
    column_type: ColumnType,
    stats: &mut ColumnStats,
) -> ArrayRef {
    let projected: Vec<Option<Value>> = rows
        .iter()
        .map(|row| project(row.get(name), column_type))
        .collect();
    for v in &projected {
        stats.observe(v.as_ref());
    }

    match column_type {
        ColumnType::Bool => {
            let values: Vec<Option<bool>> = projected
                .iter()
                .map(|v| match v {
                    Some(Value::Bool(b)) => Some(*b),
                    _ => None,
                })
                .collect();
            Arc::new(BooleanArray::from(values))
        }
        ColumnType::Int | ColumnType::Date => {
            let values: Vec<Option<i64>> = projected
                .iter()
                .map(|v| match v {
                    Some(Value::Int(i)) => Some(*i),
                    Some(Value::Date(ms)) => Some(*ms),
                    _ => None,
                })
                .collect();
            Arc::new(Int64Array::from(values))
        }
        ColumnType::Float => {
            let values: Vec<Option<f64>> = projected
                .iter()
                .map(|v| match v {
                    Some(Value::Float(f)) => Some(*f),
                    _ => None,
                })
                .collect();
            Arc::new(Float64Array::from(values))
        }
        ColumnType::String => {
            let values: Vec<Option<String>> = projected
                .iter()
                .map(|v| match v {
                    Some(Value::String(s)) => Some(s.clone()),
                    _ => None,
                })
                .collect();
            Arc::new(StringArray::from(values))
        }
    }
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| Error::Decode {
            source: format!("missing string column {name:?}").into(),
        })
}

fn int_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Int64Array> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
        .ok_or_else(|| Error::Decode {
            source: format!("missing int column {name:?}").into(),
        })
}

fn opt_str(array: &StringArray, i: usize) -> Option<String> {
    if array.is_null(i) {
        None
    } else {
        Some(array.value(i).to_string())
    }
}

impl ColumnarCodec for ParquetCodec {
    fn encode_rows(&self, schema: &NamespaceSchema, rows: &[Document]) -> Result<EncodedFile> {
        let mut fields = vec![];
        let mut columns: Vec<ArrayRef> = vec![];
        let mut stats = FileStats {
            num_rows: rows.len() as u64,
            ..Default::default()
        };

        for (name, column_type) in &schema.typed_columns {
            let mut column_stats = ColumnStats::default();
            let array = typed_array(rows, name, *column_type, &mut column_stats);
            fields.push(Field::new(name.as_str(), arrow_type(*column_type), true));
            columns.push(array);
            stats.columns.insert(name.clone(), column_stats);
        }

        let bodies: Vec<Option<String>> = rows
            .iter()
            .map(|row| {
                serde_json::to_string(&Value::Object(row.clone()))
                    .map(Some)
                    .map_err(|e| Error::Encode {
                        source: Box::new(e),
                    })
            })
            .collect::<Result<_>>()?;
        fields.push(Field::new(BODY_COLUMN, DataType::Utf8, false));
        columns.push(Arc::new(StringArray::from(bodies)));

        let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).map_err(|e| {
            Error::Encode {
                source: Box::new(e),
            }
        })?;
        let bytes = Self::write_file(batch, &stats)?;
        Ok(EncodedFile { bytes, stats })
    }

    fn decode_rows(&self, bytes: &Bytes) -> Result<Vec<Document>> {
        let (batches, _) = Self::read_batches(bytes)?;
        let mut rows = vec![];
        for batch in &batches {
            let bodies = string_column(batch, BODY_COLUMN)?;
            for i in 0..batch.num_rows() {
                let raw = bodies.value(i);
                let value: serde_json::Value =
                    serde_json::from_str(raw).map_err(|e| Error::Decode {
                        source: Box::new(e),
                    })?;
                match Value::from_json(value) {
                    Value::Object(doc) => rows.push(doc),
                    other => {
                        return Err(Error::MalformedRow {
                            index: rows.len(),
                            reason: format!("body is not an object: {other:?}"),
                        })
                    }
                }
            }
        }
        Ok(rows)
    }

    fn encode_events(&self, events: &[Event]) -> Result<EncodedFile> {
        let mut events = events.to_vec();
        sort_for_replay(&mut events);

        let mut stats = FileStats {
            num_rows: events.len() as u64,
            min_ts: events.iter().map(|e| e.ts).min(),
            max_ts: events.iter().map(|e| e.ts).max(),
            ..Default::default()
        };
        let mut op_stats = ColumnStats::default();

        let to_json = |doc: &Option<Document>| -> Result<Option<String>> {
            doc.as_ref()
                .map(|d| {
                    serde_json::to_string(&Value::Object(d.clone())).map_err(|e| Error::Encode {
                        source: Box::new(e),
                    })
                })
                .transpose()
        };

        let ids: Vec<Option<String>> = events
            .iter()
            .map(|e| Some(e.id.as_str().to_string()))
            .collect();
        let ts: Vec<Option<i64>> = events.iter().map(|e| Some(e.ts)).collect();
        let ops: Vec<Option<String>> = events
            .iter()
            .map(|e| {
                op_stats.observe(Some(&Value::String(e.op.as_str().to_string())));
                Some(e.op.as_str().to_string())
            })
            .collect();
        let targets: Vec<Option<String>> =
            events.iter().map(|e| Some(e.target.clone())).collect();
        let actors: Vec<Option<String>> = events.iter().map(|e| e.actor.clone()).collect();
        let befores: Vec<Option<String>> = events
            .iter()
            .map(|e| to_json(&e.before))
            .collect::<Result<_>>()?;
        let afters: Vec<Option<String>> = events
            .iter()
            .map(|e| to_json(&e.after))
            .collect::<Result<_>>()?;

        stats.columns.insert("op".to_string(), op_stats);

        let schema = Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("ts", DataType::Int64, false),
            Field::new("op", DataType::Utf8, false),
            Field::new("target", DataType::Utf8, false),
            Field::new("actor", DataType::Utf8, true),
            Field::new("before", DataType::Utf8, true),
            Field::new("after", DataType::Utf8, true),
        ]);
        let batch = RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(StringArray::from(ids)),
                Arc::new(Int64Array::from(ts)),
                Arc::new(StringArray::from(ops)),
                Arc::new(StringArray::from(targets)),
                Arc::new(StringArray::from(actors)),
                Arc::new(StringArray::from(befores)),
                Arc::new(StringArray::from(afters)),
            ],
        )
        .map_err(|e| Error::Encode {
            source: Box::new(e),
        })?;

        let bytes = Self::write_file(batch, &stats)?;
        Ok(EncodedFile { bytes, stats })
    }

    fn decode_events(&self, bytes: &Bytes) -> Result<Vec<Event>> {
        let (batches, _) = Self::read_batches(bytes)?;
        let mut events = vec![];

        let parse_doc = |raw: Option<String>, index: usize| -> Result<Option<Document>> {
            match raw {
                None => Ok(None),
                Some(raw) => {
                    let value: serde_json::Value =
                        serde_json::from_str(&raw).map_err(|e| Error::Decode {
                            source: Box::new(e),
                        })?;
                    match Value::from_json(value) {
                        Value::Object(doc) => Ok(Some(doc)),
                        other => Err(Error::MalformedRow {
                            index,
                            reason: format!("event document is not an object: {other:?}"),
                        }),
                    }
                }
            }
        };

        for batch in &batches {
            let ids = string_column(batch, "id")?;
            let ts = int_column(batch, "ts")?;
            let ops = string_column(batch, "op")?;
            let targets = string_column(batch, "target")?;
            let actors = string_column(batch, "actor")?;
            let befores = string_column(batch, "before")?;
            let afters = string_column(batch, "after")?;

            for i in 0..batch.num_rows() {
                let index = events.len();
                let op = EventOp::parse(ops.value(i)).ok_or_else(|| Error::MalformedRow {
                    index,
                    reason: format!("unknown op {:?}", ops.value(i)),
                })?;
                events.push(Event {
                    id: EventId::from_string(ids.value(i)),
                    ts: ts.value(i),
                    op,
                    target: targets.value(i).to_string(),
                    actor: opt_str(actors, i),
                    before: parse_doc(opt_str(befores, i), index)?,
                    after: parse_doc(opt_str(afters, i), index)?,
                });
            }
        }
        sort_for_replay(&mut events);
        Ok(events)
    }

    fn read_stats(&self, bytes: &Bytes) -> Result<FileStats> {
        let builder =
            ParquetRecordBatchReaderBuilder::try_new(bytes.clone()).map_err(|e| Error::Decode {
                source: Box::new(e),
            })?;
        stats_from_metadata(builder.metadata().file_metadata().key_value_metadata())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::{doc, EntityId};

    fn schema_with_columns() -> NamespaceSchema {
        let mut schema = NamespaceSchema::default();
        schema.typed_columns.insert("age".into(), ColumnType::Int);
        schema
            .typed_columns
            .insert("name".into(), ColumnType::String);
        schema
    }

    #[test]
    fn rows_round_trip_losslessly() {
        let codec = ParquetCodec::new();
        let rows = vec![
            doc! {"age" => 30i64, "name" => "Jane", "nested" => "kept"},
            doc! {"age" => 41i64, "name" => "Jo"},
        ];

        let encoded = codec.encode_rows(&schema_with_columns(), &rows).unwrap();
        assert_eq!(encoded.stats.num_rows, 2);

        let decoded = codec.decode_rows(&encoded.bytes).unwrap();
        assert_eq!(decoded, rows);
    }

    #[test]
    fn typed_column_stats_feed_pruning() {
        let codec = ParquetCodec::new();
        let rows = vec![
            doc! {"age" => 18i64},
            doc! {"age" => 64i64},
            doc! {"name" => "no age"},
        ];

        let encoded = codec.encode_rows(&schema_with_columns(), &rows).unwrap();
        let age = encoded.stats.column("age").unwrap();
        assert_eq!(age.min, Some(Value::Int(18)));
        assert_eq!(age.max, Some(Value::Int(64)));
        assert_eq!(age.null_count, 1);

        // stats survive a read of the raw file
        let read_back = codec.read_stats(&encoded.bytes).unwrap();
        assert_eq!(read_back, encoded.stats);
    }

    #[test]
    fn event_batches_sort_and_round_trip() {
        let codec = ParquetCodec::new();
        let target = EntityId::new("posts", "p1").unwrap();

        let mut e1 = Event::new(EventOp::Create, &target, 2_000);
        e1.after = Some(doc! {"title" => "V2"});
        let mut e2 = Event::new(EventOp::Create, &target, 1_000);
        e2.after = Some(doc! {"title" => "V1"});

        let encoded = codec.encode_events(&[e1.clone(), e2.clone()]).unwrap();
        assert_eq!(encoded.stats.min_ts, Some(1_000));
        assert_eq!(encoded.stats.max_ts, Some(2_000));

        let decoded = codec.decode_events(&encoded.bytes).unwrap();
        assert_eq!(decoded.len(), 2);
        // read back in (ts, id) order regardless of input order
        assert_eq!(decoded[0], e2);
        assert_eq!(decoded[1], e1);
    }

    #[test]
    fn empty_batch_is_fine() {
        let codec = ParquetCodec::new();
        let encoded = codec.encode_events(&[]).unwrap();
        assert_eq!(encoded.stats.num_rows, 0);
        assert_eq!(codec.decode_events(&encoded.bytes).unwrap(), vec![]);
    }

    #[test]
    fn dates_survive_the_body_column() {
        let codec = ParquetCodec::new();
        let rows = vec![doc! {"title" => "a"}]
            .into_iter()
            .map(|mut d| {
                d.insert("publishedAt".to_string(), Value::Date(1_700_000_000_000));
                d
            })
            .collect::<Vec<_>>();

        let encoded = codec
            .encode_rows(&NamespaceSchema::default(), &rows)
            .unwrap();
        let decoded = codec.decode_rows(&encoded.bytes).unwrap();
        assert_eq!(
            decoded[0].get("publishedAt"),
            Some(&Value::Date(1_700_000_000_000))
        );
    }
}
