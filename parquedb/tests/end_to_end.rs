//! Whole-system scenarios driven through the [`Database`] handle.

use std::collections::HashMap;
use std::sync::Arc;

use assert_matches::assert_matches;
use data_types::{doc, ColumnType, Document, EntityId, NamespaceSchema, RelationshipDef, Value};
use db_time::{MockProvider, Time, TimeProvider};
use entity_store::{DeleteOptions, FindOptions, UpdateDoc, UpdateOptions};
use index::{DocLocation, FtsConfig, FtsIndex, HashIndex, IndexKey};
use object_store::{InMemory, ObjectStore, Path};
use parquedb::{Database, DatabaseConfig};
use predicate::analyze_filter_for_pushdown;

struct Fixture {
    db: Database,
    time_provider: Arc<MockProvider>,
}

async fn fixture() -> Fixture {
    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let time_provider = Arc::new(MockProvider::new(Time::from_timestamp_millis(100)));
    let db = Database::init(
        store,
        "e2e",
        Arc::clone(&time_provider) as Arc<dyn TimeProvider>,
        DatabaseConfig::default(),
    )
    .await
    .unwrap();
    Fixture { db, time_provider }
}

fn at(f: &Fixture, ms: i64) {
    f.time_provider.set(Time::from_timestamp_millis(ms));
}

/// Scenario A: event-sourced time travel.
#[tokio::test]
async fn time_travel_reads_historic_state() {
    let f = fixture().await;
    let posts = f.db.collection("posts");

    at(&f, 1_000);
    posts
        .create(Some("p1".into()), doc! {"title" => "V1"})
        .await
        .unwrap();
    at(&f, 2_000);
    posts
        .update("p1", &UpdateDoc::new().set("title", "V2"), &UpdateOptions::default())
        .await
        .unwrap();
    at(&f, 3_000);
    posts
        .update("p1", &UpdateDoc::new().set("title", "V3"), &UpdateOptions::default())
        .await
        .unwrap();

    let v2 = posts.get_at("p1", 2_500).await.unwrap().unwrap();
    assert_eq!(v2.body.get("title"), Some(&Value::String("V2".into())));

    let v3 = posts.get_at("p1", 10_000).await.unwrap().unwrap();
    assert_eq!(v3.body.get("title"), Some(&Value::String("V3".into())));

    assert!(posts.get_at("p1", 500).await.unwrap().is_none());
}

/// Scenario B: snapshot-accelerated replay equals the naive fold.
#[tokio::test]
async fn snapshot_acceleration_matches_full_replay() {
    let f = fixture().await;
    let posts = f.db.collection("posts");
    let id = EntityId::new("posts", "p1").unwrap();

    at(&f, 1_000);
    posts
        .create(Some("p1".into()), doc! {"title" => "V1"})
        .await
        .unwrap();
    for i in 2..=50i64 {
        at(&f, i * 1_000);
        posts
            .update(
                "p1",
                &UpdateDoc::new().set("title", format!("V{i}")),
                &UpdateOptions::default(),
            )
            .await
            .unwrap();
    }

    // snapshot at event 25
    let history = f.db.events().get_history(&id).await.unwrap();
    assert_eq!(history.len(), 50);
    f.db
        .snapshots()
        .create("posts", "p1", &history, 25, 99_000)
        .await
        .unwrap();

    // query at event 30's timestamp
    let (entity, stats) = f.db.get_at_with_stats(&id, 30_000).await.unwrap();
    assert_eq!(stats.snapshot_used_at, Some(25));
    assert_eq!(stats.events_replayed, 5);

    let entity = entity.unwrap();
    assert_eq!(entity.body.get("title"), Some(&Value::String("V30".into())));

    // identical to the un-accelerated read through the collection API
    let naive = posts.get_at("p1", 30_000).await.unwrap().unwrap();
    assert_eq!(naive.body, entity.body);
}

/// Scenario C: transaction rollback with relationship-index repair.
#[tokio::test]
async fn transaction_rollback_repairs_relationships() {
    let f = fixture().await;

    let mut posts_schema = NamespaceSchema::default();
    posts_schema.relationships.insert(
        "author".to_string(),
        RelationshipDef::Forward {
            target_ns: "users".to_string(),
            inverse: "posts".to_string(),
            many: false,
        },
    );
    f.db.collection("posts").set_schema(posts_schema).await.unwrap();

    f.db.collection("users")
        .create(Some("u1".into()), doc! {"name" => "jane"})
        .await
        .unwrap();
    let u1 = EntityId::new("users", "u1").unwrap();
    assert!(f.db.get_related(&u1, "posts").await.unwrap().is_empty());

    let mut txn = f.db.transaction();
    txn.create(
        "posts",
        Some("p1".into()),
        doc! {"title" => "draft", "author" => "users/u1"},
        None,
    )
    .await
    .unwrap();

    // mid-transaction: the staged post is related
    assert_eq!(f.db.get_related(&u1, "posts").await.unwrap().len(), 1);

    txn.rollback().await.unwrap();

    assert!(f.db.collection("posts").get("p1").await.unwrap().is_none());
    assert!(f.db.get_related(&u1, "posts").await.unwrap().is_empty());
}

/// Scenario D: unique constraint fails the build atomically.
#[tokio::test]
async fn unique_index_build_fails_with_no_partial_state() {
    let mut index = HashIndex::new("idx_email", true, false);
    let err = index
        .build_from_array(vec![
            (
                IndexKey::single(Value::from("a")),
                DocLocation::new("users/u1", 0, 0),
            ),
            (
                IndexKey::single(Value::from("b")),
                DocLocation::new("users/u2", 0, 0),
            ),
            (
                IndexKey::single(Value::from("a")),
                DocLocation::new("users/u3", 0, 0),
            ),
        ])
        .unwrap_err();
    assert_matches!(
        err,
        index::Error::UniqueConstraint { ref index_name, ref value }
            if index_name == "idx_email" && value.contains('a')
    );
    // no partial entries survive the failed build
    assert!(index.lookup(&IndexKey::single(Value::from("a"))).is_empty());
    assert!(index.lookup(&IndexKey::single(Value::from("b"))).is_empty());

    // the same rule guards live collections
    let f = fixture().await;
    let users = f.db.collection("users");
    for (id, email) in [("u1", "a"), ("u2", "b"), ("u3", "a")] {
        users
            .create(Some(id.into()), doc! {"email" => email})
            .await
            .unwrap();
    }
    let err = users
        .create_unique_index("idx_email", "email", false)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unique constraint"));
}

/// Scenario E: pushdown analysis splits range from regex.
#[tokio::test]
async fn pushdown_analysis_and_pruned_find() {
    let mut typed = std::collections::BTreeMap::new();
    typed.insert("age".to_string(), ColumnType::Int);
    typed.insert("name".to_string(), ColumnType::String);

    let mut filter = Document::new();
    filter.insert(
        "age".to_string(),
        Value::Object(doc! {"$gte" => 18i64, "$lt" => 65i64}),
    );
    filter.insert("name".to_string(), Value::Object(doc! {"$regex" => "^J"}));

    let analysis = analyze_filter_for_pushdown(&filter, &typed);
    assert!(analysis.can_pushdown);
    assert_eq!(analysis.pushdown_predicates.len(), 2);
    assert!(analysis
        .pushdown_predicates
        .iter()
        .all(|p| p.column == "age"));
    assert_eq!(analysis.remaining_filter.len(), 1);
    assert!(analysis.remaining_filter.contains_key("name"));

    // the same filter against stored data, across a flushed segment
    let f = fixture().await;
    let users = f.db.collection("users");
    let mut schema = NamespaceSchema::default();
    schema.typed_columns = typed;
    users.set_schema(schema).await.unwrap();
    for (id, name, age) in [("u1", "Jane", 30i64), ("u2", "Jo", 70), ("u3", "Max", 40)] {
        users
            .create(Some(id.into()), doc! {"name" => name, "age" => age})
            .await
            .unwrap();
    }
    f.db.flush().await.unwrap();

    let found = users.find(&filter, &FindOptions::default()).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id.local_id(), "u1");
}

/// Scenario F: phrase search never matches across field boundaries.
#[tokio::test]
async fn fts_phrase_respects_field_boundaries() {
    let mut fts = FtsIndex::new("idx_fts", FtsConfig::default());
    fts.index_document(
        "posts/p1",
        &[("title", "Database management"), ("content", "systems overview")],
    );
    fts.index_document("posts/p2", &[("title", "Database systems guide")]);

    let hits = fts.search_phrase("database systems");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].doc_id, "posts/p2");

    // plain term search still finds both
    assert_eq!(fts.search("database systems", 10).len(), 2);

    // highlighting wraps the matched variants
    let mut docs = HashMap::new();
    docs.insert(
        "posts/p2".to_string(),
        "Database systems guide".to_string(),
    );
    let highlighted = fts.add_highlights(
        &hits,
        &docs,
        "database systems",
        &index::HighlightOptions::default(),
    );
    assert!(highlighted[0].snippet.contains("<mark>Database</mark>"));
    assert!(highlighted[0].snippet.contains("<mark>systems</mark>"));
}

/// Scenario G: compaction retry state machine.
#[tokio::test]
async fn compaction_retry_state_machine() {
    let f = fixture().await;
    let posts = f.db.collection("posts");

    // two flushes → two small segments
    posts.create(Some("p1".into()), doc! {"k" => 1i64}).await.unwrap();
    f.db.flush().await.unwrap();
    at(&f, 5_000);
    posts.create(Some("p2".into()), doc! {"k" => 2i64}).await.unwrap();
    f.db.flush().await.unwrap();

    let summary = f.db.compaction().trigger(Some("posts")).await.unwrap();
    assert_eq!(summary.jobs_created, 1);
    let job_id = f.db.compaction().status().await.unwrap().recent[0].id.clone();

    // retrying a pending job fails
    let err = f.db.compaction().retry(&job_id).await.unwrap_err();
    assert!(err.to_string().contains("not in failed state"));

    // retrying a nonexistent job fails
    let err = f.db.compaction().retry("compact-missing").await.unwrap_err();
    assert!(err.to_string().contains("Job not found"));

    // make the job fail, then retry flips it back to pending
    for entry in f
        .db
        .store()
        .list_all(&Path::parse("data/posts").unwrap())
        .await
        .unwrap()
    {
        if entry.path.file_name().ends_with(".parquet") {
            f.db.store().delete(&entry.path).await.unwrap();
        }
    }
    f.db.compaction().run_pending().await.unwrap();
    let status = f.db.compaction().status().await.unwrap();
    assert_eq!(status.failed, 1);

    f.db.compaction().retry(&job_id).await.unwrap();
    let status = f.db.compaction().status().await.unwrap();
    assert_eq!(status.pending, 1);
    assert!(status.recent[0].error.is_none());
}

/// Invariant 1: replaying an entity's events yields its current state.
#[tokio::test]
async fn replay_equals_current_state() {
    let f = fixture().await;
    let posts = f.db.collection("posts");

    at(&f, 1_000);
    posts
        .create(Some("p1".into()), doc! {"title" => "V1", "views" => 0i64})
        .await
        .unwrap();
    at(&f, 2_000);
    posts
        .update(
            "p1",
            &UpdateDoc::new().set("title", "V2").inc("views", 5.0),
            &UpdateOptions::default(),
        )
        .await
        .unwrap();
    at(&f, 3_000);
    posts
        .update("p1", &UpdateDoc::new().unset("views"), &UpdateOptions::default())
        .await
        .unwrap();

    let current = posts.get("p1").await.unwrap().unwrap();
    let replayed = posts.get_at("p1", i64::MAX).await.unwrap().unwrap();
    assert_eq!(current, replayed);
}

/// Invariant 6: every recorded event target uses the colon form.
#[tokio::test]
async fn event_targets_always_use_colon_form() {
    let f = fixture().await;
    let posts = f.db.collection("posts");

    posts.create(Some("p1".into()), doc! {"k" => 1i64}).await.unwrap();
    at(&f, 5_000);
    posts
        .update("p1", &UpdateDoc::new().set("k", 2i64), &UpdateOptions::default())
        .await
        .unwrap();
    at(&f, 6_000);
    posts
        .delete(
            "p1",
            &DeleteOptions {
                hard: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let events = f.db.events().get_events_in_range(None, None).await.unwrap();
    assert!(!events.is_empty());
    for event in &events {
        assert!(
            event.target.contains(':') && !event.target.contains('/'),
            "bad target {:?}",
            event.target
        );
        assert!(EntityId::parse_event_target(&event.target).is_ok());
    }
}

/// Optimistic concurrency surfaces as a version mismatch.
#[tokio::test]
async fn expected_version_mismatch_aborts() {
    let f = fixture().await;
    let posts = f.db.collection("posts");
    posts.create(Some("p1".into()), doc! {"k" => 1i64}).await.unwrap();
    at(&f, 2_000);
    posts
        .update("p1", &UpdateDoc::new().set("k", 2i64), &UpdateOptions::default())
        .await
        .unwrap();

    let err = posts
        .update(
            "p1",
            &UpdateDoc::new().set("k", 3i64),
            &UpdateOptions {
                expected_version: Some(1),
                actor: None,
            },
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("version mismatch"));
}

/// Reopening over the same store sees flushed state and the event log.
#[tokio::test]
async fn reopen_preserves_state_and_history() {
    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let time_provider = Arc::new(MockProvider::new(Time::from_timestamp_millis(1_000)));

    let db = Database::init(
        Arc::clone(&store),
        "e2e",
        Arc::clone(&time_provider) as Arc<dyn TimeProvider>,
        DatabaseConfig::default(),
    )
    .await
    .unwrap();
    db.collection("posts")
        .create(Some("p1".into()), doc! {"title" => "V1"})
        .await
        .unwrap();
    db.close().await.unwrap();

    let reopened = Database::open(
        store,
        time_provider as Arc<dyn TimeProvider>,
        DatabaseConfig::default(),
    )
    .await
    .unwrap();
    let entity = reopened
        .collection("posts")
        .get("p1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entity.body.get("title"), Some(&Value::String("V1".into())));

    let id = EntityId::new("posts", "p1").unwrap();
    let history = reopened.events().get_history(&id).await.unwrap();
    assert_eq!(history.len(), 1);
}
