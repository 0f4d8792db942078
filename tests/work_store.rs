//! Integration tests for the work store: import, work selection, the feed
//! registry fast path, mutations and requeue.
//!
//! Each test creates its own in-memory SQLite database for isolation, except
//! the lock contention tests, which need a real file shared by two connections.

use feedprobe::scheduler::{Committer, RetryPolicy, SchedulerError};
use feedprobe::storage::{
    Database, DatabaseError, DiscardReason, Disposition, Mutation, NewCandidate,
};
use pretty_assertions::assert_eq;
use sqlx::{Connection, SqliteConnection};
use std::path::PathBuf;
use std::time::Duration;

async fn test_db() -> Database {
    Database::open(":memory:").await.unwrap()
}

async fn import(db: &Database, urls: &[&str]) {
    let candidates: Vec<NewCandidate> = urls.iter().map(|u| NewCandidate::new(*u)).collect();
    db.insert_candidates(&candidates).await.unwrap();
}

async fn id_of(db: &Database, url: &str) -> i64 {
    db.candidate_by_url(url).await.unwrap().unwrap().id
}

async fn register(db: &Database, candidate_url: &str, root_url: &str, feed_url: &str) -> i64 {
    let candidate = db.candidate_by_url(candidate_url).await.unwrap().unwrap();
    db.apply(&Mutation::Register {
        submission: candidate.submission(),
        root_url: root_url.to_string(),
        feed_url: feed_url.to_string(),
        title: Some("Blog".to_string()),
    })
    .await
    .unwrap()
    .unwrap()
}

// ============================================================================
// Import
// ============================================================================

#[tokio::test]
async fn test_import_skips_duplicate_urls() {
    let db = test_db().await;

    let report = db
        .insert_candidates(&[
            NewCandidate::new("https://a.example/1"),
            NewCandidate::new("https://a.example/2"),
            NewCandidate::new("https://a.example/1"),
        ])
        .await
        .unwrap();
    assert_eq!(report.inserted, 2);
    assert_eq!(report.duplicates, 1);

    let again = db
        .insert_candidates(&[NewCandidate::new("https://a.example/2")])
        .await
        .unwrap();
    assert_eq!(again.inserted, 0);
    assert_eq!(db.pending_count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_import_derives_canonical_url_and_host() {
    let db = test_db().await;
    import(&db, &["https://WWW.Example.com/Blog/post", "not a url"]).await;

    let c = db
        .candidate_by_url("https://WWW.Example.com/Blog/post")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(c.host.as_deref(), Some("example.com"));
    // host normalized by URL parsing, path case preserved
    assert_eq!(c.canonical_url, "example.com/Blog/post");

    let bad = db.candidate_by_url("not a url").await.unwrap().unwrap();
    assert_eq!(bad.host, None);
}

#[tokio::test]
async fn test_import_canonical_url_uses_parsed_form() {
    let db = test_db().await;
    import(
        &db,
        &[
            "https://Example.com/blog/p2",
            "https://example.com:443/blog/p3",
            "http://example.com:80/blog/p4",
            "https://example.com:8443/blog/p5",
        ],
    )
    .await;

    let canonical = |url: &'static str| {
        let db = db.clone();
        async move { db.candidate_by_url(url).await.unwrap().unwrap().canonical_url }
    };
    assert_eq!(canonical("https://Example.com/blog/p2").await, "example.com/blog/p2");
    assert_eq!(canonical("https://example.com:443/blog/p3").await, "example.com/blog/p3");
    assert_eq!(canonical("http://example.com:80/blog/p4").await, "example.com/blog/p4");
    assert_eq!(
        canonical("https://example.com:8443/blog/p5").await,
        "example.com:8443/blog/p5"
    );
}

#[tokio::test]
async fn test_import_many_crosses_batch_boundary() {
    let db = test_db().await;
    let candidates: Vec<NewCandidate> = (0..250)
        .map(|i| NewCandidate::new(format!("https://bulk.example/{i}")))
        .collect();
    let report = db.insert_candidates(&candidates).await.unwrap();
    assert_eq!(report.inserted, 250);
    assert_eq!(db.pending_count().await.unwrap(), 250);
}

// ============================================================================
// Work selection
// ============================================================================

#[tokio::test]
async fn test_next_candidate_prefers_largest_host_bucket() {
    let db = test_db().await;
    import(
        &db,
        &[
            "https://small.example/1",
            "https://big.example/1",
            "https://big.example/2",
            "https://big.example/3",
            "https://mid.example/1",
            "https://mid.example/2",
        ],
    )
    .await;

    let next = db.next_candidate(&[]).await.unwrap().unwrap();
    assert_eq!(next.host.as_deref(), Some("big.example"));

    let next = db
        .next_candidate(&["big.example".to_string()])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.host.as_deref(), Some("mid.example"));

    let none = db
        .next_candidate(&[
            "big.example".to_string(),
            "mid.example".to_string(),
            "small.example".to_string(),
        ])
        .await
        .unwrap();
    assert!(none.is_none());
}

#[tokio::test]
async fn test_hostless_candidates_come_first() {
    let db = test_db().await;
    import(&db, &["https://a.example/1", "https://a.example/2", "::nonsense::"]).await;

    let next = db.next_candidate(&[]).await.unwrap().unwrap();
    assert_eq!(next.url, "::nonsense::");
    assert_eq!(next.host, None);
}

#[tokio::test]
async fn test_disposed_candidates_are_not_pending() {
    let db = test_db().await;
    import(&db, &["https://a.example/1", "https://b.example/1"]).await;
    let id = id_of(&db, "https://a.example/1").await;

    db.apply(&Mutation::Discard {
        candidate_id: id,
        reason: DiscardReason::FeedNotFound,
    })
    .await
    .unwrap();

    assert_eq!(db.pending_count().await.unwrap(), 1);
    let next = db.next_candidate(&[]).await.unwrap().unwrap();
    assert_eq!(next.url, "https://b.example/1");
}

// ============================================================================
// Feed registry
// ============================================================================

#[tokio::test]
async fn test_find_feed_respects_segment_boundary() {
    let db = test_db().await;
    import(&db, &["https://example.com/blog/"]).await;
    register(
        &db,
        "https://example.com/blog/",
        "https://example.com/blog",
        "https://example.com/blog/feed.xml",
    )
    .await;

    let hit = db.find_feed_for("example.com/blog/post-1").await.unwrap();
    assert_eq!(hit.unwrap().root_canonical_url, "example.com/blog");

    assert!(db.find_feed_for("example.com/blog").await.unwrap().is_some());
    assert!(db.find_feed_for("example.com/blogging").await.unwrap().is_none());
    assert!(db.find_feed_for("example.com/").await.unwrap().is_none());
}

#[tokio::test]
async fn test_find_feed_prefers_most_specific_root() {
    let db = test_db().await;
    import(&db, &["https://n.example/", "https://n.example/docs/a"]).await;
    let site = register(&db, "https://n.example/", "https://n.example", "https://n.example/rss").await;
    let docs = register(
        &db,
        "https://n.example/docs/a",
        "https://n.example/docs",
        "https://n.example/docs/rss",
    )
    .await;

    let hit = db.find_feed_for("n.example/docs/b").await.unwrap().unwrap();
    assert_eq!(hit.id, docs);
    let hit = db.find_feed_for("n.example/about").await.unwrap().unwrap();
    assert_eq!(hit.id, site);
}

// ============================================================================
// Mutations
// ============================================================================

#[tokio::test]
async fn test_register_then_match_updates_counters() {
    let db = test_db().await;
    db.insert_candidates(&[
        NewCandidate {
            url: "https://a.example/blog/1".into(),
            score: Some(10),
            submitted_at: Some(1_700_000_000),
            source: None,
        },
        NewCandidate {
            url: "https://a.example/blog/2".into(),
            score: Some(5),
            submitted_at: Some(1_700_000_500),
            source: None,
        },
    ])
    .await
    .unwrap();

    let feed_id = register(
        &db,
        "https://a.example/blog/1",
        "https://a.example/blog",
        "https://a.example/blog/feed.xml",
    )
    .await;

    let second = db.candidate_by_url("https://a.example/blog/2").await.unwrap().unwrap();
    let matched = db
        .apply(&Mutation::Match {
            submission: second.submission(),
            feed_id,
        })
        .await
        .unwrap();
    assert_eq!(matched, Some(feed_id));

    let feed = db.feed_by_root("a.example/blog").await.unwrap().unwrap();
    assert_eq!(feed.submission_count, 2);
    assert_eq!(feed.total_score, 15);
    assert_eq!(feed.latest_submitted_at, Some(1_700_000_500));
    assert_eq!(feed.root_url, "https://a.example/blog");

    assert_eq!(
        db.disposition(second.id).await.unwrap(),
        Some(Disposition::Matched {
            candidate_id: second.id,
            feed_id
        })
    );
}

#[tokio::test]
async fn test_register_same_root_twice_reinforces_first_feed() {
    let db = test_db().await;
    import(&db, &["https://a.example/x", "http://www.a.example/y"]).await;

    let first = register(&db, "https://a.example/x", "https://a.example", "https://a.example/feed").await;
    let second = register(
        &db,
        "http://www.a.example/y",
        "http://www.a.example",
        "http://www.a.example/other-feed",
    )
    .await;
    assert_eq!(first, second);

    let feeds = db.feeds().await.unwrap();
    assert_eq!(feeds.len(), 1);
    assert_eq!(feeds[0].feed_url, "https://a.example/feed");
    assert_eq!(feeds[0].submission_count, 2);
}

#[tokio::test]
async fn test_second_disposition_is_rejected() {
    let db = test_db().await;
    import(&db, &["https://a.example/1"]).await;
    let id = id_of(&db, "https://a.example/1").await;

    let discard = Mutation::Discard {
        candidate_id: id,
        reason: DiscardReason::Unreachable,
    };
    db.apply(&discard).await.unwrap();

    let err = db.apply(&discard).await.unwrap_err();
    assert!(!err.is_transient());

    assert_eq!(
        db.disposition(id).await.unwrap(),
        Some(Disposition::Discarded {
            candidate_id: id,
            reason: "unreachable".to_string()
        })
    );
}

#[tokio::test]
async fn test_match_against_missing_feed_rolls_back() {
    let db = test_db().await;
    import(&db, &["https://a.example/1"]).await;
    let candidate = db.candidate_by_url("https://a.example/1").await.unwrap().unwrap();

    let err = db
        .apply(&Mutation::Match {
            submission: candidate.submission(),
            feed_id: 999,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DatabaseError::NotFound(_)));
    assert_eq!(db.disposition(candidate.id).await.unwrap(), None);
}

// ============================================================================
// Requeue & stats
// ============================================================================

#[tokio::test]
async fn test_requeue_returns_only_matching_reason() {
    let db = test_db().await;
    import(&db, &["https://a.example/1", "https://b.example/1", "https://c.example/1"]).await;
    for (url, reason) in [
        ("https://a.example/1", DiscardReason::Unreachable),
        ("https://b.example/1", DiscardReason::Unreachable),
        ("https://c.example/1", DiscardReason::SkippedHost),
    ] {
        let id = id_of(&db, url).await;
        db.apply(&Mutation::Discard {
            candidate_id: id,
            reason,
        })
        .await
        .unwrap();
    }
    assert_eq!(db.pending_count().await.unwrap(), 0);

    let requeued = db.requeue(DiscardReason::Unreachable).await.unwrap();
    assert_eq!(requeued, 2);
    assert_eq!(db.pending_count().await.unwrap(), 2);

    let stats = db.stats().await.unwrap();
    assert_eq!(stats.candidates, 3);
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.discarded, vec![("skipped_host".to_string(), 1)]);
}

// ============================================================================
// Lock contention on a database file
// ============================================================================

fn temp_db(name: &str) -> (PathBuf, String) {
    let dir = std::env::temp_dir().join(format!(
        "feedprobe_store_test_{name}_{}",
        std::process::id()
    ));
    std::fs::remove_dir_all(&dir).ok();
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("work.db").to_str().unwrap().to_string();
    (dir, path)
}

/// A second connection holding SQLite's write lock until it is dropped or rolled back.
async fn hold_write_lock(path: &str) -> SqliteConnection {
    let mut conn = SqliteConnection::connect(&format!("sqlite:{path}"))
        .await
        .unwrap();
    sqlx::query("BEGIN IMMEDIATE").execute(&mut conn).await.unwrap();
    conn
}

#[tokio::test]
async fn test_commit_on_locked_file_gives_up_with_contention() {
    let (dir, path) = temp_db("locked");
    let db = Database::open_with_busy_timeout(&path, Duration::from_millis(50))
        .await
        .unwrap();
    import(&db, &["https://a.example/1"]).await;
    let id = id_of(&db, "https://a.example/1").await;

    let lock = hold_write_lock(&path).await;
    let committer = Committer::new(
        db.clone(),
        RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(20),
        },
    );
    let err = committer
        .commit(&Mutation::Discard {
            candidate_id: id,
            reason: DiscardReason::Unreachable,
        })
        .await
        .unwrap_err();

    match err {
        SchedulerError::RetriesExhausted { attempts, source } => {
            assert_eq!(attempts, 3);
            assert!(matches!(source, DatabaseError::Contention(_)), "{source:?}");
        }
        other => panic!("expected retries exhausted, got {other:?}"),
    }

    drop(lock);
    assert_eq!(db.disposition(id).await.unwrap(), None);
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_commit_succeeds_once_lock_released() {
    let (dir, path) = temp_db("released");
    let db = Database::open_with_busy_timeout(&path, Duration::from_millis(50))
        .await
        .unwrap();
    import(&db, &["https://a.example/1"]).await;
    let id = id_of(&db, "https://a.example/1").await;

    let mut lock = hold_write_lock(&path).await;
    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        sqlx::query("ROLLBACK").execute(&mut lock).await.unwrap();
        lock
    });

    let committer = Committer::new(
        db.clone(),
        RetryPolicy {
            attempts: 5,
            backoff: Duration::from_millis(100),
        },
    );
    let feed_id = committer
        .commit(&Mutation::Discard {
            candidate_id: id,
            reason: DiscardReason::Unreachable,
        })
        .await
        .unwrap();
    assert_eq!(feed_id, None);
    drop(release.await.unwrap());

    assert_eq!(
        db.disposition(id).await.unwrap(),
        Some(Disposition::Discarded {
            candidate_id: id,
            reason: "unreachable".to_string()
        })
    );
    std::fs::remove_dir_all(&dir).ok();
}
