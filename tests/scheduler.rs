//! End-to-end runs of the scheduler against scripted discovery oracles.
//!
//! The oracle is an in-process fake, so these tests exercise the whole
//! pick/probe/commit loop without network access.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

use feedprobe::feed::{DiscoveryOracle, DiscoveryResult, FoundFeed};
use feedprobe::scheduler::{RetryPolicy, Scheduler, SchedulerOptions};
use feedprobe::storage::{Database, Disposition, NewCandidate};
use pretty_assertions::assert_eq;

async fn test_db() -> Database {
    Database::open(":memory:").await.unwrap()
}

async fn import(db: &Database, urls: &[&str]) {
    let candidates: Vec<NewCandidate> = urls.iter().map(|u| NewCandidate::new(*u)).collect();
    db.insert_candidates(&candidates).await.unwrap();
}

fn options(workers: usize) -> SchedulerOptions {
    SchedulerOptions {
        workers,
        retry: RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(10),
        },
        skip_hosts: Vec::new(),
    }
}

fn single(feed_url: &str) -> DiscoveryResult {
    DiscoveryResult::SingleFeed(FoundFeed {
        feed_url: feed_url.to_string(),
        title: Some("A blog".to_string()),
        final_url: feed_url.to_string(),
        content: String::new(),
    })
}

/// Serves `<host>/blog/feed.xml` for any path under `/blog` on hosts in
/// `blogs`; nothing anywhere else.
struct BlogOracle {
    blogs: HashSet<&'static str>,
    calls: AtomicUsize,
}

impl BlogOracle {
    fn new(blogs: &[&'static str]) -> Self {
        Self {
            blogs: blogs.iter().copied().collect(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DiscoveryOracle for BlogOracle {
    async fn discover(&self, url: &Url, _is_probe: bool) -> DiscoveryResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let host = url.host_str().unwrap_or_default();
        if self.blogs.contains(host) && url.path().starts_with("/blog") {
            single(&format!("https://{host}/blog/feed.xml"))
        } else {
            DiscoveryResult::NoFeeds
        }
    }
}

async fn assert_all_disposed(db: &Database, expected: usize) {
    let dispositions = db.dispositions().await.unwrap();
    assert_eq!(dispositions.len(), expected);
    let ids: HashSet<i64> = dispositions.iter().map(Disposition::candidate_id).collect();
    assert_eq!(ids.len(), expected, "a candidate has more than one disposition");
    assert_eq!(db.pending_count().await.unwrap(), 0);
}

// ============================================================================
// End to end
// ============================================================================

#[tokio::test]
async fn test_blog_and_bare_host_scenario() {
    let db = test_db().await;
    import(
        &db,
        &[
            "https://a.example/blog/",
            "https://a.example/blog/p1",
            "https://b.example/",
        ],
    )
    .await;

    let oracle = Arc::new(BlogOracle::new(&["a.example"]));
    let summary = Scheduler::new(db.clone(), oracle, options(4))
        .run()
        .await
        .unwrap();
    assert_eq!(summary.processed, 3);
    assert_eq!(summary.total, 3);

    let feeds = db.feeds().await.unwrap();
    assert_eq!(feeds.len(), 1);
    assert_eq!(feeds[0].root_canonical_url, "a.example/blog");
    assert_eq!(feeds[0].root_url, "https://a.example/blog");
    assert_eq!(feeds[0].feed_url, "https://a.example/blog/feed.xml");
    assert_eq!(feeds[0].submission_count, 2);

    for url in ["https://a.example/blog/", "https://a.example/blog/p1"] {
        let c = db.candidate_by_url(url).await.unwrap().unwrap();
        assert_eq!(
            db.disposition(c.id).await.unwrap(),
            Some(Disposition::Matched {
                candidate_id: c.id,
                feed_id: feeds[0].id
            })
        );
    }

    let b = db.candidate_by_url("https://b.example/").await.unwrap().unwrap();
    assert_eq!(
        db.disposition(b.id).await.unwrap(),
        Some(Disposition::Discarded {
            candidate_id: b.id,
            reason: "feed_not_found".to_string()
        })
    );
}

#[tokio::test]
async fn test_known_feed_resolves_without_probing() {
    let db = test_db().await;
    import(&db, &["https://a.example/blog/"]).await;

    let oracle = Arc::new(BlogOracle::new(&["a.example"]));
    Scheduler::new(db.clone(), oracle.clone(), options(1))
        .run()
        .await
        .unwrap();
    let probes_for_first = oracle.calls.load(Ordering::SeqCst);
    assert!(probes_for_first > 0);

    import(&db, &["https://a.example/blog/later", "https://a.example/blog/2024/01/x"]).await;
    let summary = Scheduler::new(db.clone(), oracle.clone(), options(2))
        .run()
        .await
        .unwrap();

    assert_eq!(oracle.calls.load(Ordering::SeqCst), probes_for_first);
    assert_eq!(summary.matched, 2);
    assert_eq!(summary.requests, 0);
    assert_eq!(db.feeds().await.unwrap()[0].submission_count, 3);
}

#[tokio::test]
async fn test_host_case_and_default_port_variants_use_known_feed() {
    let db = test_db().await;
    import(&db, &["https://example.com/blog/p1"]).await;

    let oracle = Arc::new(BlogOracle::new(&["example.com"]));
    Scheduler::new(db.clone(), oracle.clone(), options(1))
        .run()
        .await
        .unwrap();
    let feeds = db.feeds().await.unwrap();
    assert_eq!(feeds.len(), 1);
    assert_eq!(feeds[0].root_canonical_url, "example.com/blog");
    let calls_before = oracle.calls.load(Ordering::SeqCst);

    import(
        &db,
        &[
            "https://Example.com/blog/p2",
            "https://example.com:443/blog/p3",
            "https://WWW.EXAMPLE.COM/blog/p4",
        ],
    )
    .await;
    let summary = Scheduler::new(db.clone(), oracle.clone(), options(2))
        .run()
        .await
        .unwrap();

    assert_eq!(oracle.calls.load(Ordering::SeqCst), calls_before);
    assert_eq!(summary.matched, 3);
    assert_eq!(summary.requests, 0);
    let feeds = db.feeds().await.unwrap();
    assert_eq!(feeds.len(), 1);
    assert_eq!(feeds[0].submission_count, 4);
}

#[tokio::test]
async fn test_skipped_and_invalid_candidates_never_probed() {
    let db = test_db().await;
    import(
        &db,
        &[
            "https://www.youtube.com/watch?v=1",
            "https://m.youtube.com/watch?v=2",
            "mailto:someone@example.com",
            "not a url",
        ],
    )
    .await;

    let oracle = Arc::new(BlogOracle::new(&[]));
    let mut opts = options(3);
    opts.skip_hosts = vec!["youtube.com".to_string()];
    let summary = Scheduler::new(db.clone(), oracle.clone(), opts)
        .run()
        .await
        .unwrap();

    assert_eq!(oracle.calls.load(Ordering::SeqCst), 0);
    assert_eq!(summary.discarded, 4);

    let stats = db.stats().await.unwrap();
    let mut reasons = stats.discarded.clone();
    reasons.sort();
    assert_eq!(
        reasons,
        vec![
            ("invalid_url".to_string(), 2),
            ("skipped_host".to_string(), 2)
        ]
    );
}

#[tokio::test]
async fn test_progress_reported_per_candidate() {
    let db = test_db().await;
    import(&db, &["https://a.example/blog/x", "https://b.example/", "https://c.example/"]).await;

    let (tx, mut rx) = mpsc::channel(16);
    let oracle = Arc::new(BlogOracle::new(&["a.example"]));
    let summary = Scheduler::new(db.clone(), oracle, options(2))
        .with_progress(tx)
        .run()
        .await
        .unwrap();

    let mut updates = Vec::new();
    while let Some(update) = rx.recv().await {
        updates.push(update);
    }
    assert_eq!(updates.len(), 3);
    assert!(updates.iter().all(|u| u.total == 3));
    let mut processed: Vec<u64> = updates.iter().map(|u| u.processed).collect();
    processed.sort();
    assert_eq!(processed, vec![1, 2, 3]);
    let requests: usize = updates.iter().map(|u| u.requests).sum();
    assert_eq!(requests as u64, summary.requests);
}

#[tokio::test]
async fn test_empty_pool_finishes_immediately() {
    let db = test_db().await;
    let oracle = Arc::new(BlogOracle::new(&[]));
    let summary = Scheduler::new(db, oracle, options(8)).run().await.unwrap();
    assert_eq!(summary.processed, 0);
    assert_eq!(summary.total, 0);
}

// ============================================================================
// Host exclusion
// ============================================================================

/// Records how many calls are in flight per host and the highest count seen.
#[derive(Default)]
struct ConcurrencyOracle {
    in_flight: Mutex<HashMap<String, usize>>,
    max_per_host: AtomicUsize,
    max_overall: AtomicUsize,
    overall: AtomicUsize,
}

#[async_trait]
impl DiscoveryOracle for ConcurrencyOracle {
    async fn discover(&self, url: &Url, _is_probe: bool) -> DiscoveryResult {
        let host = url.host_str().unwrap_or_default().to_string();
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let n = in_flight.entry(host.clone()).or_default();
            *n += 1;
            self.max_per_host.fetch_max(*n, Ordering::SeqCst);
        }
        let overall = self.overall.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_overall.fetch_max(overall, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(2)).await;

        self.overall.fetch_sub(1, Ordering::SeqCst);
        *self.in_flight.lock().unwrap().entry(host).or_default() -= 1;
        DiscoveryResult::CouldNotReach
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_probe_per_host() {
    let db = test_db().await;
    let urls: Vec<String> = (0..4)
        .flat_map(|h| (0..15).map(move |i| format!("https://h{h}.example/post/{i}")))
        .collect();
    let refs: Vec<&str> = urls.iter().map(String::as_str).collect();
    import(&db, &refs).await;

    let oracle = Arc::new(ConcurrencyOracle::default());
    let summary = Scheduler::new(db.clone(), oracle.clone(), options(16))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.processed, 60);
    assert_eq!(oracle.max_per_host.load(Ordering::SeqCst), 1);
    // four hosts, so never more than four probes at once
    assert!(oracle.max_overall.load(Ordering::SeqCst) <= 4);
    assert_all_disposed(&db, 60).await;

    let stats = db.stats().await.unwrap();
    assert_eq!(stats.discarded, vec![("unreachable".to_string(), 60)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_candidate_gets_exactly_one_disposition() {
    let db = test_db().await;
    let mut urls = Vec::new();
    for h in 0..6 {
        for i in 0..5 {
            urls.push(format!("https://s{h}.example/blog/{i}"));
            urls.push(format!("https://s{h}.example/about/{i}"));
        }
    }
    urls.push("garbage".to_string());
    let refs: Vec<&str> = urls.iter().map(String::as_str).collect();
    import(&db, &refs).await;

    let blogs: Vec<&'static str> = vec!["s0.example", "s2.example", "s4.example"];
    let oracle = Arc::new(BlogOracle::new(&blogs));
    let summary = Scheduler::new(db.clone(), oracle, options(8))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.processed, 61);
    assert_eq!(
        summary.registered + summary.matched + summary.discarded,
        summary.processed
    );
    assert_all_disposed(&db, 61).await;
    assert_eq!(db.feeds().await.unwrap().len(), 3);
}
