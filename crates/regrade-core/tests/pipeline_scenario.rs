//! End-to-end pipeline runs against the scripted platform

use regrade_core::cache::{RegradeCache, CACHE_FILE};
use regrade_core::classifier::KeywordEntailmentModel;
use regrade_core::config::{ClassifierBackend, ClassifierConfig};
use regrade_core::models::{ListingEntry, RequestRecord};
use regrade_core::platform::mock::{FailureKind, FailurePlan, MOCK_PASSWORD};
use regrade_core::platform::MockPlatform;
use regrade_core::{
    ChainOutcomeClassifier, ClassifierStatus, CoreError, Credentials, Metric, Pipeline,
    RegradeConfig,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

fn config(dir: &Path) -> RegradeConfig {
    RegradeConfig {
        cache_dir: dir.join("cache"),
        cookie_file: dir.join("cookies.json"),
        parallelism: 2,
        retry_delay_ms: 1,
        classifier: ClassifierConfig {
            enabled: false,
            ..ClassifierConfig::default()
        },
        ..RegradeConfig::default()
    }
}

fn credentials() -> Credentials {
    Credentials::new("ta@example.edu", MOCK_PASSWORD)
}

fn pipeline(config: RegradeConfig, platform: &Arc<MockPlatform>, classifier: ClassifierStatus) -> Pipeline {
    Pipeline::new(config, platform.clone(), platform.clone(), classifier)
}

fn keyword_classifier() -> ClassifierStatus {
    ClassifierStatus::Enabled(ChainOutcomeClassifier::new(
        Arc::new(KeywordEntailmentModel::new()),
        0.2,
    ))
}

fn students(n: u32) -> Vec<ListingEntry> {
    (0..n)
        .map(|i| MockPlatform::entry(&format!("student-{:02}", i), i + 1, 500 + i))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_three_pages_one_cached_one_flaky() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let entries = students(5);

    // One thread already in the cache from an earlier run
    {
        let cache = RegradeCache::open(&config.cache_dir).unwrap();
        let cached = RequestRecord::from_detail(
            &MockPlatform::assignment(),
            &entries[0],
            MockPlatform::thread_detail(Some("Regrade request rejected.")),
        );
        cache.put(&cached).unwrap();
    }

    let platform = MockPlatform::new().with_pages(vec![
        entries[0..2].to_vec(),
        entries[2..4].to_vec(),
        entries[4..5].to_vec(),
    ]);
    platform.fail_thread(&entries[3].thread_id, FailurePlan::Times(2, FailureKind::Transient));
    let platform = Arc::new(platform);

    let output = pipeline(config.clone(), &platform, ClassifierStatus::Disabled)
        .run(&MockPlatform::assignment_url(), Some(&credentials()))
        .await
        .unwrap();

    assert_eq!(output.records.len(), 5);
    assert_eq!(output.report.failed, 0);
    assert_eq!(output.report.cached, 1);
    assert_eq!(output.report.fetched, 4);
    assert!(output.report.listing_complete);
    assert_eq!(platform.listing_calls(), 3);
    assert_eq!(platform.thread_calls(&entries[0].thread_id), 0);
    assert_eq!(platform.thread_calls(&entries[3].thread_id), 3);

    let cache = RegradeCache::open(&config.cache_dir).unwrap();
    assert_eq!(cache.stats().unwrap().total_entries, 5);
}

#[tokio::test]
async fn test_second_run_is_served_from_cache() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let platform = Arc::new(MockPlatform::new().with_pages(vec![students(3), students(6)[3..].to_vec()]));
    let pipeline = pipeline(config, &platform, keyword_classifier());

    let first = pipeline
        .run(&MockPlatform::assignment_url(), Some(&credentials()))
        .await
        .unwrap();
    let detail_calls = platform.detail_calls();
    assert_eq!(detail_calls, 6);

    let second = pipeline
        .run(&MockPlatform::assignment_url(), Some(&credentials()))
        .await
        .unwrap();

    assert_eq!(platform.detail_calls(), detail_calls);
    assert_eq!(second.records, first.records);
    assert_eq!(second.report.cached, 6);
    assert_eq!(second.report.classified, 0);
    // The saved cookie file made the second login unnecessary
    assert_eq!(platform.login_calls(), 1);
}

#[tokio::test]
async fn test_refresh_refetches_everything() {
    let dir = tempdir().unwrap();
    let mut config = config(dir.path());
    let platform = Arc::new(MockPlatform::new().with_pages(vec![students(4)]));

    pipeline(config.clone(), &platform, ClassifierStatus::Disabled)
        .run(&MockPlatform::assignment_url(), Some(&credentials()))
        .await
        .unwrap();

    config.refresh_cache = true;
    let output = pipeline(config, &platform, ClassifierStatus::Disabled)
        .run(&MockPlatform::assignment_url(), Some(&credentials()))
        .await
        .unwrap();

    assert_eq!(output.report.cached, 0);
    assert_eq!(platform.detail_calls(), 8);
}

#[tokio::test]
async fn test_failing_threads_are_isolated() {
    let dir = tempdir().unwrap();
    let entries = students(10);
    let platform = MockPlatform::new().with_pages(vec![entries[..5].to_vec(), entries[5..].to_vec()]);
    platform.fail_thread(&entries[1].thread_id, FailurePlan::Always(FailureKind::Transient));
    platform.fail_thread(&entries[8].thread_id, FailurePlan::Always(FailureKind::Parse));
    let platform = Arc::new(platform);

    let output = pipeline(config(dir.path()), &platform, ClassifierStatus::Disabled)
        .run(&MockPlatform::assignment_url(), Some(&credentials()))
        .await
        .unwrap();

    assert_eq!(output.records.len(), 8);
    assert_eq!(output.report.failed, 2);
    assert!(!output.report.has_fatal_errors());
    assert!(output
        .records
        .iter()
        .all(|r| r.thread_id != entries[1].thread_id && r.thread_id != entries[8].thread_id));
}

#[tokio::test]
async fn test_disabled_classification_reports_not_computed() {
    let dir = tempdir().unwrap();
    let platform = Arc::new(MockPlatform::new().with_pages(vec![students(2)]));

    let output = pipeline(config(dir.path()), &platform, ClassifierStatus::Disabled)
        .run(&MockPlatform::assignment_url(), Some(&credentials()))
        .await
        .unwrap();

    assert!(!output.report.outcomes_computed);
    assert!(output.records.iter().all(|r| r.outcome.is_none()));
    let rows = output.student_stats(0, Metric::Unique);
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.accepted.is_none()));
    assert!(output.staff_stats().iter().all(|r| r.accepted.is_none()));
}

#[tokio::test]
async fn test_unavailable_classifier_is_a_warning() {
    let dir = tempdir().unwrap();
    let platform = Arc::new(MockPlatform::new().with_pages(vec![students(2)]));

    let output = pipeline(
        config(dir.path()),
        &platform,
        ClassifierStatus::Unavailable("no backend".to_string()),
    )
    .run(&MockPlatform::assignment_url(), Some(&credentials()))
    .await
    .unwrap();

    assert_eq!(output.records.len(), 2);
    assert!(!output.report.outcomes_computed);
    assert_eq!(output.report.warnings().count(), 1);
}

#[tokio::test]
async fn test_classified_outcomes_are_persisted() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let entries = students(2);
    let platform = Arc::new(
        MockPlatform::new()
            .with_pages(vec![entries.clone()])
            .with_detail(
                &entries[0].thread_id,
                MockPlatform::thread_detail(Some("You are right, points added.")),
            ),
    );

    let output = pipeline(config.clone(), &platform, keyword_classifier())
        .run(&MockPlatform::assignment_url(), Some(&credentials()))
        .await
        .unwrap();

    assert!(output.report.outcomes_computed);
    assert_eq!(output.report.classified, 2);
    let rows = output.student_stats(0, Metric::Unique);
    let accepted: usize = rows.iter().filter_map(|r| r.accepted).sum();
    assert_eq!(accepted, 1);

    let cache = RegradeCache::open(&config.cache_dir).unwrap();
    assert_eq!(cache.stats().unwrap().classified_entries, 2);
}

#[tokio::test]
async fn test_wrong_password_halts_before_fetching() {
    let dir = tempdir().unwrap();
    let platform = Arc::new(MockPlatform::new().with_pages(vec![students(2)]));

    let err = pipeline(config(dir.path()), &platform, ClassifierStatus::Disabled)
        .run(
            &MockPlatform::assignment_url(),
            Some(&Credentials::new("ta@example.edu", "nope")),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::Authentication { .. }));
    assert!(err.is_fatal());
    assert_eq!(platform.listing_calls(), 0);
}

#[tokio::test]
async fn test_unusable_cache_dir_halts_before_login() {
    let dir = tempdir().unwrap();
    let mut config = config(dir.path());
    config.cache_dir = dir.path().join("blocker");
    std::fs::write(&config.cache_dir, b"not a directory").unwrap();
    let platform = Arc::new(MockPlatform::new().with_pages(vec![students(2)]));

    let err = pipeline(config, &platform, ClassifierStatus::Disabled)
        .run(&MockPlatform::assignment_url(), Some(&credentials()))
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::CacheInit { .. }));
    assert_eq!(platform.login_calls(), 0);
}

#[tokio::test]
async fn test_invalid_url_is_rejected() {
    let dir = tempdir().unwrap();
    let platform = Arc::new(MockPlatform::new());

    let err = pipeline(config(dir.path()), &platform, ClassifierStatus::Disabled)
        .run("https://www.gradescope.com/courses/1", Some(&credentials()))
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::InvalidAssignmentUrl { .. }));
}

#[tokio::test]
async fn test_session_cookie_file_written_after_run() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let platform = Arc::new(MockPlatform::new().with_pages(vec![students(1)]));

    pipeline(config.clone(), &platform, ClassifierStatus::Disabled)
        .run(&MockPlatform::assignment_url(), Some(&credentials()))
        .await
        .unwrap();

    let saved = std::fs::read_to_string(&config.cookie_file).unwrap();
    assert!(saved.contains("mock-valid"));
}

#[tokio::test]
async fn test_unwritable_cache_keeps_records_in_memory() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    RegradeCache::open(&config.cache_dir).unwrap();
    {
        let conn = rusqlite::Connection::open(config.cache_dir.join(CACHE_FILE)).unwrap();
        conn.execute_batch(
            "CREATE TRIGGER reject_writes BEFORE INSERT ON regrade_records
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )
        .unwrap();
    }
    let platform = Arc::new(MockPlatform::new().with_pages(vec![students(3)]));

    let output = pipeline(config.clone(), &platform, ClassifierStatus::Disabled)
        .run(&MockPlatform::assignment_url(), Some(&credentials()))
        .await
        .unwrap();

    assert_eq!(output.records.len(), 3);
    assert_eq!(output.report.fetched, 3);
    assert_eq!(output.report.failed, 0);
    assert_eq!(output.report.cache_write_failures, 3);
    assert!(!output.report.persisted());
    assert!(!output.report.has_fatal_errors());
    assert_eq!(output.student_stats(0, Metric::Unique).len(), 3);

    let cache = RegradeCache::open(&config.cache_dir).unwrap();
    assert_eq!(cache.stats().unwrap().total_entries, 0);
}

#[tokio::test]
async fn test_keyword_backend_needs_no_server() {
    let dir = tempdir().unwrap();
    let mut config = config(dir.path());
    config.classifier = ClassifierConfig {
        enabled: true,
        backend: ClassifierBackend::Keyword,
        endpoint: "http://127.0.0.1:1".to_string(),
        ..ClassifierConfig::default()
    };

    let pipeline = Pipeline::from_config(config).await.unwrap();

    match pipeline.classifier() {
        ClassifierStatus::Enabled(classifier) => assert_eq!(classifier.model_name(), "keyword"),
        _ => panic!("keyword backend should always be available"),
    }
}
