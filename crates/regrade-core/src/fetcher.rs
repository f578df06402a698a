//! Listing traversal and concurrent thread fetching
//!
//! The listing is walked page by page (each cursor comes from the previous
//! response). Threads not in the cache are then fetched by a bounded pool of
//! tasks on the multi-threaded runtime; each one retries with backoff, writes
//! its record to the cache, and reports back. A thread that exhausts its
//! retries is counted as failed and left out of the result.

use crate::cache::RegradeCache;
use crate::config::{Metric, RegradeConfig};
use crate::error::{CoreError, RunIssue, RunReport, TransientKind};
use crate::models::{AssignmentId, CacheKey, ListingEntry, RequestRecord};
use crate::platform::GradingPlatform;
use crate::session::Session;
use crate::stats::{comment_counts, students_meeting_threshold};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Upper bound on listing pages, in case the platform keeps handing out cursors
const MAX_LISTING_PAGES: usize = 500;

/// Knobs for one fetch run
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub parallelism: usize,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub request_timeout: Duration,
    pub refresh: bool,
    pub min_requests: usize,
    pub metric: Metric,
}

impl FetchOptions {
    pub fn from_config(config: &RegradeConfig) -> Self {
        Self {
            parallelism: config.parallelism.max(1),
            max_attempts: config.max_attempts.max(1),
            retry_delay: config.retry_delay(),
            request_timeout: config.request_timeout(),
            refresh: config.refresh_cache,
            min_requests: config.min_requests,
            metric: config.metric,
        }
    }
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            parallelism: 10,
            max_attempts: 3,
            retry_delay: Duration::from_millis(250),
            request_timeout: Duration::from_secs(20),
            refresh: false,
            min_requests: 0,
            metric: Metric::Unique,
        }
    }
}

/// Result of a fetch run
#[derive(Debug, Default)]
pub struct FetchResult {
    /// One record per thread, ordered by cache key
    pub records: Vec<RequestRecord>,
    /// Every listing row seen, before filtering and deduplication
    pub listing: Vec<ListingEntry>,
}

/// Run `op` up to `attempts` times with doubling backoff and a per-call timeout
///
/// Only retryable errors are retried; anything else is returned at once.
pub async fn with_retry<T, F, Fut>(
    resource: &str,
    attempts: u32,
    base_delay: Duration,
    timeout: Duration,
    mut op: F,
) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CoreError>>,
{
    let attempts = attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        if attempt > 1 {
            let delay = base_delay.saturating_mul(1 << (attempt - 2).min(16));
            debug!(resource, attempt, delay_ms = delay.as_millis() as u64, "Retrying after delay");
            sleep(delay).await;
        }

        let result = match tokio::time::timeout(timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::transient(resource, TransientKind::Timeout(timeout))),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e @ CoreError::Parse { .. }) => {
                error!(resource, attempt, error = %e, "Unexpected page layout");
                last_error = Some(e);
            }
            Err(e) => {
                warn!(resource, attempt, error = %e, "Fetch attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        CoreError::transient(resource, TransientKind::Network("no attempt made".to_string()))
    }))
}

/// Outcome of one pooled detail fetch
struct FetchedThread {
    record: RequestRecord,
    cache_error: Option<CoreError>,
}

/// Turns an assignment into its set of regrade records
pub struct RequestFetcher {
    platform: Arc<dyn GradingPlatform>,
    cache: Arc<RegradeCache>,
    options: FetchOptions,
}

impl RequestFetcher {
    pub fn new(
        platform: Arc<dyn GradingPlatform>,
        cache: Arc<RegradeCache>,
        options: FetchOptions,
    ) -> Self {
        Self {
            platform,
            cache,
            options,
        }
    }

    /// Walk the listing sequentially until the end marker
    ///
    /// A page that still fails after its retries ends traversal early; the
    /// rows gathered so far are kept and `listing_complete` is cleared.
    pub async fn fetch_listing(
        &self,
        session: &Session,
        assignment: &AssignmentId,
        report: &mut RunReport,
    ) -> Vec<ListingEntry> {
        let mut entries = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen_cursors = HashSet::new();

        for page_number in 1..=MAX_LISTING_PAGES {
            let resource = cursor.clone().unwrap_or_else(|| assignment.to_string());
            let page = with_retry(
                &resource,
                self.options.max_attempts,
                self.options.retry_delay,
                self.options.request_timeout,
                || {
                    self.platform
                        .fetch_listing_page(session, assignment, cursor.as_deref())
                },
            )
            .await;

            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    error!(page = page_number, error = %e, "Listing page failed, stopping traversal");
                    report.listing_complete = false;
                    report.add_issue(RunIssue::from_core_error("listing", &e));
                    break;
                }
            };

            debug!(page = page_number, rows = page.entries.len(), "Listing page fetched");
            let terminal = page.is_terminal();
            entries.extend(page.entries);

            if terminal {
                break;
            }
            match page.next {
                Some(next) if seen_cursors.insert(next.clone()) => cursor = Some(next),
                Some(next) => {
                    warn!(cursor = %next, "Listing cursor repeated, stopping traversal");
                    break;
                }
                None => break,
            }

            if page_number == MAX_LISTING_PAGES {
                warn!(max = MAX_LISTING_PAGES, "Listing page limit reached");
                report.listing_complete = false;
            }
        }

        report.listed = entries.len();
        info!(rows = entries.len(), "Listing traversal complete");
        entries
    }

    /// Fetch every thread of `assignment`, serving what it can from the cache
    pub async fn fetch_all(
        &self,
        session: Arc<Session>,
        assignment: &AssignmentId,
        report: &mut RunReport,
    ) -> FetchResult {
        let listing = self.fetch_listing(&session, assignment, report).await;

        // Students under the cutoff are never displayed, so their threads are not fetched
        let counts = comment_counts(&listing);
        let included =
            students_meeting_threshold(&counts, self.options.min_requests, self.options.metric);
        if included.len() < counts.len() {
            debug!(
                skipped = counts.len() - included.len(),
                min_requests = self.options.min_requests,
                "Students below threshold skipped"
            );
        }

        let mut unique: BTreeMap<CacheKey, ListingEntry> = BTreeMap::new();
        for entry in listing.iter().filter(|e| included.contains(&e.student)) {
            unique
                .entry(entry.cache_key(assignment))
                .or_insert_with(|| entry.clone());
        }
        report.threads = unique.len();

        let mut merged: BTreeMap<CacheKey, RequestRecord> = BTreeMap::new();
        let mut to_fetch = Vec::new();
        for (key, entry) in unique {
            match self.cached(&key) {
                Some(record) => {
                    merged.insert(key, record);
                }
                None => to_fetch.push((key, entry)),
            }
        }
        report.cached = merged.len();
        info!(
            threads = report.threads,
            cached = report.cached,
            to_fetch = to_fetch.len(),
            "Partitioned threads"
        );

        for (key, fetched) in self.fetch_threads(session, assignment, to_fetch, report).await {
            // A fresh fetch supersedes whatever was cached
            merged.insert(key, fetched);
        }

        FetchResult {
            records: merged.into_values().collect(),
            listing,
        }
    }

    fn cached(&self, key: &CacheKey) -> Option<RequestRecord> {
        match self.cache.contains_fresh(key, self.options.refresh) {
            Ok(true) => self.cache.get(key).unwrap_or_else(|e| {
                warn!(key = %key, error = %e, "Unreadable cache entry, refetching");
                None
            }),
            Ok(false) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache lookup failed, refetching");
                None
            }
        }
    }

    /// Bounded parallel detail fetch; returns the threads that succeeded
    async fn fetch_threads(
        &self,
        session: Arc<Session>,
        assignment: &AssignmentId,
        entries: Vec<(CacheKey, ListingEntry)>,
        report: &mut RunReport,
    ) -> Vec<(CacheKey, RequestRecord)> {
        let semaphore = Arc::new(Semaphore::new(self.options.parallelism));
        let mut handles = Vec::with_capacity(entries.len());

        for (key, entry) in entries {
            let sem = Arc::clone(&semaphore);
            let platform = Arc::clone(&self.platform);
            let cache = Arc::clone(&self.cache);
            let session = Arc::clone(&session);
            let assignment = assignment.clone();
            let options = self.options.clone();

            let handle = tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.map_err(|_| {
                    CoreError::transient(
                        &entry.review_link,
                        TransientKind::Network("worker pool closed".to_string()),
                    )
                })?;

                let detail = with_retry(
                    &entry.review_link,
                    options.max_attempts,
                    options.retry_delay,
                    options.request_timeout,
                    || platform.fetch_thread(&session, &entry),
                )
                .await?;

                // SQLite writes block; keep them off the async workers
                let record = RequestRecord::from_detail(&assignment, &entry, detail);
                let record_key = record.cache_key().to_string();
                let (record, cache_error) = tokio::task::spawn_blocking(move || {
                    let cache_error = cache.put(&record).err();
                    (record, cache_error)
                })
                .await
                .map_err(|e| CoreError::CacheWrite {
                    key: record_key,
                    message: format!("cache writer stopped: {}", e),
                })?;
                Ok::<_, CoreError>(FetchedThread {
                    record,
                    cache_error,
                })
            });

            handles.push((key, handle));
        }

        let mut fetched = Vec::with_capacity(handles.len());
        for (key, handle) in handles {
            let source = format!("thread:{}", key);
            match handle.await {
                Ok(Ok(thread)) => {
                    if let Some(e) = thread.cache_error {
                        warn!(key = %key, error = %e, "Record kept in memory only");
                        report.record_cache_write_failure(&e);
                    }
                    report.fetched += 1;
                    fetched.push((key, thread.record));
                }
                Ok(Err(e)) => {
                    warn!(key = %key, error = %e, "Thread skipped after retries");
                    report.record_failure(source, &e);
                }
                Err(e) => {
                    report.failed += 1;
                    report.add_error(source, format!("Task panic: {}", e));
                }
            }
        }

        debug!(
            fetched = report.fetched,
            failed = report.failed,
            "Thread fetch complete"
        );
        fetched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::{FailureKind, FailurePlan};
    use crate::platform::MockPlatform;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    fn options() -> FetchOptions {
        FetchOptions {
            parallelism: 3,
            retry_delay: Duration::from_millis(1),
            ..FetchOptions::default()
        }
    }

    fn entries(n: u32) -> Vec<ListingEntry> {
        (0..n)
            .map(|i| MockPlatform::entry(&format!("student-{}", i), i + 1, 100 + i))
            .collect()
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(
            "u",
            3,
            Duration::from_millis(1),
            Duration::from_secs(1),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CoreError::transient("u", TransientKind::RateLimited)) }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_does_not_retry_fatal_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(
            "u",
            3,
            Duration::from_millis(1),
            Duration::from_secs(1),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CoreError::authentication("expired")) }
            },
        )
        .await;

        assert!(matches!(result, Err(CoreError::Authentication { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_times_out_slow_calls() {
        let result: Result<(), _> = with_retry(
            "slow",
            2,
            Duration::from_millis(1),
            Duration::from_millis(50),
            || async {
                sleep(Duration::from_secs(10)).await;
                Ok(())
            },
        )
        .await;

        assert!(matches!(
            result,
            Err(CoreError::TransientFetch {
                kind: TransientKind::Timeout(_),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_failure_isolation() {
        let dir = tempdir().unwrap();
        let listing = entries(10);
        let platform = MockPlatform::new().with_pages(vec![listing.clone()]);
        platform.fail_thread(&listing[3].thread_id, FailurePlan::Always(FailureKind::Transient));
        platform.fail_thread(&listing[7].thread_id, FailurePlan::Always(FailureKind::Parse));
        let session = Arc::new(platform.valid_session());
        let platform = Arc::new(platform);

        let cache = Arc::new(RegradeCache::open(dir.path()).unwrap());
        let fetcher = RequestFetcher::new(platform.clone(), cache.clone(), options());
        let mut report = RunReport::new();

        let result = fetcher
            .fetch_all(session, &MockPlatform::assignment(), &mut report)
            .await;

        assert_eq!(result.records.len(), 8);
        assert_eq!(report.failed, 2);
        assert_eq!(report.fetched, 8);
        assert_eq!(cache.stats().unwrap().total_entries, 8);
        // Each failing thread used all of its attempts
        assert_eq!(platform.thread_calls(&listing[3].thread_id), 3);
        assert_eq!(platform.thread_calls(&listing[7].thread_id), 3);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let dir = tempdir().unwrap();
        let listing = entries(2);
        let platform = MockPlatform::new().with_pages(vec![listing.clone()]);
        platform.fail_thread(&listing[0].thread_id, FailurePlan::Times(2, FailureKind::Transient));
        let session = Arc::new(platform.valid_session());
        let platform = Arc::new(platform);

        let cache = Arc::new(RegradeCache::open(dir.path()).unwrap());
        let fetcher = RequestFetcher::new(platform.clone(), cache, options());
        let mut report = RunReport::new();

        let result = fetcher
            .fetch_all(session, &MockPlatform::assignment(), &mut report)
            .await;

        assert_eq!(result.records.len(), 2);
        assert_eq!(report.failed, 0);
        assert_eq!(platform.thread_calls(&listing[0].thread_id), 3);
    }

    #[tokio::test]
    async fn test_reordered_pagination_yields_same_keys() {
        let listing = entries(5);
        let forward = vec![listing[..2].to_vec(), listing[2..].to_vec()];
        let mut reversed_rows = listing.clone();
        reversed_rows.reverse();
        let backward = vec![reversed_rows[..3].to_vec(), reversed_rows[3..].to_vec()];

        let mut key_sets = Vec::new();
        for pages in [forward, backward] {
            let dir = tempdir().unwrap();
            let platform = MockPlatform::new().with_pages(pages);
            let session = Arc::new(platform.valid_session());
            let cache = Arc::new(RegradeCache::open(dir.path()).unwrap());
            let fetcher = RequestFetcher::new(Arc::new(platform), cache, options());
            let mut report = RunReport::new();

            let result = fetcher
                .fetch_all(session, &MockPlatform::assignment(), &mut report)
                .await;
            key_sets.push(
                result
                    .records
                    .iter()
                    .map(RequestRecord::cache_key)
                    .collect::<Vec<_>>(),
            );
        }

        assert_eq!(key_sets[0].len(), 5);
        assert_eq!(key_sets[0], key_sets[1]);
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let dir = tempdir().unwrap();
        let platform = MockPlatform::new()
            .with_pages(vec![entries(12)])
            .with_detail_delay(Duration::from_millis(20));
        let session = Arc::new(platform.valid_session());
        let platform = Arc::new(platform);
        let cache = Arc::new(RegradeCache::open(dir.path()).unwrap());
        let fetcher = RequestFetcher::new(platform.clone(), cache, options());

        fetcher
            .fetch_all(session, &MockPlatform::assignment(), &mut RunReport::new())
            .await;

        assert!(platform.max_in_flight() <= 3);
        assert_eq!(platform.detail_calls(), 12);
    }

    #[tokio::test]
    async fn test_duplicate_rows_fetch_once_and_min_requests_filters() {
        let dir = tempdir().unwrap();
        let repeat = MockPlatform::entry("Ada", 1, 10);
        let pages = vec![vec![repeat.clone(), repeat, MockPlatform::entry("Alan", 1, 20)]];
        let platform = MockPlatform::new().with_pages(pages);
        let session = Arc::new(platform.valid_session());
        let platform = Arc::new(platform);
        let cache = Arc::new(RegradeCache::open(dir.path()).unwrap());
        let fetcher = RequestFetcher::new(
            platform.clone(),
            cache,
            FetchOptions {
                min_requests: 2,
                metric: Metric::Total,
                ..options()
            },
        );
        let mut report = RunReport::new();

        let result = fetcher
            .fetch_all(session, &MockPlatform::assignment(), &mut report)
            .await;

        assert_eq!(report.listed, 3);
        assert_eq!(report.threads, 1);
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].student, "Ada");
        assert_eq!(result.listing.len(), 3);
        assert_eq!(platform.detail_calls(), 1);
    }

    #[tokio::test]
    async fn test_listing_failure_keeps_earlier_pages() {
        let dir = tempdir().unwrap();
        let listing = entries(4);
        let platform =
            MockPlatform::new().with_pages(vec![listing[..2].to_vec(), listing[2..].to_vec()]);
        platform.fail_listing_page(1, FailurePlan::Always(FailureKind::Transient));
        let session = Arc::new(platform.valid_session());
        let cache = Arc::new(RegradeCache::open(dir.path()).unwrap());
        let fetcher = RequestFetcher::new(Arc::new(platform), cache, options());
        let mut report = RunReport::new();

        let result = fetcher
            .fetch_all(session, &MockPlatform::assignment(), &mut report)
            .await;

        assert!(!report.listing_complete);
        assert_eq!(result.records.len(), 2);
        assert_eq!(report.failed, 0);
    }
}
