//! End-to-end run: session, fetch, classify
//!
//! Only configuration errors, authentication and cache initialization stop a
//! run. Everything else is recorded in the returned `RunReport`.

use crate::cache::RegradeCache;
use crate::classifier::{
    ChainOutcomeClassifier, EntailmentModel, HttpEntailmentModel, KeywordEntailmentModel,
};
use crate::config::{ClassifierBackend, Metric, RegradeConfig};
use crate::error::{CoreError, RunIssue, RunReport};
use crate::fetcher::{FetchOptions, FetchResult, RequestFetcher};
use crate::models::{AssignmentId, ListingEntry, RequestRecord};
use crate::platform::{GradescopeClient, GradingPlatform};
use crate::session::{Authenticator, Credentials, SessionStore};
use crate::stats::{self, StaffStats, StudentStats};
use std::sync::Arc;
use tracing::{info, warn};

/// Whether and how outcomes are computed for a run
#[derive(Clone)]
pub enum ClassifierStatus {
    Enabled(ChainOutcomeClassifier),
    /// Turned off by configuration
    Disabled,
    /// Enabled but no backend could be reached
    Unavailable(String),
}

/// Everything a run produced
#[derive(Debug)]
pub struct PipelineOutput {
    pub assignment: AssignmentId,
    /// Sorted by student, then question
    pub records: Vec<RequestRecord>,
    /// Raw listing rows, needed for per-comment counts
    pub listing: Vec<ListingEntry>,
    pub report: RunReport,
}

impl PipelineOutput {
    pub fn student_stats(&self, min_requests: usize, metric: Metric) -> Vec<StudentStats> {
        stats::student_stats(
            &self.listing,
            &self.records,
            min_requests,
            metric,
            self.report.outcomes_computed,
        )
    }

    pub fn staff_stats(&self) -> Vec<StaffStats> {
        stats::staff_stats(&self.records, self.report.outcomes_computed)
    }
}

pub struct Pipeline {
    config: RegradeConfig,
    platform: Arc<dyn GradingPlatform>,
    authenticator: Arc<dyn Authenticator>,
    classifier: ClassifierStatus,
}

impl Pipeline {
    pub fn new(
        config: RegradeConfig,
        platform: Arc<dyn GradingPlatform>,
        authenticator: Arc<dyn Authenticator>,
        classifier: ClassifierStatus,
    ) -> Self {
        Self {
            config,
            platform,
            authenticator,
            classifier,
        }
    }

    /// Wire the Gradescope client and the configured entailment backend
    pub async fn from_config(config: RegradeConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let client = Arc::new(GradescopeClient::new(
            &config.base_url,
            config.request_timeout(),
        )?);

        let classifier = Self::classifier_from_config(&config).await;
        Ok(Self::new(config, client.clone(), client, classifier))
    }

    async fn classifier_from_config(config: &RegradeConfig) -> ClassifierStatus {
        let settings = &config.classifier;
        if !settings.enabled {
            return ClassifierStatus::Disabled;
        }

        let model: Arc<dyn EntailmentModel> = match settings.backend {
            ClassifierBackend::Keyword => Arc::new(KeywordEntailmentModel::new()),
            ClassifierBackend::Http => match HttpEntailmentModel::connect(settings).await {
                Ok(model) => Arc::new(model),
                Err(e) => {
                    warn!(error = %e, "Continuing without outcome classification");
                    return ClassifierStatus::Unavailable(e.to_string());
                }
            },
        };
        info!(model = model.name(), "Outcome classifier ready");
        ClassifierStatus::Enabled(ChainOutcomeClassifier::new(model, settings.ambiguity_margin))
    }

    pub fn config(&self) -> &RegradeConfig {
        &self.config
    }

    pub fn classifier(&self) -> &ClassifierStatus {
        &self.classifier
    }

    /// Fetch and classify every regrade thread of the assignment at `url`
    pub async fn run(
        &self,
        url: &str,
        credentials: Option<&Credentials>,
    ) -> Result<PipelineOutput, CoreError> {
        self.config.validate()?;
        let assignment = AssignmentId::from_url(url)?;

        let cache = Arc::new(RegradeCache::open(&self.config.cache_dir)?);

        let store = SessionStore::new(&self.config.cookie_file);
        let session = store
            .acquire(self.authenticator.as_ref(), credentials)
            .await?;
        // Written back to the cookie file when the run ends, whatever the outcome
        let guard = store.scoped(session);
        let session = Arc::new((*guard).clone());

        let mut report = RunReport::new();
        info!(%assignment, parallelism = self.config.parallelism, "Fetching regrade requests");

        let fetcher = RequestFetcher::new(
            Arc::clone(&self.platform),
            Arc::clone(&cache),
            FetchOptions::from_config(&self.config),
        );
        let FetchResult {
            mut records,
            listing,
        } = fetcher.fetch_all(session, &assignment, &mut report).await;

        match &self.classifier {
            ClassifierStatus::Enabled(classifier) => {
                let pass = classifier.classify_all(&mut records, &mut report).await;
                report.outcomes_computed = pass.completed();
                for index in pass.classified {
                    if let Err(e) = cache.put(&records[index]) {
                        report.record_cache_write_failure(&e);
                    }
                }
            }
            ClassifierStatus::Disabled => {
                info!("Outcome classification disabled");
            }
            ClassifierStatus::Unavailable(reason) => {
                report.add_issue(RunIssue::from_core_error(
                    "classifier",
                    &CoreError::unavailable(reason.clone()),
                ));
            }
        }

        records.sort_by(|a, b| {
            a.student
                .cmp(&b.student)
                .then_with(|| a.question_id.cmp(&b.question_id))
                .then_with(|| a.thread_id.cmp(&b.thread_id))
        });

        drop(guard);

        let (warnings, errors, _) = report.issue_count();
        info!(
            listed = report.listed,
            threads = report.threads,
            cached = report.cached,
            fetched = report.fetched,
            failed = report.failed,
            classified = report.classified,
            warnings,
            errors,
            "Run complete"
        );
        if !report.persisted() {
            warn!(
                failures = report.cache_write_failures,
                "Some records were not written to the cache"
            );
        }

        Ok(PipelineOutput {
            assignment,
            records,
            listing,
            report,
        })
    }
}
