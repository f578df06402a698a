//! Regrade outcome classification
//!
//! The platform never records whether a regrade was granted, so the outcome is
//! inferred. The whole conversation becomes one premise and an entailment
//! model scores two hypotheses against it ("the request was accepted" /
//! "... rejected"). The winning entailment probability is the confidence.
//! Scores closer than the ambiguity margin, or a winner below
//! `MIN_CONFIDENCE`, yield `Undetermined`. A known final score at either end
//! of the scale overrides the model, since it can only result from one of the
//! two decisions.

pub mod http;
pub mod keyword;

pub use http::HttpEntailmentModel;
pub use keyword::KeywordEntailmentModel;

use crate::error::{CoreError, RunIssue, RunReport};
use crate::models::{Message, MessageRole, Outcome, OutcomeLabel, RequestRecord};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Hypothesis phrasing; `{}` is replaced by the candidate label
pub const HYPOTHESIS_TEMPLATE: &str = "The request for additional credit was {}.";

/// Candidate labels, in score order
pub const CANDIDATE_LABELS: [&str; 2] = ["accepted", "rejected"];

/// Entailment probability below which neither label is trusted
pub const MIN_CONFIDENCE: f32 = 0.5;

/// Text used for a staff reply left empty (a silent regrade)
const EMPTY_STAFF_REPLY: &str = "accepted";

/// Natural-language-inference backend
#[async_trait]
pub trait EntailmentModel: Send + Sync {
    /// Entailment probability of each hypothesis given `premise`, in input order
    async fn entailment(&self, premise: &str, hypotheses: &[String]) -> Result<Vec<f32>, CoreError>;

    /// Identifies the backend in logs
    fn name(&self) -> &str;
}

/// Maps a regrade conversation to an outcome
///
/// Stateless between calls: results do not depend on classification order.
#[derive(Clone)]
pub struct ChainOutcomeClassifier {
    model: Arc<dyn EntailmentModel>,
    margin: f32,
    hypotheses: Vec<String>,
}

impl ChainOutcomeClassifier {
    pub fn new(model: Arc<dyn EntailmentModel>, margin: f32) -> Self {
        let hypotheses = CANDIDATE_LABELS
            .iter()
            .map(|label| HYPOTHESIS_TEMPLATE.replace("{}", label))
            .collect();
        Self {
            model,
            margin: margin.clamp(0.0, 1.0),
            hypotheses,
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Render the conversation with role labels, in order
    pub fn format_chain(messages: &[Message]) -> String {
        messages
            .iter()
            .map(|m| {
                let body = m.body.trim();
                let body = match m.role {
                    MessageRole::Staff if body.is_empty() => EMPTY_STAFF_REPLY,
                    _ => body,
                };
                format!("{}: {}", m.role.label(), body)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Classify an ordered message chain
    pub async fn classify(&self, messages: &[Message]) -> Result<Outcome, CoreError> {
        if !messages.iter().any(|m| m.role == MessageRole::Staff) {
            return Ok(Outcome::undetermined());
        }

        let premise = Self::format_chain(messages);
        let scores = self.model.entailment(&premise, &self.hypotheses).await?;
        let [accepted, rejected] = scores[..] else {
            return Err(CoreError::unavailable(format!(
                "{} returned {} scores for {} hypotheses",
                self.model.name(),
                scores.len(),
                self.hypotheses.len()
            )));
        };

        Ok(self.decide(accepted, rejected))
    }

    fn decide(&self, accepted: f32, rejected: f32) -> Outcome {
        let clean = |p: f32| if p.is_finite() { p.clamp(0.0, 1.0) } else { 0.0 };
        let (accepted, rejected) = (clean(accepted), clean(rejected));

        let (label, best) = if accepted > rejected {
            (OutcomeLabel::Accepted, accepted)
        } else {
            (OutcomeLabel::Rejected, rejected)
        };
        if best < MIN_CONFIDENCE || (accepted - rejected).abs() < self.margin {
            return Outcome::new(OutcomeLabel::Undetermined, best);
        }
        Outcome::new(label, best)
    }

    /// Classify one record, letting a decisive final score take precedence
    pub async fn classify_record(&self, record: &RequestRecord) -> Result<Outcome, CoreError> {
        if !record.has_staff_response() {
            return Ok(Outcome::undetermined());
        }
        if let Some(outcome) = score_override(record) {
            return Ok(outcome);
        }
        self.classify(record.messages()).await
    }

    /// Attach outcomes to every record that has none yet
    ///
    /// A model failure stops the stage: remaining records keep no outcome and
    /// a warning is recorded.
    pub async fn classify_all(
        &self,
        records: &mut [RequestRecord],
        report: &mut RunReport,
    ) -> ClassificationPass {
        let mut pass = ClassificationPass::default();

        for (index, record) in records.iter_mut().enumerate() {
            if record.outcome.is_some() {
                continue;
            }
            match self.classify_record(record).await {
                Ok(outcome) => {
                    debug!(
                        thread = %record.thread_id,
                        label = %outcome.label,
                        confidence = outcome.confidence,
                        "Classified"
                    );
                    record.outcome = Some(outcome);
                    pass.classified.push(index);
                }
                Err(e) => {
                    warn!(model = self.model.name(), error = %e, "Classification stopped");
                    report.add_issue(RunIssue::from_core_error("classifier", &e));
                    report.classified += pass.classified.len();
                    pass.error = Some(e);
                    return pass;
                }
            }
        }

        report.classified += pass.classified.len();
        info!(
            model = self.model.name(),
            classified = pass.classified.len(),
            "Classification complete"
        );
        pass
    }
}

/// What one `classify_all` call did
#[derive(Debug, Default)]
pub struct ClassificationPass {
    /// Indices of records that received an outcome
    pub classified: Vec<usize>,
    /// Set when the model failed and the stage stopped early
    pub error: Option<CoreError>,
}

impl ClassificationPass {
    pub fn completed(&self) -> bool {
        self.error.is_none()
    }
}

/// Full marks can only follow an accepted request, zero only a rejected one
fn score_override(record: &RequestRecord) -> Option<Outcome> {
    let (score, weight) = (record.score?, record.weight?);
    if weight <= 0.0 {
        return None;
    }
    if score >= weight {
        Some(Outcome::new(OutcomeLabel::Accepted, 1.0))
    } else if score <= 0.0 {
        Some(Outcome::new(OutcomeLabel::Rejected, 1.0))
    } else {
        None
    }
}
