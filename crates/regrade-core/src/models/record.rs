//! Regrade threads: messages, the cached record, and the classified outcome

use super::assignment::{AssignmentId, CacheKey, ThreadId};
use super::listing::ListingEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who wrote a message in a regrade thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    Student,
    Staff,
}

impl MessageRole {
    pub fn label(&self) -> &'static str {
        match self {
            MessageRole::Student => "Student",
            MessageRole::Staff => "Staff",
        }
    }
}

/// One turn in a regrade conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub author: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

/// Decision label for a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeLabel {
    Accepted,
    Rejected,
    Undetermined,
}

impl fmt::Display for OutcomeLabel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            OutcomeLabel::Accepted => "accepted",
            OutcomeLabel::Rejected => "rejected",
            OutcomeLabel::Undetermined => "undetermined",
        };
        write!(f, "{}", s)
    }
}

/// Classified outcome with its confidence in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub label: OutcomeLabel,
    pub confidence: f32,
}

impl Outcome {
    pub fn new(label: OutcomeLabel, confidence: f32) -> Self {
        Self {
            label,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    pub fn undetermined() -> Self {
        Self::new(OutcomeLabel::Undetermined, 0.0)
    }

    pub fn is_determined(&self) -> bool {
        self.label != OutcomeLabel::Undetermined
    }
}

/// Parsed content of a thread page
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ThreadDetail {
    /// Ordered by send time
    pub messages: Vec<Message>,
    /// Points after the last staff response, `None` when the page omits it
    pub score: Option<f64>,
    /// Maximum points for the question
    pub weight: Option<f64>,
}

/// Unit of work and of caching: one regrade thread
///
/// The message sequence is immutable once fetched; only `outcome` changes
/// after classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub thread_id: ThreadId,
    pub assignment: AssignmentId,
    pub student: String,
    pub question_id: String,
    pub question_title: String,
    pub grader: String,
    pub review_link: String,
    messages: Vec<Message>,
    pub score: Option<f64>,
    pub weight: Option<f64>,
    pub outcome: Option<Outcome>,
    pub fetched_at: DateTime<Utc>,
}

impl RequestRecord {
    /// Build a record from its listing row and the fetched thread page
    pub fn from_detail(assignment: &AssignmentId, entry: &ListingEntry, detail: ThreadDetail) -> Self {
        let mut messages = detail.messages;
        messages.sort_by(|a, b| a.sent_at.cmp(&b.sent_at));
        Self {
            thread_id: entry.thread_id.clone(),
            assignment: assignment.clone(),
            student: entry.student.clone(),
            question_id: entry.question_id.clone(),
            question_title: entry.question_title.clone(),
            grader: entry.grader.clone(),
            review_link: entry.review_link.clone(),
            messages,
            score: detail.score,
            weight: detail.weight,
            outcome: None,
            fetched_at: Utc::now(),
        }
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(&self.assignment, &self.thread_id)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn staff_messages(&self) -> impl Iterator<Item = &Message> {
        self.messages
            .iter()
            .filter(|m| m.role == MessageRole::Staff)
    }

    pub fn has_staff_response(&self) -> bool {
        self.staff_messages().next().is_some()
    }

    /// `Some(true)` accepted, `Some(false)` rejected, `None` unknown or unclassified
    pub fn accepted(&self) -> Option<bool> {
        match self.outcome.map(|o| o.label) {
            Some(OutcomeLabel::Accepted) => Some(true),
            Some(OutcomeLabel::Rejected) => Some(false),
            _ => None,
        }
    }
}
