//! Listing rows discovered while paging through an assignment's regrade requests

use super::assignment::{AssignmentId, CacheKey, ThreadId};
use serde::{Deserialize, Serialize};

/// One row of the regrade request listing
///
/// Each row is one submitted comment; several rows may point at the same
/// thread (a student commenting twice on one question).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingEntry {
    pub thread_id: ThreadId,
    /// Absolute URL of the thread (review) page
    pub review_link: String,
    pub student: String,
    pub question_id: String,
    pub question_title: String,
    pub question_link: String,
    pub grader: String,
}

impl ListingEntry {
    /// Build an entry from a review link; the thread id is derived from it
    pub fn new(
        review_link: impl Into<String>,
        student: impl Into<String>,
        question_title: impl Into<String>,
        question_link: impl Into<String>,
        grader: impl Into<String>,
    ) -> Self {
        let review_link = review_link.into();
        let question_link = question_link.into();
        let question_title = question_title.into();
        let question_id = question_id_from_link(&question_link).unwrap_or_else(|| question_title.clone());
        Self {
            thread_id: ThreadId::from_link(&review_link),
            review_link,
            student: student.into(),
            question_id,
            question_title,
            question_link,
            grader: grader.into(),
        }
    }

    pub fn cache_key(&self, assignment: &AssignmentId) -> CacheKey {
        CacheKey::new(assignment, &self.thread_id)
    }
}

/// `/courses/1/questions/42/...` -> `42`
fn question_id_from_link(link: &str) -> Option<String> {
    let mut segments = link.split('/');
    segments.find(|s| *s == "questions")?;
    segments
        .next()
        .filter(|s| !s.is_empty())
        .map(|s| s.split(['?', '#']).next().unwrap_or(s).to_string())
}

/// One page of the listing plus the continuation to the next page
#[derive(Debug, Clone, Default)]
pub struct ListingPage {
    pub entries: Vec<ListingEntry>,
    /// Opaque continuation (next page URL); `None` marks the end of the list
    pub next: Option<String>,
}

impl ListingPage {
    pub fn last(entries: Vec<ListingEntry>) -> Self {
        Self {
            entries,
            next: None,
        }
    }

    pub fn with_next(entries: Vec<ListingEntry>, next: impl Into<String>) -> Self {
        Self {
            entries,
            next: Some(next.into()),
        }
    }

    /// End of traversal: explicit end marker or an empty page
    pub fn is_terminal(&self) -> bool {
        self.next.is_none() || self.entries.is_empty()
    }
}
