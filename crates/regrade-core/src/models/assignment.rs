//! Durable identities: assignment, thread, and the cache key built from both

use crate::error::CoreError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use url::Url;

static ASSIGNMENT_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/courses/(\d+)/assignments/(\d+)").expect("valid regex"));

/// Course + assignment pair identifying one regrade request listing
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssignmentId {
    pub course_id: String,
    pub assignment_id: String,
}

impl AssignmentId {
    pub fn new(course_id: impl Into<String>, assignment_id: impl Into<String>) -> Self {
        Self {
            course_id: course_id.into(),
            assignment_id: assignment_id.into(),
        }
    }

    /// Extract the assignment from any URL under `/courses/<c>/assignments/<a>`
    ///
    /// Trailing path segments (`/regrade_requests`, `/review_grades`...) are ignored.
    pub fn from_url(url: &str) -> Result<Self, CoreError> {
        let caps = ASSIGNMENT_URL
            .captures(url)
            .ok_or_else(|| CoreError::InvalidAssignmentUrl {
                url: url.to_string(),
            })?;
        Ok(Self::new(&caps[1], &caps[2]))
    }

    /// Normalized listing URL for this assignment
    pub fn regrade_requests_url(&self, base: &Url) -> Result<Url, CoreError> {
        base.join(&format!(
            "/courses/{}/assignments/{}/regrade_requests",
            self.course_id, self.assignment_id
        ))
        .map_err(|e| CoreError::InvalidConfig {
            message: format!("invalid base URL {}: {}", base, e),
        })
    }

    /// Stable storage form: `<course>/<assignment>`
    pub fn storage_key(&self) -> String {
        format!("{}/{}", self.course_id, self.assignment_id)
    }
}

impl fmt::Display for AssignmentId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "courses/{}/assignments/{}",
            self.course_id, self.assignment_id
        )
    }
}

/// Newtype for a regrade thread identifier, derived from its review link path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(String);

impl ThreadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the identifier from a review link, absolute or relative
    ///
    /// Query string, fragment, host and surrounding slashes are dropped so the
    /// same thread always maps to the same id.
    pub fn from_link(link: &str) -> Self {
        let path = match Url::parse(link) {
            Ok(url) => url.path().to_string(),
            Err(_) => link.split(['?', '#']).next().unwrap_or(link).to_string(),
        };
        Self(path.trim_matches('/').to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ThreadId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Deref for ThreadId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Cache identity of one thread: (assignment, thread)
///
/// Never derived from listing position; pagination order is not stable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    assignment: String,
    thread: ThreadId,
}

impl CacheKey {
    pub fn new(assignment: &AssignmentId, thread: &ThreadId) -> Self {
        Self {
            assignment: assignment.storage_key(),
            thread: thread.clone(),
        }
    }

    pub fn assignment(&self) -> &str {
        &self.assignment
    }

    pub fn thread(&self) -> &ThreadId {
        &self.thread
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}#{}", self.assignment, self.thread)
    }
}
