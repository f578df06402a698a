//! Scripted platform for tests
//!
//! MockPlatform serves a fixed set of listing pages and thread details, and
//! can be told to fail specific threads or pages a number of times. It also
//! plays the authentication side so session handling can be tested offline.

use super::GradingPlatform;
use crate::error::{CoreError, TransientKind};
use crate::models::{
    AssignmentId, ListingEntry, ListingPage, Message, MessageRole, ThreadDetail, ThreadId,
};
use crate::session::{Authenticator, Credentials, Session};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const BASE: &str = "https://www.gradescope.com";
const CURSOR_PREFIX: &str = "page:";

/// The only password `login` accepts
pub const MOCK_PASSWORD: &str = "pw";

/// How a scripted failure presents itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Parse,
}

/// Failure script for one thread or listing page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePlan {
    /// Fail the first N calls, then succeed
    Times(u32, FailureKind),
    Always(FailureKind),
}

impl FailurePlan {
    fn fails_on(&self, call: u32) -> Option<FailureKind> {
        match *self {
            FailurePlan::Times(n, kind) if call <= n => Some(kind),
            FailurePlan::Times(..) => None,
            FailurePlan::Always(kind) => Some(kind),
        }
    }
}

fn scripted_error(kind: FailureKind, url: &str) -> CoreError {
    match kind {
        FailureKind::Transient => CoreError::transient(url, TransientKind::Status(503)),
        FailureKind::Parse => CoreError::parse(url, "scripted layout change"),
    }
}

/// Mock implementation of GradingPlatform and Authenticator
pub struct MockPlatform {
    pages: Vec<Vec<ListingEntry>>,
    threads: DashMap<ThreadId, ThreadDetail>,
    thread_failures: DashMap<ThreadId, FailurePlan>,
    listing_failures: Mutex<HashMap<usize, FailurePlan>>,
    thread_calls: DashMap<ThreadId, u32>,
    page_calls: Mutex<HashMap<usize, u32>>,
    listing_calls: AtomicUsize,
    detail_calls: AtomicUsize,
    login_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    detail_delay: Duration,
    valid_session: Session,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self {
            pages: Vec::new(),
            threads: DashMap::new(),
            thread_failures: DashMap::new(),
            listing_failures: Mutex::new(HashMap::new()),
            thread_calls: DashMap::new(),
            page_calls: Mutex::new(HashMap::new()),
            listing_calls: AtomicUsize::new(0),
            detail_calls: AtomicUsize::new(0),
            login_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            detail_delay: Duration::ZERO,
            valid_session: Session::from_cookie_header("signed_token=mock-valid; remember_me=1"),
        }
    }

    /// Assignment the scripted listing belongs to
    pub fn assignment() -> AssignmentId {
        AssignmentId::new("1", "2")
    }

    pub fn assignment_url() -> String {
        format!("{}/courses/1/assignments/2/regrade_requests", BASE)
    }

    /// Listing row for `student` on question `question`, thread `submission`
    pub fn entry(student: &str, question: u32, submission: u32) -> ListingEntry {
        ListingEntry::new(
            format!(
                "{}/courses/1/questions/{}/submissions/{}/grade",
                BASE, question, submission
            ),
            student,
            format!("Question {}", question),
            format!("{}/courses/1/questions/{}/submissions", BASE, question),
            "Grace Hopper",
        )
    }

    /// Thread with one student request and an optional staff reply
    pub fn thread_detail(staff_reply: Option<&str>) -> ThreadDetail {
        let at = |secs: i64| {
            Utc.timestamp_opt(1_700_000_000 + secs, 0)
                .single()
                .unwrap_or_default()
        };
        let mut messages = vec![Message {
            role: MessageRole::Student,
            author: "student".to_string(),
            body: "I think part (b) deserves credit.".to_string(),
            sent_at: at(0),
        }];
        if let Some(reply) = staff_reply {
            messages.push(Message {
                role: MessageRole::Staff,
                author: "Grace Hopper".to_string(),
                body: reply.to_string(),
                sent_at: at(3600),
            });
        }
        ThreadDetail {
            messages,
            score: Some(3.0),
            weight: Some(5.0),
        }
    }

    /// Serve these listing pages in order; every row gets a default detail
    pub fn with_pages(mut self, pages: Vec<Vec<ListingEntry>>) -> Self {
        for entry in pages.iter().flatten() {
            self.threads
                .entry(entry.thread_id.clone())
                .or_insert_with(|| Self::thread_detail(Some("Regrade request rejected.")));
        }
        self.pages = pages;
        self
    }

    pub fn with_detail(self, thread: &ThreadId, detail: ThreadDetail) -> Self {
        self.threads.insert(thread.clone(), detail);
        self
    }

    /// Sleep this long inside every detail fetch
    pub fn with_detail_delay(mut self, delay: Duration) -> Self {
        self.detail_delay = delay;
        self
    }

    pub fn fail_thread(&self, thread: &ThreadId, plan: FailurePlan) {
        self.thread_failures.insert(thread.clone(), plan);
    }

    /// Script failures for listing page `page` (0-based)
    pub fn fail_listing_page(&self, page: usize, plan: FailurePlan) {
        self.listing_failures.lock().insert(page, plan);
    }

    pub fn valid_session(&self) -> Session {
        self.valid_session.clone()
    }

    pub fn listing_calls(&self) -> usize {
        self.listing_calls.load(Ordering::SeqCst)
    }

    pub fn detail_calls(&self) -> usize {
        self.detail_calls.load(Ordering::SeqCst)
    }

    pub fn thread_calls(&self, thread: &ThreadId) -> u32 {
        self.thread_calls.get(thread).map(|c| *c).unwrap_or(0)
    }

    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    /// Highest number of detail fetches observed running at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn is_authorized(&self, session: &Session) -> bool {
        session.cookie("signed_token").is_some()
            && session.cookie("signed_token") == self.valid_session.cookie("signed_token")
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GradingPlatform for MockPlatform {
    async fn fetch_listing_page(
        &self,
        session: &Session,
        assignment: &AssignmentId,
        cursor: Option<&str>,
    ) -> Result<ListingPage, CoreError> {
        self.listing_calls.fetch_add(1, Ordering::SeqCst);
        let url = Self::assignment_url();

        if !self.is_authorized(session) {
            return Err(CoreError::transient(&url, TransientKind::Status(401)));
        }
        if assignment != &Self::assignment() {
            return Err(CoreError::transient(&url, TransientKind::Status(404)));
        }

        let index = match cursor {
            None => 0,
            Some(c) => c
                .strip_prefix(CURSOR_PREFIX)
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| CoreError::parse(&url, format!("unknown cursor {}", c)))?,
        };

        let call = {
            let mut calls = self.page_calls.lock();
            let count = calls.entry(index).or_insert(0);
            *count += 1;
            *count
        };
        let plan = self.listing_failures.lock().get(&index).copied();
        if let Some(kind) = plan.and_then(|p| p.fails_on(call)) {
            return Err(scripted_error(kind, &url));
        }

        let entries = self.pages.get(index).cloned().unwrap_or_default();
        if index + 1 < self.pages.len() {
            Ok(ListingPage::with_next(
                entries,
                format!("{}{}", CURSOR_PREFIX, index + 1),
            ))
        } else {
            Ok(ListingPage::last(entries))
        }
    }

    async fn fetch_thread(
        &self,
        session: &Session,
        entry: &ListingEntry,
    ) -> Result<ThreadDetail, CoreError> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        let call = {
            let mut count = self.thread_calls.entry(entry.thread_id.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        if !self.detail_delay.is_zero() {
            tokio::time::sleep(self.detail_delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if !self.is_authorized(session) {
            return Err(CoreError::transient(&entry.review_link, TransientKind::Status(401)));
        }
        let plan = self.thread_failures.get(&entry.thread_id).map(|p| *p);
        if let Some(kind) = plan.and_then(|p| p.fails_on(call)) {
            return Err(scripted_error(kind, &entry.review_link));
        }

        self.threads
            .get(&entry.thread_id)
            .map(|detail| detail.clone())
            .ok_or_else(|| CoreError::transient(&entry.review_link, TransientKind::Status(404)))
    }
}

#[async_trait]
impl Authenticator for MockPlatform {
    async fn probe(&self, session: &Session) -> Result<bool, CoreError> {
        Ok(self.is_authorized(session))
    }

    async fn login(&self, credentials: &Credentials) -> Result<Session, CoreError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        if credentials.password == MOCK_PASSWORD {
            Ok(self.valid_session.clone())
        } else {
            Err(CoreError::authentication("invalid email/password combination"))
        }
    }
}
