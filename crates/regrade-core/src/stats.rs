//! Per-student and per-grader counts derived from a run
//!
//! Accepted counts are `None` when no outcomes were computed, so callers can
//! print "not computed" instead of a misleading zero.

use crate::config::Metric;
use crate::models::{ListingEntry, RequestRecord, ThreadId};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Listing-level counts for one student
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommentCounts {
    /// Every listing row (one per submitted comment)
    pub total: usize,
    /// Distinct threads, one per question
    pub unique: usize,
}

impl CommentCounts {
    pub fn get(&self, metric: Metric) -> usize {
        match metric {
            Metric::Total => self.total,
            Metric::Unique => self.unique,
        }
    }
}

/// Count rows and distinct threads per student
pub fn comment_counts(entries: &[ListingEntry]) -> BTreeMap<String, CommentCounts> {
    let mut threads: BTreeMap<&str, HashSet<&ThreadId>> = BTreeMap::new();
    let mut totals: BTreeMap<&str, usize> = BTreeMap::new();

    for entry in entries {
        *totals.entry(entry.student.as_str()).or_default() += 1;
        threads
            .entry(entry.student.as_str())
            .or_default()
            .insert(&entry.thread_id);
    }

    totals
        .into_iter()
        .map(|(student, total)| {
            let unique = threads.get(student).map_or(0, HashSet::len);
            (student.to_string(), CommentCounts { total, unique })
        })
        .collect()
}

/// Students whose `metric` count reaches `min_requests`
pub fn students_meeting_threshold(
    counts: &BTreeMap<String, CommentCounts>,
    min_requests: usize,
    metric: Metric,
) -> BTreeSet<String> {
    counts
        .iter()
        .filter(|(_, c)| c.get(metric) >= min_requests)
        .map(|(student, _)| student.clone())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StudentStats {
    pub student: String,
    pub total_comments: usize,
    pub unique_questions: usize,
    /// Threads with at least one staff reply
    pub responded: usize,
    pub accepted: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaffStats {
    pub grader: String,
    pub requested: usize,
    pub responded: usize,
    pub accepted: Option<usize>,
}

/// Per-student rows, filtered by `min_requests` and sorted by `metric` (highest first)
pub fn student_stats(
    entries: &[ListingEntry],
    records: &[RequestRecord],
    min_requests: usize,
    metric: Metric,
    outcomes_computed: bool,
) -> Vec<StudentStats> {
    let counts = comment_counts(entries);
    let included = students_meeting_threshold(&counts, min_requests, metric);

    let mut rows: Vec<StudentStats> = counts
        .iter()
        .filter(|(student, _)| included.contains(*student))
        .map(|(student, c)| {
            let theirs = records.iter().filter(|r| &r.student == student);
            let responded = theirs.clone().filter(|r| r.has_staff_response()).count();
            let accepted = outcomes_computed
                .then(|| theirs.filter(|r| r.accepted() == Some(true)).count());
            StudentStats {
                student: student.clone(),
                total_comments: c.total,
                unique_questions: c.unique,
                responded,
                accepted,
            }
        })
        .collect();

    rows.sort_by(|a, b| {
        let key = |s: &StudentStats| match metric {
            Metric::Total => s.total_comments,
            Metric::Unique => s.unique_questions,
        };
        key(b).cmp(&key(a)).then_with(|| a.student.cmp(&b.student))
    });
    rows
}

/// Per-grader rows, most requested first
pub fn staff_stats(records: &[RequestRecord], outcomes_computed: bool) -> Vec<StaffStats> {
    let mut by_grader: BTreeMap<&str, StaffStats> = BTreeMap::new();

    for record in records {
        let row = by_grader
            .entry(record.grader.as_str())
            .or_insert_with(|| StaffStats {
                grader: record.grader.clone(),
                requested: 0,
                responded: 0,
                accepted: outcomes_computed.then_some(0),
            });
        row.requested += 1;
        if record.has_staff_response() {
            row.responded += 1;
        }
        if let (Some(accepted), Some(true)) = (row.accepted.as_mut(), record.accepted()) {
            *accepted += 1;
        }
    }

    let mut rows: Vec<StaffStats> = by_grader.into_values().collect();
    rows.sort_by(|a, b| b.requested.cmp(&a.requested).then_with(|| a.grader.cmp(&b.grader)));
    rows
}
