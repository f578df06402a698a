//! Terminal and JSON rendering of a pipeline run

use comfy_table::{Cell, Color, ContentArrangement, Table};
use regrade_core::error::{ErrorSeverity, RunReport};
use regrade_core::stats::{StaffStats, StudentStats};
use regrade_core::{ClassifierStatus, Metric, PipelineOutput};
use serde_json::json;

const NOT_COMPUTED: &str = "n/a";

fn header(table: &mut Table, columns: &[&str], no_color: bool) {
    if no_color {
        table.set_header(columns.to_vec());
    } else {
        table.set_header(
            columns
                .iter()
                .map(|c| Cell::new(c).fg(Color::Cyan))
                .collect::<Vec<_>>(),
        );
    }
}

fn count_or_na(value: Option<usize>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| NOT_COMPUTED.to_string())
}

/// Student table, sorted by the chosen metric
pub fn format_students(rows: &[StudentStats], metric: Metric, no_color: bool) -> String {
    if rows.is_empty() {
        return "No students above the request threshold.".to_string();
    }

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    let sorted_by = format!("{} (sorted)", metric);
    let (total, unique) = match metric {
        Metric::Total => (sorted_by.as_str(), "unique"),
        Metric::Unique => ("total", sorted_by.as_str()),
    };
    header(
        &mut table,
        &["Student", total, unique, "Responded", "Accepted"],
        no_color,
    );

    for row in rows {
        table.add_row(vec![
            row.student.clone(),
            row.total_comments.to_string(),
            row.unique_questions.to_string(),
            row.responded.to_string(),
            count_or_na(row.accepted),
        ]);
    }
    table.to_string()
}

pub fn format_staff(rows: &[StaffStats], no_color: bool) -> String {
    if rows.is_empty() {
        return "No graded regrade requests.".to_string();
    }

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    header(
        &mut table,
        &["Grader", "Requested", "Responded", "Accepted"],
        no_color,
    );

    for row in rows {
        table.add_row(vec![
            row.grader.clone(),
            row.requested.to_string(),
            row.responded.to_string(),
            count_or_na(row.accepted),
        ]);
    }
    table.to_string()
}

pub fn format_classifier(status: &ClassifierStatus) -> String {
    let state = match status {
        ClassifierStatus::Enabled(classifier) => classifier.model_name().to_string(),
        ClassifierStatus::Disabled => "disabled".to_string(),
        ClassifierStatus::Unavailable(reason) => format!("unavailable ({})", reason),
    };
    format!("Classifier:   {}", state)
}

/// Counters and issues of the run, one line each
pub fn format_summary(report: &RunReport) -> String {
    let mut lines = vec![
        format!(
            "Listing rows: {}{}",
            report.listed,
            if report.listing_complete {
                ""
            } else {
                " (incomplete)"
            }
        ),
        format!(
            "Threads:      {} ({} cached, {} fetched, {} failed)",
            report.threads, report.cached, report.fetched, report.failed
        ),
        format!(
            "Outcomes:     {}",
            if report.outcomes_computed {
                format!("{} newly classified", report.classified)
            } else {
                "not computed".to_string()
            }
        ),
    ];
    if !report.persisted() {
        lines.push(format!(
            "Cache:        {} records not persisted",
            report.cache_write_failures
        ));
    }

    for issue in &report.issues {
        let marker = match issue.severity {
            ErrorSeverity::Warning => "warning",
            ErrorSeverity::Error => "error",
            ErrorSeverity::Fatal => "fatal",
        };
        lines.push(format!("  {} [{}]: {}", marker, issue.source, issue.message));
        if let Some(suggestion) = &issue.suggestion {
            lines.push(format!("    hint: {}", suggestion));
        }
    }
    lines.join("\n")
}

/// Whole run as one JSON document
pub fn to_json(
    output: &PipelineOutput,
    students: &[StudentStats],
    staff: &[StaffStats],
) -> serde_json::Result<String> {
    let report = &output.report;
    serde_json::to_string_pretty(&json!({
        "assignment": output.assignment.to_string(),
        "students": students,
        "staff": staff,
        "requests": output.records,
        "summary": {
            "listed": report.listed,
            "threads": report.threads,
            "cached": report.cached,
            "fetched": report.fetched,
            "failed": report.failed,
            "classified": report.classified,
            "cache_write_failures": report.cache_write_failures,
            "outcomes_computed": report.outcomes_computed,
            "listing_complete": report.listing_complete,
            "issues": report.issues.iter().map(|i| json!({
                "source": i.source,
                "message": i.message,
                "severity": format!("{:?}", i.severity).to_lowercase(),
            })).collect::<Vec<_>>(),
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use regrade_core::classifier::KeywordEntailmentModel;
    use regrade_core::ChainOutcomeClassifier;
    use std::sync::Arc;

    fn student(name: &str, accepted: Option<usize>) -> StudentStats {
        StudentStats {
            student: name.to_string(),
            total_comments: 3,
            unique_questions: 2,
            responded: 2,
            accepted,
        }
    }

    #[test]
    fn test_students_table_marks_missing_outcomes() {
        let table = format_students(&[student("Ada", None)], Metric::Unique, true);
        assert!(table.contains("Ada"));
        assert!(table.contains(NOT_COMPUTED));
        assert!(table.contains("unique (sorted)"));
    }

    #[test]
    fn test_empty_tables_have_messages() {
        assert!(format_students(&[], Metric::Total, true).starts_with("No students"));
        assert!(format_staff(&[], true).starts_with("No graded"));
    }

    #[test]
    fn test_classifier_line_names_model_or_reason() {
        let keyword = ClassifierStatus::Enabled(ChainOutcomeClassifier::new(
            Arc::new(KeywordEntailmentModel::new()),
            0.2,
        ));
        assert_eq!(format_classifier(&keyword), "Classifier:   keyword");
        assert_eq!(format_classifier(&ClassifierStatus::Disabled), "Classifier:   disabled");
        assert!(format_classifier(&ClassifierStatus::Unavailable("timeout".into()))
            .ends_with("unavailable (timeout)"));
    }

    #[test]
    fn test_summary_flags_incomplete_listing() {
        let mut report = RunReport::new();
        report.listing_complete = false;
        report.add_warning("classifier", "backend down");

        let summary = format_summary(&report);
        assert!(summary.contains("(incomplete)"));
        assert!(summary.contains("not computed"));
        assert!(summary.contains("warning [classifier]: backend down"));
    }
}
