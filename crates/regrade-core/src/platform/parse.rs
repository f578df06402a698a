//! HTML parsing for the listing table and the thread (grader) page

use crate::error::CoreError;
use crate::models::{ListingEntry, ListingPage, Message, MessageRole, ThreadDetail};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, trace};
use url::Url;

pub(super) fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("valid CSS selector")
}

static REQUESTS_TABLE: Lazy<Selector> = Lazy::new(|| selector("table.js-regradeRequestsTable"));
static BODY_ROW: Lazy<Selector> = Lazy::new(|| selector("tbody tr"));
static CELL: Lazy<Selector> = Lazy::new(|| selector("td"));
static LINK: Lazy<Selector> = Lazy::new(|| selector("a[href]"));
static NEXT_PAGE: Lazy<Selector> =
    Lazy::new(|| selector(r#"a[rel~="next"][href], link[rel~="next"][href]"#));
static GRADER_PROPS: Lazy<Selector> =
    Lazy::new(|| selector(r#"div[data-react-class="SubmissionGrader"]"#));

// Listing table columns
const COL_STUDENT: usize = 0;
const COL_QUESTION: usize = 2;
const COL_GRADER: usize = 3;
const COL_REVIEW: usize = 5;

fn text_of(el: &ElementRef) -> String {
    el.text().collect::<String>().trim().to_string()
}

fn href_of(cell: &ElementRef, page_url: &Url) -> Option<(String, String)> {
    let link = cell.select(&LINK).next()?;
    let href = link.value().attr("href")?;
    let absolute = page_url.join(href).ok()?;
    Some((absolute.to_string(), text_of(&link)))
}

/// Parse one page of the regrade request listing
///
/// Rows missing the question or review link are logged and skipped.
pub fn parse_listing_page(html: &str, page_url: &Url) -> Result<ListingPage, CoreError> {
    let doc = Html::parse_document(html);

    let table = doc
        .select(&REQUESTS_TABLE)
        .next()
        .ok_or_else(|| CoreError::parse(page_url.as_str(), "regrade requests table not found"))?;

    let mut entries = Vec::new();
    for (index, row) in table.select(&BODY_ROW).enumerate() {
        let cells: Vec<ElementRef> = row.select(&CELL).collect();
        if cells.len() <= COL_REVIEW {
            error!(row = index, cells = cells.len(), "Listing row has too few columns");
            continue;
        }

        let student = text_of(&cells[COL_STUDENT]);
        let Some((question_link, question_title)) = href_of(&cells[COL_QUESTION], page_url) else {
            error!(row = index, %student, "Question link not found");
            continue;
        };
        let Some((review_link, _)) = href_of(&cells[COL_REVIEW], page_url) else {
            error!(row = index, %student, "Review link not found");
            continue;
        };
        let grader = text_of(&cells[COL_GRADER]);

        trace!(%student, %review_link, "Listing row");
        entries.push(ListingEntry::new(
            review_link,
            student,
            question_title,
            question_link,
            grader,
        ));
    }

    let next = doc
        .select(&NEXT_PAGE)
        .next()
        .and_then(|a| a.value().attr("href"))
        .and_then(|href| page_url.join(href).ok())
        .map(|u| u.to_string());

    Ok(ListingPage { entries, next })
}

#[derive(Debug, Deserialize)]
struct GraderProps {
    #[serde(default)]
    open_request: Option<RawRequest>,
    #[serde(default)]
    closed_requests: Option<Vec<RawRequest>>,
    submission: RawSubmission,
    question: RawQuestion,
}

#[derive(Debug, Deserialize)]
struct RawRequest {
    #[serde(default)]
    student_comment: Option<String>,
    #[serde(default)]
    staff_comment: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSubmission {
    #[serde(default)]
    score: Value,
}

#[derive(Debug, Deserialize)]
struct RawQuestion {
    #[serde(default)]
    weight: Value,
}

/// Scores arrive as numbers or numeric strings depending on the page version
fn number_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_timestamp(url: &str, field: &str, raw: Option<&str>) -> Result<DateTime<Utc>, CoreError> {
    let raw = raw.ok_or_else(|| CoreError::parse(url, format!("missing {}", field)))?;
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CoreError::parse(url, format!("bad {} '{}': {}", field, raw, e)))
}

/// Parse a thread page into its ordered messages and grading data
///
/// Each open or closed request contributes a student message and, when
/// answered, a staff message. Authors come from the listing row.
pub fn parse_thread_page(html: &str, entry: &ListingEntry) -> Result<ThreadDetail, CoreError> {
    let url = entry.review_link.as_str();
    let doc = Html::parse_document(html);

    let props_json = doc
        .select(&GRADER_PROPS)
        .next()
        .and_then(|div| div.value().attr("data-react-props"))
        .ok_or_else(|| CoreError::parse(url, "SubmissionGrader props not found"))?;

    let props: GraderProps = serde_json::from_str(props_json)
        .map_err(|e| CoreError::parse(url, format!("invalid grader props: {}", e)))?;

    let requests = props
        .open_request
        .into_iter()
        .chain(props.closed_requests.unwrap_or_default());

    let mut messages = Vec::new();
    for request in requests {
        if let Some(body) = request.student_comment {
            messages.push(Message {
                role: MessageRole::Student,
                author: entry.student.clone(),
                body,
                sent_at: parse_timestamp(url, "created_at", request.created_at.as_deref())?,
            });
        }
        if let Some(body) = request.staff_comment {
            messages.push(Message {
                role: MessageRole::Staff,
                author: entry.grader.clone(),
                body,
                sent_at: parse_timestamp(url, "updated_at", request.updated_at.as_deref())?,
            });
        }
    }
    messages.sort_by(|a, b| a.sent_at.cmp(&b.sent_at));

    Ok(ThreadDetail {
        messages,
        score: number_value(&props.submission.score),
        weight: number_value(&props.question.weight),
    })
}
