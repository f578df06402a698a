//! Deterministic cue-word entailment model
//!
//! Scores the last staff turn of the premise by counting acceptance and
//! rejection cue words. Selected with `backend = "keyword"` (or
//! `--classifier keyword`) to run without an inference server; it has no
//! notion of language beyond the word lists.

use super::EntailmentModel;
use crate::error::CoreError;
use async_trait::async_trait;

const ACCEPT_CUES: &[&str] = &[
    "accepted", "added", "agree", "awarded", "fixed", "granted", "regraded", "right", "updated",
];
const REJECT_CUES: &[&str] = &[
    "denied", "incorrect", "no", "not", "rejected", "stands", "unfortunately", "wrong",
];

#[derive(Debug, Default, Clone)]
pub struct KeywordEntailmentModel;

impl KeywordEntailmentModel {
    pub fn new() -> Self {
        Self
    }

    fn cue_counts(text: &str) -> (usize, usize) {
        let words: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();
        let count = |cues: &[&str]| words.iter().filter(|w| cues.contains(&w.as_str())).count();
        (count(ACCEPT_CUES), count(REJECT_CUES))
    }
}

#[async_trait]
impl EntailmentModel for KeywordEntailmentModel {
    async fn entailment(&self, premise: &str, hypotheses: &[String]) -> Result<Vec<f32>, CoreError> {
        let last_staff_turn = premise
            .rfind("Staff:")
            .map(|at| &premise[at..])
            .unwrap_or(premise);
        let (accept, reject) = Self::cue_counts(last_staff_turn);

        // Laplace-smoothed share of each cue family
        let total = (accept + reject + 2) as f32;
        let p_accept = (accept + 1) as f32 / total;
        let p_reject = (reject + 1) as f32 / total;

        Ok(hypotheses
            .iter()
            .map(|h| {
                if h.contains("accepted") {
                    p_accept
                } else if h.contains("rejected") {
                    p_reject
                } else {
                    0.5
                }
            })
            .collect())
    }

    fn name(&self) -> &str {
        "keyword"
    }
}
