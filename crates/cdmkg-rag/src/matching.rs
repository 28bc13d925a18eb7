//! Answer correctness criteria

use cdmkg_core::{EvaluationConfig, MatchMode, TripleRow};

use crate::retrieval::tokenize;

/// Lower-case and collapse every non-alphanumeric run into one space
pub fn normalize(text: &str) -> String {
    tokenize(text).join(" ")
}

/// Decides whether an answer satisfies an expected answer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnswerMatcher {
    pub mode: MatchMode,
    pub min_token_recall: f64,
}

impl AnswerMatcher {
    pub fn new(mode: MatchMode, min_token_recall: f64) -> Self {
        Self {
            mode,
            min_token_recall,
        }
    }

    pub fn from_config(config: &EvaluationConfig) -> Self {
        Self::new(config.match_mode, config.min_token_recall)
    }

    /// Compare against free text (a rendered window or a model answer)
    pub fn matches_text(&self, expected: &str, answer: &str) -> bool {
        let expected = normalize(expected);
        let answer = normalize(answer);
        if expected.is_empty() {
            return false;
        }

        match self.mode {
            MatchMode::Exact => expected == answer,
            MatchMode::Fuzzy => {
                if contains_phrase(&answer, &expected) {
                    return true;
                }
                token_recall(&expected, &answer) >= self.min_token_recall
            }
        }
    }

    /// Compare against one retrieved triple
    pub fn matches_triple(&self, expected: &str, row: &TripleRow) -> bool {
        match self.mode {
            MatchMode::Exact => {
                let expected = normalize(expected);
                !expected.is_empty()
                    && (normalize(&row.subject) == expected || normalize(&row.object) == expected)
            }
            MatchMode::Fuzzy => self.matches_text(expected, &row.statement()),
        }
    }
}

impl Default for AnswerMatcher {
    fn default() -> Self {
        Self::from_config(&EvaluationConfig::default())
    }
}

/// Whole-token substring test on normalised text
fn contains_phrase(haystack: &str, needle: &str) -> bool {
    format!(" {haystack} ").contains(&format!(" {needle} "))
}

/// Share of the expected tokens present in the answer
fn token_recall(expected: &str, answer: &str) -> f64 {
    let expected_tokens: Vec<&str> = expected.split(' ').collect();
    let answer_tokens: std::collections::BTreeSet<&str> = answer.split(' ').collect();

    let found = expected_tokens
        .iter()
        .filter(|t| answer_tokens.contains(*t))
        .count();
    found as f64 / expected_tokens.len() as f64
}
