//! Lexical triple retrieval
//!
//! Scores each candidate triple against a question by the IDF-weighted
//! overlap of their tokens. Everything here is deterministic: ties are
//! broken by row id and no hash-map iteration order leaks into results.

use std::collections::{BTreeMap, BTreeSet};

use cdmkg_core::{ContextMode, EvaluationConfig, TripleRow};
use once_cell::sync::Lazy;

static STOPWORDS: Lazy<BTreeSet<&'static str>> = Lazy::new(|| {
    [
        "a", "an", "and", "are", "as", "at", "be", "by", "do", "does", "for", "from", "has",
        "have", "how", "in", "is", "it", "of", "on", "or", "that", "the", "this", "to", "was",
        "what", "when", "where", "which", "who", "whom", "why", "with",
    ]
    .into_iter()
    .collect()
});

/// Lower-case alphanumeric runs, in order of appearance
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Distinct content tokens: tokenized, stop-words removed
pub fn content_terms(text: &str) -> BTreeSet<String> {
    tokenize(text)
        .into_iter()
        .filter(|t| !STOPWORDS.contains(t.as_str()))
        .collect()
}

/// A retrieved triple with its score
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredTriple<'a> {
    pub row: &'a TripleRow,
    pub score: f64,
}

/// Render a triple the way it is shown to readers and models
pub fn render_triple(row: &TripleRow) -> String {
    format!("{} -- {} --> {}", row.subject, row.predicate, row.object)
}

/// IDF-weighted lexical retriever over a fixed candidate set
#[derive(Debug)]
pub struct LexicalRetriever<'a> {
    rows: Vec<&'a TripleRow>,
    terms: Vec<BTreeSet<String>>,
    idf: BTreeMap<String, f64>,
}

impl<'a> LexicalRetriever<'a> {
    pub fn new(rows: Vec<&'a TripleRow>) -> Self {
        let terms: Vec<BTreeSet<String>> =
            rows.iter().map(|row| content_terms(&row.statement())).collect();

        let mut document_frequency: BTreeMap<String, usize> = BTreeMap::new();
        for row_terms in &terms {
            for term in row_terms {
                *document_frequency.entry(term.clone()).or_default() += 1;
            }
        }

        let n = rows.len() as f64;
        let idf = document_frequency
            .into_iter()
            .map(|(term, df)| (term, ((n + 1.0) / (df as f64 + 1.0)).ln() + 1.0))
            .collect();

        Self { rows, terms, idf }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Every candidate, best first; ties by ascending row id
    pub fn rank(&self, question: &str) -> Vec<ScoredTriple<'a>> {
        let question_terms = content_terms(question);

        let mut ranked: Vec<ScoredTriple<'a>> = self
            .rows
            .iter()
            .copied()
            .zip(&self.terms)
            .map(|(row, row_terms)| {
                let score = question_terms
                    .intersection(row_terms)
                    .map(|term| self.idf.get(term).copied().unwrap_or(0.0))
                    .sum::<f64>();
                ScoredTriple { row, score }
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.row.row_id.cmp(&b.row.row_id))
        });
        ranked
    }

    /// The context window handed to the answerer for `mode`
    pub fn window(
        &self,
        question: &str,
        mode: ContextMode,
        config: &EvaluationConfig,
    ) -> Vec<ScoredTriple<'a>> {
        let ranked = self.rank(question);
        match mode {
            ContextMode::Short => ranked
                .into_iter()
                .filter(|t| t.score > 0.0)
                .take(config.short_window)
                .collect(),
            ContextMode::Long => ranked.into_iter().take(config.long_window).collect(),
        }
    }
}
