//! Lexical index entries and BM25 ranking.
//!
//! The tokenizer lowercases, splits on non-alphanumeric characters, drops
//! a short English stop list, and applies a light suffix stemmer so that
//! "discounts" and "discounting" match "discount". The SQLite store gets
//! equivalent behavior from FTS5's `porter` tokenizer; this module is the
//! in-process counterpart used by the in-memory store.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is", "it",
    "of", "on", "or", "so", "that", "the", "their", "then", "there", "these", "they", "this", "to",
    "was", "we", "were", "will", "with", "you", "i", "um", "uh",
];

/// Term frequencies of one chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LexicalEntry {
    pub terms: BTreeMap<String, u32>,
    /// Number of indexed tokens.
    pub length: u32,
}

impl LexicalEntry {
    pub fn index(text: &str) -> Self {
        let mut terms = BTreeMap::new();
        let mut length = 0u32;
        for token in tokenize(text) {
            *terms.entry(token).or_insert(0) += 1;
            length += 1;
        }
        Self { terms, length }
    }

    pub fn term_frequency(&self, term: &str) -> u32 {
        self.terms.get(term).copied().unwrap_or(0)
    }
}

/// Split text into normalized, stemmed index terms.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .map(|w| stem(&w))
        .collect()
}

/// Strip a common English inflection suffix.
pub fn stem(word: &str) -> String {
    let n = word.chars().count();
    if n > 5 && word.ends_with("ing") {
        return word[..word.len() - 3].to_string();
    }
    if n > 4 && word.ends_with("ed") {
        return word[..word.len() - 2].to_string();
    }
    if n > 4 && (word.ends_with("ches") || word.ends_with("shes") || word.ends_with("sses")) {
        return word[..word.len() - 2].to_string();
    }
    if n > 3 && word.ends_with('s') && !word.ends_with("ss") && !word.ends_with("us") {
        return word[..word.len() - 1].to_string();
    }
    word.to_string()
}

/// Score every entry against the query with BM25.
///
/// Document frequencies and average length are taken over `entries`, the
/// filtered candidate set, so scores are comparable only within one call.
/// Entries without any query term score `0.0`.
pub fn bm25_scores(query: &str, entries: &[&LexicalEntry]) -> Vec<f64> {
    let mut query_terms = tokenize(query);
    query_terms.sort();
    query_terms.dedup();

    if query_terms.is_empty() || entries.is_empty() {
        return vec![0.0; entries.len()];
    }

    let n = entries.len() as f64;
    let avg_len = entries.iter().map(|e| e.length as f64).sum::<f64>() / n;
    let avg_len = if avg_len > 0.0 { avg_len } else { 1.0 };

    let mut doc_freq: HashMap<&str, f64> = HashMap::new();
    for term in &query_terms {
        let df = entries.iter().filter(|e| e.term_frequency(term) > 0).count();
        doc_freq.insert(term.as_str(), df as f64);
    }

    entries
        .iter()
        .map(|entry| {
            let len_norm = 1.0 - BM25_B + BM25_B * (entry.length as f64 / avg_len);
            query_terms
                .iter()
                .map(|term| {
                    let tf = entry.term_frequency(term) as f64;
                    if tf == 0.0 {
                        return 0.0;
                    }
                    let df = doc_freq.get(term.as_str()).copied().unwrap_or(0.0);
                    let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();
                    idf * (tf * (BM25_K1 + 1.0)) / (tf + BM25_K1 * len_norm)
                })
                .sum()
        })
        .collect()
}
