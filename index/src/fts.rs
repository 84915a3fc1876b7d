//! Full-text index: stemmed postings, BM25 scoring, field-scoped phrase
//! matching and snippet highlighting.

use crate::{
    porter, CorruptSnafu, FamilyMismatchSnafu, IndexStats, Result, StoreSnafu,
};
use bytes::Bytes;
use object_store::{ObjectStore, Path};
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const FAMILY: &str = "fts";

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

/// Tokenizer and posting configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FtsConfig {
    /// Stemmer language; only `"en"` stems, anything else passes tokens
    /// through.
    pub language: String,
    /// Tokens shorter than this are dropped.
    pub min_word_length: usize,
    /// Whether to record positions (required for phrase search).
    pub index_positions: bool,
}

impl Default for FtsConfig {
    fn default() -> Self {
        Self {
            language: "en".to_string(),
            min_word_length: 2,
            index_positions: true,
        }
    }
}

/// One posting: where a term occurred.
///
/// Positions restart at zero per field; adjacency only ever means
/// adjacency inside a single `(document, field)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    /// Field the term occurred in.
    pub field: String,
    /// Token position within that field.
    pub position: u32,
}

/// A scored search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    /// Canonical document id.
    pub doc_id: String,
    /// BM25 score.
    pub score: f64,
}

/// Tag and snippet configuration for [`FtsIndex::add_highlights`].
#[derive(Debug, Clone)]
pub struct HighlightOptions {
    /// Opening tag around matches.
    pub pre_tag: String,
    /// Closing tag around matches.
    pub post_tag: String,
    /// Maximum snippet length in bytes, centered on the first match.
    pub max_length: usize,
}

impl Default for HighlightOptions {
    fn default() -> Self {
        Self {
            pre_tag: "<mark>".to_string(),
            post_tag: "</mark>".to_string(),
            max_length: 200,
        }
    }
}

/// A hit with its highlighted snippet.
#[derive(Debug, Clone, PartialEq)]
pub struct HighlightedResult {
    /// Canonical document id.
    pub doc_id: String,
    /// BM25 score carried over from the search.
    pub score: f64,
    /// HTML-escaped snippet with matches wrapped in the configured tags.
    pub snippet: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Persisted {
    family: String,
    name: String,
    config: FtsConfig,
    postings: HashMap<String, HashMap<String, Vec<Posting>>>,
    doc_lengths: HashMap<String, usize>,
}

/// The full-text index.
#[derive(Debug)]
pub struct FtsIndex {
    name: String,
    config: FtsConfig,
    // term -> doc id -> postings
    postings: HashMap<String, HashMap<String, Vec<Posting>>>,
    // doc id -> total tokens indexed
    doc_lengths: HashMap<String, usize>,
}

impl FtsIndex {
    /// Create an empty index.
    pub fn new(name: impl Into<String>, config: FtsConfig) -> Self {
        Self {
            name: name.into(),
            config,
            postings: HashMap::new(),
            doc_lengths: HashMap::new(),
        }
    }

    /// The index name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn stem(&self, token: &str) -> String {
        if self.config.language == "en" {
            porter::stem(token)
        } else {
            token.to_string()
        }
    }

    /// Lowercase, strip punctuation, split, drop short tokens, stem.
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() >= self.config.min_word_length)
            .map(|t| self.stem(t))
            .collect()
    }

    /// Index (or re-index) one document's text fields.
    pub fn index_document(&mut self, doc_id: &str, fields: &[(&str, &str)]) {
        self.remove_document(doc_id);

        let mut total_tokens = 0usize;
        for (field, text) in fields {
            for (position, term) in self.tokenize(text).into_iter().enumerate() {
                total_tokens += 1;
                let postings = self
                    .postings
                    .entry(term)
                    .or_default()
                    .entry(doc_id.to_string())
                    .or_default();
                if self.config.index_positions {
                    postings.push(Posting {
                        field: field.to_string(),
                        position: position as u32,
                    });
                } else if postings.is_empty() {
                    postings.push(Posting {
                        field: field.to_string(),
                        position: 0,
                    });
                }
            }
        }
        self.doc_lengths.insert(doc_id.to_string(), total_tokens);
    }

    /// Drop a document from the index.
    pub fn remove_document(&mut self, doc_id: &str) {
        if self.doc_lengths.remove(doc_id).is_none() {
            return;
        }
        self.postings.retain(|_, docs| {
            docs.remove(doc_id);
            !docs.is_empty()
        });
    }

    /// Documents containing `term` (stemmed before lookup).
    pub fn get_document_frequency(&self, term: &str) -> usize {
        let term = self.stem(&term.to_lowercase());
        self.postings.get(&term).map(|d| d.len()).unwrap_or(0)
    }

    fn bm25_score(&self, terms: &[String], doc_id: &str) -> f64 {
        let n_docs = self.doc_lengths.len() as f64;
        let avg_len = if self.doc_lengths.is_empty() {
            0.0
        } else {
            self.doc_lengths.values().sum::<usize>() as f64 / n_docs
        };
        let doc_len = *self.doc_lengths.get(doc_id).unwrap_or(&0) as f64;

        terms
            .iter()
            .filter_map(|term| {
                let docs = self.postings.get(term)?;
                let tf = docs.get(doc_id)?.len() as f64;
                let df = docs.len() as f64;
                let idf = (1.0 + (n_docs - df + 0.5) / (df + 0.5)).ln();
                let norm = if avg_len > 0.0 { doc_len / avg_len } else { 0.0 };
                Some(idf * tf * (BM25_K1 + 1.0) / (tf + BM25_K1 * (1.0 - BM25_B + BM25_B * norm)))
            })
            .sum()
    }

    /// BM25-ranked search.
    pub fn search(&self, query: &str, limit: usize) -> Vec<SearchResult> {
        let terms = self.tokenize(query);
        if terms.is_empty() {
            return vec![];
        }

        let mut candidates: HashSet<&String> = HashSet::new();
        for term in &terms {
            if let Some(docs) = self.postings.get(term) {
                candidates.extend(docs.keys());
            }
        }

        let mut results: Vec<SearchResult> = candidates
            .into_iter()
            .map(|doc_id| SearchResult {
                doc_id: doc_id.clone(),
                score: self.bm25_score(&terms, doc_id),
            })
            .collect();
        results.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.doc_id.cmp(&b.doc_id)));
        results.truncate(limit);
        results
    }

    /// Exact ordered phrase search.
    ///
    /// The tokens must appear consecutively within one field of the
    /// document; positions from different fields never line up into a
    /// phantom phrase.
    pub fn search_phrase(&self, query: &str) -> Vec<SearchResult> {
        let terms = self.tokenize(query);
        if terms.is_empty() {
            return vec![];
        }

        // candidates must contain every term
        let Some(first_docs) = self.postings.get(&terms[0]) else {
            return vec![];
        };
        let mut hits = vec![];
        'docs: for doc_id in first_docs.keys() {
            // field -> positions, per term
            let mut per_term: Vec<HashMap<&str, HashSet<u32>>> = vec![];
            for term in &terms {
                let Some(postings) = self.postings.get(term).and_then(|d| d.get(doc_id)) else {
                    continue 'docs;
                };
                let mut by_field: HashMap<&str, HashSet<u32>> = HashMap::new();
                for p in postings {
                    by_field.entry(&p.field).or_default().insert(p.position);
                }
                per_term.push(by_field);
            }

            let matched = per_term[0].iter().any(|(field, starts)| {
                starts.iter().any(|start| {
                    per_term[1..].iter().enumerate().all(|(offset, by_field)| {
                        by_field
                            .get(field)
                            .map(|ps| ps.contains(&(start + offset as u32 + 1)))
                            .unwrap_or(false)
                    })
                })
            });
            if matched {
                hits.push(SearchResult {
                    doc_id: doc_id.clone(),
                    score: self.bm25_score(&terms, doc_id),
                });
            }
        }
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.doc_id.cmp(&b.doc_id)));
        hits
    }

    /// Wrap matched words in tags and cut a snippet around the first
    /// match. Source text is HTML-escaped; a word matches when it stems to
    /// any of the query's stems.
    pub fn add_highlights(
        &self,
        results: &[SearchResult],
        docs: &HashMap<String, String>,
        query: &str,
        options: &HighlightOptions,
    ) -> Vec<HighlightedResult> {
        let stems: HashSet<String> = self.tokenize(query).into_iter().collect();

        results
            .iter()
            .filter_map(|result| {
                let text = docs.get(&result.doc_id)?;
                Some(HighlightedResult {
                    doc_id: result.doc_id.clone(),
                    score: result.score,
                    snippet: self.highlight_text(text, &stems, options),
                })
            })
            .collect()
    }

    fn highlight_text(
        &self,
        text: &str,
        stems: &HashSet<String>,
        options: &HighlightOptions,
    ) -> String {
        let words = word_ranges(text);
        let is_match =
            |range: &(usize, usize)| stems.contains(&self.stem(&text[range.0..range.1].to_lowercase()));

        let first_match = words.iter().find(|r| is_match(r));

        // window centered on the first match
        let (window_start, window_end) = match first_match {
            Some((start, _)) => {
                let half = options.max_length / 2;
                let mut ws = start.saturating_sub(half);
                while ws > 0 && !text.is_char_boundary(ws) {
                    ws -= 1;
                }
                let mut we = (ws + options.max_length).min(text.len());
                while we < text.len() && !text.is_char_boundary(we) {
                    we += 1;
                }
                (ws, we)
            }
            None => {
                let mut we = options.max_length.min(text.len());
                while we < text.len() && !text.is_char_boundary(we) {
                    we += 1;
                }
                (0, we)
            }
        };

        let mut snippet = String::new();
        let mut cursor = window_start;
        for (start, end) in words {
            if end <= window_start || start >= window_end {
                continue;
            }
            // words straddling the window edge render as plain text
            let wstart = start.max(window_start);
            let wend = end.min(window_end);
            snippet.push_str(&escape_html(&text[cursor..wstart]));
            let word = &text[wstart..wend];
            if wstart == start && wend == end && is_match(&(start, end)) {
                snippet.push_str(&options.pre_tag);
                snippet.push_str(&escape_html(word));
                snippet.push_str(&options.post_tag);
            } else {
                snippet.push_str(&escape_html(word));
            }
            cursor = wend;
        }
        snippet.push_str(&escape_html(&text[cursor..window_end]));
        snippet
    }

    /// Persist to `path`.
    pub async fn save(&self, store: &Arc<dyn ObjectStore>, path: &Path) -> Result<()> {
        let persisted = Persisted {
            family: FAMILY.to_string(),
            name: self.name.clone(),
            config: self.config.clone(),
            postings: self.postings.clone(),
            doc_lengths: self.doc_lengths.clone(),
        };
        let json = serde_json::to_vec(&persisted).expect("index serializes");
        store
            .write_atomic(path, Bytes::from(json))
            .await
            .context(StoreSnafu)
    }

    /// Load from `path`, replacing the current contents.
    pub async fn load(&mut self, store: &Arc<dyn ObjectStore>, path: &Path) -> Result<()> {
        let raw = store.read(path).await.context(StoreSnafu)?;
        let persisted: Persisted = serde_json::from_slice(&raw).context(CorruptSnafu)?;
        ensure!(
            persisted.family == FAMILY,
            FamilyMismatchSnafu {
                expected: FAMILY,
                found: persisted.family,
            }
        );
        self.name = persisted.name;
        self.config = persisted.config;
        self.postings = persisted.postings;
        self.doc_lengths = persisted.doc_lengths;
        Ok(())
    }

    /// Counters.
    pub fn get_stats(&self) -> IndexStats {
        IndexStats {
            name: self.name.clone(),
            family: FAMILY.to_string(),
            keys: self.postings.len() as u64,
            entries: self
                .postings
                .values()
                .flat_map(|d| d.values())
                .map(|p| p.len() as u64)
                .sum(),
            unique: false,
        }
    }
}

/// Byte ranges of the alphanumeric word runs in `text`.
fn word_ranges(text: &str) -> Vec<(usize, usize)> {
    let mut ranges = vec![];
    let mut start: Option<usize> = None;
    for (i, c) in text.char_indices() {
        if c.is_alphanumeric() {
            start.get_or_insert(i);
        } else if let Some(s) = start.take() {
            ranges.push((s, i));
        }
    }
    if let Some(s) = start {
        ranges.push((s, text.len()));
    }
    ranges
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
