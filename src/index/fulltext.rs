// Full-text index.
//
// Inverted index over analyzed text with positional postings. Scoring is
// BM25; phrase queries verify token adjacency with a configurable slop.
// Analyzers are built by name through a process-wide factory registry.

use crate::common::RowId;
use crate::error::DbError;
use crate::index::{Index, IndexInfo, IndexKey, KeyPart};
use crate::Result;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

/// Splits text into index terms.
pub trait Analyzer: Send + Sync {
    fn tokenize(&self, text: &str) -> Vec<String>;
}

/// Lowercases, splits on non-alphanumeric runs, and drops stop words.
pub struct StandardAnalyzer {
    stop_words: HashSet<String>,
}

impl StandardAnalyzer {
    pub fn new(options: &HashMap<String, String>) -> Self {
        let stop_words = match options.get("stop_words").map(String::as_str) {
            Some("none") => HashSet::new(),
            _ => Self::default_stop_words(),
        };
        Self { stop_words }
    }

    fn default_stop_words() -> HashSet<String> {
        [
            "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "he", "in",
            "is", "it", "its", "of", "on", "that", "the", "to", "was", "will", "with",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

impl Analyzer for StandardAnalyzer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty())
            .map(str::to_lowercase)
            .filter(|token| !self.stop_words.contains(token))
            .collect()
    }
}

type AnalyzerFactory = fn(&HashMap<String, String>) -> Arc<dyn Analyzer>;

static ANALYZERS: Lazy<RwLock<HashMap<String, AnalyzerFactory>>> = Lazy::new(|| {
    let mut factories: HashMap<String, AnalyzerFactory> = HashMap::new();
    factories.insert("standard".to_string(), |options| {
        Arc::new(StandardAnalyzer::new(options))
    });
    RwLock::new(factories)
});

/// Register an analyzer factory under a name. Intended for startup-time
/// extension; lookups afterwards are read-only.
pub fn register_analyzer(name: &str, factory: AnalyzerFactory) {
    ANALYZERS.write().insert(name.to_string(), factory);
}

/// Construct an analyzer by name with an options bag.
pub fn build_analyzer(name: &str, options: &HashMap<String, String>) -> Result<Arc<dyn Analyzer>> {
    let factories = ANALYZERS.read();
    let factory = factories
        .get(name)
        .ok_or_else(|| DbError::Validation(format!("unknown analyzer: {}", name)))?;
    Ok(factory(options))
}

/// A ranked full-text match.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredDoc {
    pub row_id: RowId,
    pub score: f64,
}

#[derive(Default)]
struct FtState {
    /// term -> doc -> token positions.
    postings: HashMap<String, HashMap<RowId, Vec<u32>>>,
    /// Raw text per document, used by key-based deletes.
    docs: HashMap<RowId, String>,
    /// Token count per document.
    doc_lengths: HashMap<RowId, u32>,
    total_tokens: u64,
}

impl FtState {
    fn avg_doc_len(&self) -> f64 {
        if self.docs.is_empty() {
            0.0
        } else {
            self.total_tokens as f64 / self.docs.len() as f64
        }
    }

    fn remove_doc(&mut self, row_id: RowId) {
        if self.docs.remove(&row_id).is_none() {
            return;
        }
        if let Some(len) = self.doc_lengths.remove(&row_id) {
            self.total_tokens -= len as u64;
        }
        self.postings.retain(|_, docs| {
            docs.remove(&row_id);
            !docs.is_empty()
        });
    }
}

pub struct FullTextIndex {
    info: IndexInfo,
    analyzer: Arc<dyn Analyzer>,
    /// Max gap between adjacent phrase terms.
    phrase_slop: u32,
    state: RwLock<FtState>,
}

impl FullTextIndex {
    pub fn new(info: IndexInfo) -> Result<Self> {
        Self::with_analyzer(info, "standard", &HashMap::new(), 0)
    }

    pub fn with_analyzer(
        info: IndexInfo,
        analyzer: &str,
        options: &HashMap<String, String>,
        phrase_slop: u32,
    ) -> Result<Self> {
        Ok(Self {
            info,
            analyzer: build_analyzer(analyzer, options)?,
            phrase_slop,
            state: RwLock::new(FtState::default()),
        })
    }

    fn index_document(&self, state: &mut FtState, row_id: RowId, text: &str) {
        state.remove_doc(row_id);
        let tokens = self.analyzer.tokenize(text);
        for (pos, term) in tokens.iter().enumerate() {
            state
                .postings
                .entry(term.clone())
                .or_default()
                .entry(row_id)
                .or_default()
                .push(pos as u32);
        }
        state.doc_lengths.insert(row_id, tokens.len() as u32);
        state.total_tokens += tokens.len() as u64;
        state.docs.insert(row_id, text.to_string());
    }

    fn bm25(&self, state: &FtState, term: &str, row_id: RowId) -> f64 {
        let Some(docs) = state.postings.get(term) else {
            return 0.0;
        };
        let Some(positions) = docs.get(&row_id) else {
            return 0.0;
        };
        let n = state.docs.len() as f64;
        let df = docs.len() as f64;
        let tf = positions.len() as f64;
        let dl = *state.doc_lengths.get(&row_id).unwrap_or(&0) as f64;
        let avgdl = state.avg_doc_len().max(1.0);

        let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
        idf * tf * (BM25_K1 + 1.0) / (tf + BM25_K1 * (1.0 - BM25_B + BM25_B * dl / avgdl))
    }

    /// Ranked search. A query wrapped in double quotes runs as a phrase
    /// query with the configured slop; anything else scores each term
    /// independently (OR semantics).
    pub fn search(&self, query: &str, top_k: usize) -> Result<Vec<ScoredDoc>> {
        let trimmed = query.trim();
        if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
            let inner = &trimmed[1..trimmed.len() - 1];
            return self.search_phrase(inner, self.phrase_slop, top_k);
        }

        let state = self.state.read();
        let terms = self.analyzer.tokenize(trimmed);
        let mut scores: HashMap<RowId, f64> = HashMap::new();
        for term in &terms {
            if let Some(docs) = state.postings.get(term) {
                for &row_id in docs.keys() {
                    *scores.entry(row_id).or_insert(0.0) += self.bm25(&state, term, row_id);
                }
            }
        }
        Ok(Self::top_k(scores, top_k))
    }

    /// Phrase query: all terms present with adjacent positions at most
    /// `slop` tokens apart, in order.
    pub fn search_phrase(&self, phrase: &str, slop: u32, top_k: usize) -> Result<Vec<ScoredDoc>> {
        let state = self.state.read();
        let terms = self.analyzer.tokenize(phrase);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        // Docs containing every term.
        let mut candidates: Option<HashSet<RowId>> = None;
        for term in &terms {
            let docs: HashSet<RowId> = match state.postings.get(term) {
                Some(docs) => docs.keys().copied().collect(),
                None => return Ok(Vec::new()),
            };
            candidates = Some(match candidates {
                None => docs,
                Some(existing) => existing.intersection(&docs).copied().collect(),
            });
        }

        let mut scores: HashMap<RowId, f64> = HashMap::new();
        for row_id in candidates.unwrap_or_default() {
            if Self::matches_phrase(&state, &terms, row_id, slop) {
                let score: f64 = terms.iter().map(|t| self.bm25(&state, t, row_id)).sum();
                scores.insert(row_id, score);
            }
        }
        Ok(Self::top_k(scores, top_k))
    }

    /// Greedy positional check: starting from each occurrence of the first
    /// term, every following term must appear within `slop + 1` tokens of
    /// its predecessor.
    fn matches_phrase(state: &FtState, terms: &[String], row_id: RowId, slop: u32) -> bool {
        let positions: Vec<&Vec<u32>> = terms
            .iter()
            .filter_map(|t| state.postings.get(t).and_then(|docs| docs.get(&row_id)))
            .collect();
        if positions.len() != terms.len() {
            return false;
        }

        'starts: for &start in positions[0] {
            let mut prev = start;
            for term_positions in &positions[1..] {
                let next = term_positions
                    .iter()
                    .copied()
                    .find(|&p| p > prev && p - prev <= slop + 1);
                match next {
                    Some(p) => prev = p,
                    None => continue 'starts,
                }
            }
            return true;
        }
        false
    }

    fn top_k(scores: HashMap<RowId, f64>, top_k: usize) -> Vec<ScoredDoc> {
        let mut ranked: Vec<ScoredDoc> = scores
            .into_iter()
            .map(|(row_id, score)| ScoredDoc { row_id, score })
            .collect();
        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.row_id.cmp(&b.row_id))
        });
        if top_k > 0 {
            ranked.truncate(top_k);
        }
        ranked
    }

    fn key_text(key: &IndexKey) -> Result<&str> {
        match key.0.as_slice() {
            [KeyPart::Str(text)] => Ok(text.as_str()),
            _ => Err(DbError::UnsupportedKeyType(
                "full-text index requires a single string key".to_string(),
            )),
        }
    }
}

impl Index for FullTextIndex {
    fn info(&self) -> &IndexInfo {
        &self.info
    }

    fn insert(&self, key: &IndexKey, row_ids: &[RowId]) -> Result<()> {
        let text = Self::key_text(key)?;
        let mut state = self.state.write();
        for &row_id in row_ids {
            self.index_document(&mut state, row_id, text);
        }
        Ok(())
    }

    /// Remove every document whose stored text equals the key.
    fn delete(&self, key: &IndexKey) -> Result<()> {
        let text = Self::key_text(key)?;
        let mut state = self.state.write();
        let matching: Vec<RowId> = state
            .docs
            .iter()
            .filter(|(_, doc)| doc.as_str() == text)
            .map(|(&row_id, _)| row_id)
            .collect();
        for row_id in matching {
            state.remove_doc(row_id);
        }
        Ok(())
    }

    /// Point lookup: documents containing all of the key's terms.
    fn find(&self, key: &IndexKey) -> Result<Vec<RowId>> {
        let text = Self::key_text(key)?;
        let state = self.state.read();
        let terms = self.analyzer.tokenize(text);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let mut result: Option<HashSet<RowId>> = None;
        for term in &terms {
            let docs: HashSet<RowId> = match state.postings.get(term) {
                Some(docs) => docs.keys().copied().collect(),
                None => return Ok(Vec::new()),
            };
            result = Some(match result {
                None => docs,
                Some(existing) => existing.intersection(&docs).copied().collect(),
            });
        }
        let mut ids: Vec<RowId> = result.unwrap_or_default().into_iter().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn find_range(&self, _min: &IndexKey, _max: &IndexKey) -> Result<Vec<RowId>> {
        Err(DbError::UnsupportedOperation(
            "range query not supported on full-text index".to_string(),
        ))
    }

    fn reset(&self) -> Result<()> {
        *self.state.write() = FtState::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Value;
    use crate::index::IndexKind;

    fn index() -> FullTextIndex {
        FullTextIndex::new(IndexInfo {
            name: "ft_body".to_string(),
            table: "posts".to_string(),
            columns: vec!["body".to_string()],
            kind: IndexKind::FullText,
            unique: false,
        })
        .unwrap()
    }

    fn add(idx: &FullTextIndex, row_id: RowId, text: &str) {
        let key = IndexKey::single(&Value::String(text.to_string())).unwrap();
        idx.insert(&key, &[row_id]).unwrap();
    }

    #[test]
    fn test_ranked_search() {
        let idx = index();
        add(&idx, 1, "rust database engine");
        add(&idx, 2, "rust rust rust everywhere");
        add(&idx, 3, "postgres internals");

        let results = idx.search("rust", 10).unwrap();
        assert_eq!(results.len(), 2);
        // Higher term frequency ranks first.
        assert_eq!(results[0].row_id, 2);
    }

    #[test]
    fn test_phrase_search_order_matters() {
        let idx = index();
        add(&idx, 1, "quick brown fox");
        add(&idx, 2, "brown quick fox");

        let results = idx.search("\"quick brown\"", 10).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].row_id, 1);
    }

    #[test]
    fn test_phrase_slop() {
        let idx = index();
        add(&idx, 1, "quick clever brown fox");

        assert!(idx.search_phrase("quick brown", 0, 10).unwrap().is_empty());
        let with_slop = idx.search_phrase("quick brown", 1, 10).unwrap();
        assert_eq!(with_slop.len(), 1);
    }

    #[test]
    fn test_delete_by_key() {
        let idx = index();
        add(&idx, 1, "delete me please");
        add(&idx, 2, "keep me around");

        let key = IndexKey::single(&Value::String("delete me please".into())).unwrap();
        idx.delete(&key).unwrap();

        assert!(idx.search("delete", 10).unwrap().is_empty());
        assert_eq!(idx.search("keep", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_find_requires_all_terms() {
        let idx = index();
        add(&idx, 1, "alpha beta gamma");
        add(&idx, 2, "alpha delta");

        let key = IndexKey::single(&Value::String("alpha beta".into())).unwrap();
        assert_eq!(idx.find(&key).unwrap(), vec![1]);
    }

    #[test]
    fn test_stop_words_filtered() {
        let idx = index();
        add(&idx, 1, "the quick fox");
        assert!(idx.search("the", 10).unwrap().is_empty());
        assert_eq!(idx.search("quick", 10).unwrap().len(), 1);
    }
}
