use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

use crate::types::RetrievedExample;

/// Results at or below this similarity are dropped.
pub const MIN_SIMILARITY: f64 = 0.1;

/// Source of past task traces similar to an instruction.
pub trait ExampleRetriever: Send + Sync {
    /// Most similar examples first, at most the retriever's top-K.
    fn retrieve(&self, query: &str) -> Vec<RetrievedExample>;
}

/// Retriever that never has anything to offer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExamples;

impl ExampleRetriever for NoExamples {
    fn retrieve(&self, _query: &str) -> Vec<RetrievedExample> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ExampleRecord {
    query: String,
    #[serde(default)]
    steps: Vec<serde_json::Value>,
}

/// In-memory dataset ranked by word-overlap similarity.
#[derive(Debug, Clone, Default)]
pub struct ExampleLibrary {
    records: Vec<(ExampleRecord, HashSet<String>)>,
    top_k: usize,
}

impl ExampleLibrary {
    /// Load a JSON array of `{query, steps}` records. A missing file yields
    /// an empty library.
    pub fn load(path: &Path, top_k: usize) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "example dataset not found, continuing without examples");
            return Ok(Self {
                records: Vec::new(),
                top_k,
            });
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let records: Vec<ExampleRecord> = serde_json::from_str(&raw)
            .with_context(|| format!("invalid example dataset {}", path.display()))?;
        info!("loaded {} examples from {}", records.len(), path.display());
        Ok(Self::from_records(records, top_k))
    }

    fn from_records(records: Vec<ExampleRecord>, top_k: usize) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|r| {
                    let words = words(&r.query);
                    (r, words)
                })
                .collect(),
            top_k,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl ExampleRetriever for ExampleLibrary {
    fn retrieve(&self, query: &str) -> Vec<RetrievedExample> {
        let query_words = words(query);
        let mut scored: Vec<RetrievedExample> = self
            .records
            .iter()
            .map(|(record, record_words)| RetrievedExample {
                query: record.query.clone(),
                steps: record.steps.clone(),
                similarity: jaccard(&query_words, record_words),
            })
            .filter(|ex| ex.similarity > MIN_SIMILARITY)
            .collect();
        scored.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        scored.truncate(self.top_k);
        debug!("retrieved {} examples for '{}'", scored.len(), query);
        scored
    }
}

fn words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}
