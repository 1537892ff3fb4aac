//! In-memory feature bank: labelled embeddings and nearest-match queries.
//!
//! The bank is a multi-map: one label may own many embeddings (several
//! reference photos per identity). Queries scan every entry under a read
//! lock, so they always see a consistent snapshot while `put` calls from
//! other threads wait for the write lock.

use crate::types::Embedding;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

/// Default cosine similarity a best match must reach to count as a match.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.40;

#[derive(Error, Debug, PartialEq)]
pub enum StoreError {
    #[error("expected {expected}-dim embedding, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding contains non-finite values")]
    NonFinite,
    #[error("feature bank dimension must be non-zero")]
    ZeroDimension,
}

/// Scores a probe against one stored embedding. Higher = more similar.
pub trait Matcher: Send + Sync {
    fn score(&self, probe: &Embedding, reference: &Embedding) -> f32;
}

/// Cosine similarity in [-1, 1]; insensitive to embedding magnitude.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn score(&self, probe: &Embedding, reference: &Embedding) -> f32 {
        probe.similarity(reference)
    }
}

/// Negative Euclidean distance; thresholds are then negative distances.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn score(&self, probe: &Embedding, reference: &Embedding) -> f32 {
        -probe.euclidean_distance(reference)
    }
}

/// Best stored entry for a probe.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub label: String,
    /// Matcher score of this entry against the probe.
    pub similarity: f32,
    /// Insertion position of the entry.
    pub index: usize,
}

struct Entry {
    label: String,
    embedding: Embedding,
}

/// Thread-safe label → embedding multi-map.
pub struct FeatureBank {
    dimension: usize,
    threshold: f32,
    matcher: Box<dyn Matcher>,
    entries: RwLock<Vec<Entry>>,
}

impl FeatureBank {
    /// Empty bank for `dimension`-long embeddings, cosine matching and the
    /// default threshold.
    pub fn new(dimension: usize) -> Result<Self, StoreError> {
        if dimension == 0 {
            return Err(StoreError::ZeroDimension);
        }
        Ok(Self {
            dimension,
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
            matcher: Box::new(CosineMatcher),
            entries: RwLock::new(Vec::new()),
        })
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_matcher(mut self, matcher: impl Matcher + 'static) -> Self {
        self.matcher = Box::new(matcher);
        self
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Distinct labels in first-insertion order.
    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = Vec::new();
        for entry in self.read().iter() {
            if !labels.contains(&entry.label) {
                labels.push(entry.label.clone());
            }
        }
        labels
    }

    /// Append `embedding` under `label`. Duplicate labels and vectors are kept.
    pub fn put(&self, label: impl Into<String>, embedding: Embedding) -> Result<(), StoreError> {
        self.check(&embedding)?;
        let label = label.into();
        let mut entries = self.write();
        entries.push(Entry { label, embedding });
        tracing::debug!(entries = entries.len(), "feature bank entry added");
        Ok(())
    }

    /// Append every embedding under `label`, or none of them if any one is
    /// rejected. Returns how many were stored.
    pub fn put_all(
        &self,
        label: impl Into<String>,
        embeddings: Vec<Embedding>,
    ) -> Result<usize, StoreError> {
        for embedding in &embeddings {
            self.check(embedding)?;
        }
        let label = label.into();
        let added = embeddings.len();

        let mut entries = self.write();
        entries.extend(embeddings.into_iter().map(|embedding| Entry {
            label: label.clone(),
            embedding,
        }));
        tracing::debug!(entries = entries.len(), added, "feature bank entries added");
        Ok(added)
    }

    /// Best-scoring entry for `probe`, or `None` when the bank is empty or the
    /// best score is below the threshold. Ties go to the earliest entry.
    pub fn get_similar(&self, probe: &Embedding) -> Result<Option<Match>, StoreError> {
        self.check(probe)?;
        let entries = self.read();

        let mut best_score = f32::NEG_INFINITY;
        let mut best_idx: Option<usize> = None;

        // Always iterate every entry, no early exit.
        for (i, entry) in entries.iter().enumerate() {
            let score = self.matcher.score(probe, &entry.embedding);
            if score > best_score {
                best_score = score;
                best_idx = Some(i);
            }
        }

        Ok(match best_idx {
            Some(idx) if best_score >= self.threshold => {
                tracing::debug!(label = %entries[idx].label, similarity = best_score, "match found");
                Some(Match {
                    label: entries[idx].label.clone(),
                    similarity: best_score,
                    index: idx,
                })
            }
            _ => {
                tracing::debug!(
                    best = if best_idx.is_some() { best_score } else { 0.0 },
                    threshold = self.threshold,
                    "no match"
                );
                None
            }
        })
    }

    /// The `k` highest-scoring entries regardless of the threshold, best
    /// first; equal scores keep insertion order.
    pub fn top_k(&self, probe: &Embedding, k: usize) -> Result<Vec<Match>, StoreError> {
        self.check(probe)?;
        let entries = self.read();

        let mut scored: Vec<Match> = entries
            .iter()
            .enumerate()
            .map(|(index, entry)| Match {
                label: entry.label.clone(),
                similarity: self.matcher.score(probe, &entry.embedding),
                index,
            })
            .collect();
        scored.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        scored.truncate(k);
        Ok(scored)
    }

    fn check(&self, embedding: &Embedding) -> Result<(), StoreError> {
        if embedding.dimension() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimension,
                actual: embedding.dimension(),
            });
        }
        if !embedding.values.iter().all(|v| v.is_finite()) {
            return Err(StoreError::NonFinite);
        }
        Ok(())
    }

    // A panicking writer can only die before or after the push, so the
    // vector is never half-written; recover from poisoning.
    fn read(&self) -> RwLockReadGuard<'_, Vec<Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}
