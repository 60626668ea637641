//! Similarity index over passage embeddings.
//!
//! The [`SimilarityIndex`] trait is what the ingestor writes to and the Q&A
//! pipeline reads from. Two backends:
//!
//! - [`SqliteIndex`]: the persisted vector store (`documents`, `passages`,
//!   `passage_vectors`).
//! - [`InMemoryIndex`]: a lock-guarded map, for tests and throwaway runs.
//!
//! Both score by brute-force cosine similarity and rank with [`rank`], so
//! equal scores order the same way everywhere.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::BotResult;
use crate::models::{Passage, ScoredPassage, SourceDocument};

pub use memory::InMemoryIndex;
pub use sqlite::SqliteIndex;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexStats {
    pub documents: usize,
    pub passages: usize,
    /// `(category, document count)`, sorted by category.
    pub categories: Vec<(String, usize)>,
}

#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    /// Insert or update `doc` and replace all of its passages and vectors in
    /// one atomic step. `vectors[i]` belongs to `passages[i]`.
    async fn replace_document(
        &self,
        doc: &SourceDocument,
        passages: &[Passage],
        vectors: &[Vec<f32>],
    ) -> BotResult<()>;

    /// Remove a document and everything derived from it. Returns whether it existed.
    async fn remove_document(&self, source_path: &str) -> BotResult<bool>;

    /// Content hash recorded at the last ingest of `source_path`.
    async fn content_hash(&self, source_path: &str) -> BotResult<Option<String>>;

    /// Every indexed source path, sorted.
    async fn source_paths(&self) -> BotResult<Vec<String>>;

    /// Top-`k` passages by cosine similarity to `query`, ranked with [`rank`].
    async fn nearest(&self, query: &[f32], k: usize) -> BotResult<Vec<ScoredPassage>>;

    async fn stats(&self) -> BotResult<IndexStats>;
}

/// Sort by score descending, then source path, then chunk index, and keep `k`.
pub fn rank(mut candidates: Vec<ScoredPassage>, k: usize) -> Vec<ScoredPassage> {
    candidates.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.source_path.cmp(&b.source_path))
            .then_with(|| a.chunk_index.cmp(&b.chunk_index))
    });
    candidates.truncate(k);
    candidates
}

/// Stable document id for a source path, so re-ingesting a path reuses its id.
pub fn document_id_for(source_path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_path.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..32].to_string()
}

pub(crate) fn check_vector_count(passages: &[Passage], vectors: &[Vec<f32>]) -> BotResult<()> {
    if passages.len() != vectors.len() {
        return Err(crate::error::BotError::Storage(format!(
            "{} passages but {} vectors",
            passages.len(),
            vectors.len()
        )));
    }
    Ok(())
}
