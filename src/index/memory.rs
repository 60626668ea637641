//! In-memory [`SimilarityIndex`] for tests and throwaway runs.
//!
//! Documents live in a `BTreeMap` keyed by source path behind a
//! `std::sync::RwLock`; a replace swaps the whole entry under the write lock.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::BotResult;
use crate::models::{Passage, ScoredPassage, SourceDocument};

use super::{check_vector_count, rank, IndexStats, SimilarityIndex};

struct StoredDocument {
    doc: SourceDocument,
    passages: Vec<(Passage, Vec<f32>)>,
}

#[derive(Default)]
pub struct InMemoryIndex {
    docs: RwLock<BTreeMap<String, StoredDocument>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SimilarityIndex for InMemoryIndex {
    async fn replace_document(
        &self,
        doc: &SourceDocument,
        passages: &[Passage],
        vectors: &[Vec<f32>],
    ) -> BotResult<()> {
        check_vector_count(passages, vectors)?;
        let stored = StoredDocument {
            doc: doc.clone(),
            passages: passages.iter().cloned().zip(vectors.iter().cloned()).collect(),
        };
        self.docs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(doc.source_path.clone(), stored);
        Ok(())
    }

    async fn remove_document(&self, source_path: &str) -> BotResult<bool> {
        Ok(self
            .docs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(source_path)
            .is_some())
    }

    async fn content_hash(&self, source_path: &str) -> BotResult<Option<String>> {
        Ok(self
            .docs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(source_path)
            .map(|s| s.doc.content_hash.clone()))
    }

    async fn source_paths(&self) -> BotResult<Vec<String>> {
        Ok(self
            .docs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect())
    }

    async fn nearest(&self, query: &[f32], k: usize) -> BotResult<Vec<ScoredPassage>> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        let candidates = docs
            .values()
            .flat_map(|stored| {
                stored.passages.iter().map(move |(p, v)| ScoredPassage {
                    passage_id: p.id.clone(),
                    source_path: stored.doc.source_path.clone(),
                    category: stored.doc.category.clone(),
                    file_name: stored.doc.file_name.clone(),
                    chunk_index: p.chunk_index,
                    text: p.text.clone(),
                    section: p.section.clone(),
                    score: cosine_similarity(query, v),
                })
            })
            .collect();
        Ok(rank(candidates, k))
    }

    async fn stats(&self) -> BotResult<IndexStats> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        let mut categories: BTreeMap<String, usize> = BTreeMap::new();
        for stored in docs.values() {
            *categories.entry(stored.doc.category.clone()).or_insert(0) += 1;
        }
        Ok(IndexStats {
            documents: docs.len(),
            passages: docs.values().map(|s| s.passages.len()).sum(),
            categories: categories.into_iter().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::document_id_for;

    #[tokio::test]
    async fn test_nearest_orders_by_similarity() {
        let index = InMemoryIndex::new();
        for (path, vec) in [("a.md", vec![1.0, 0.0]), ("b.md", vec![0.0, 1.0])] {
            let doc = SourceDocument {
                id: document_id_for(path),
                source_path: path.to_string(),
                category: "general".to_string(),
                file_name: path.to_string(),
                file_type: "md".to_string(),
                content_hash: "h".to_string(),
                ingested_at: 0,
            };
            let passage = Passage {
                id: path.to_string(),
                document_id: doc.id.clone(),
                chunk_index: 0,
                text: path.to_string(),
                hash: "h".to_string(),
                section: None,
            };
            index
                .replace_document(&doc, &[passage], &[vec])
                .await
                .unwrap();
        }

        let hits = index.nearest(&[0.1, 0.9], 2).await.unwrap();
        assert_eq!(hits[0].source_path, "b.md");
        assert_eq!(hits[1].source_path, "a.md");
        assert_eq!(index.stats().await.unwrap().documents, 2);
    }
}
