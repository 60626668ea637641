//! SQLite-backed [`SimilarityIndex`].

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::BotResult;
use crate::models::{Passage, ScoredPassage, SourceDocument};

use super::{check_vector_count, rank, IndexStats, SimilarityIndex};

/// Wraps a [`SqlitePool`]; the schema comes from [`crate::migrate`].
pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SimilarityIndex for SqliteIndex {
    async fn replace_document(
        &self,
        doc: &SourceDocument,
        passages: &[Passage],
        vectors: &[Vec<f32>],
    ) -> BotResult<()> {
        check_vector_count(passages, vectors)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, source_path, category, file_name, file_type,
                                   content_hash, ingested_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_path) DO UPDATE SET
                category = excluded.category,
                file_name = excluded.file_name,
                file_type = excluded.file_type,
                content_hash = excluded.content_hash,
                ingested_at = excluded.ingested_at
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.source_path)
        .bind(&doc.category)
        .bind(&doc.file_name)
        .bind(&doc.file_type)
        .bind(&doc.content_hash)
        .bind(doc.ingested_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM passage_vectors WHERE document_id = ?")
            .bind(&doc.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM passages WHERE document_id = ?")
            .bind(&doc.id)
            .execute(&mut *tx)
            .await?;

        for (passage, vector) in passages.iter().zip(vectors) {
            sqlx::query(
                "INSERT INTO passages (id, document_id, chunk_index, text, hash, section) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&passage.id)
            .bind(&doc.id)
            .bind(passage.chunk_index)
            .bind(&passage.text)
            .bind(&passage.hash)
            .bind(&passage.section)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO passage_vectors (passage_id, document_id, dims, embedding) VALUES (?, ?, ?, ?)",
            )
            .bind(&passage.id)
            .bind(&doc.id)
            .bind(vector.len() as i64)
            .bind(vec_to_blob(vector))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(
            source_path = %doc.source_path,
            passages = passages.len(),
            "replaced document passages"
        );
        Ok(())
    }

    async fn remove_document(&self, source_path: &str) -> BotResult<bool> {
        let mut tx = self.pool.begin().await?;

        let id: Option<String> =
            sqlx::query_scalar("SELECT id FROM documents WHERE source_path = ?")
                .bind(source_path)
                .fetch_optional(&mut *tx)
                .await?;

        let Some(id) = id else {
            return Ok(false);
        };

        sqlx::query("DELETE FROM passage_vectors WHERE document_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM passages WHERE document_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn content_hash(&self, source_path: &str) -> BotResult<Option<String>> {
        let hash = sqlx::query_scalar("SELECT content_hash FROM documents WHERE source_path = ?")
            .bind(source_path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(hash)
    }

    async fn source_paths(&self) -> BotResult<Vec<String>> {
        let paths = sqlx::query_scalar("SELECT source_path FROM documents ORDER BY source_path")
            .fetch_all(&self.pool)
            .await?;
        Ok(paths)
    }

    async fn nearest(&self, query: &[f32], k: usize) -> BotResult<Vec<ScoredPassage>> {
        let rows = sqlx::query(
            r#"
            SELECT pv.passage_id, pv.embedding, p.chunk_index, p.text, p.section,
                   d.source_path, d.category, d.file_name
            FROM passage_vectors pv
            JOIN passages p ON p.id = pv.passage_id
            JOIN documents d ON d.id = p.document_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let candidates = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                ScoredPassage {
                    passage_id: row.get("passage_id"),
                    source_path: row.get("source_path"),
                    category: row.get("category"),
                    file_name: row.get("file_name"),
                    chunk_index: row.get("chunk_index"),
                    text: row.get("text"),
                    section: row.get("section"),
                    score: cosine_similarity(query, &blob_to_vec(&blob)),
                }
            })
            .collect();

        Ok(rank(candidates, k))
    }

    async fn stats(&self) -> BotResult<IndexStats> {
        let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        let passages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM passages")
            .fetch_one(&self.pool)
            .await?;
        let categories = sqlx::query(
            "SELECT category, COUNT(*) AS n FROM documents GROUP BY category ORDER BY category",
        )
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| {
            let n: i64 = row.get("n");
            (row.get::<String, _>("category"), n as usize)
        })
        .collect();

        Ok(IndexStats {
            documents: documents as usize,
            passages: passages as usize,
            categories,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::document_id_for;
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn index() -> (TempDir, SqliteIndex) {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("idx.sqlite"))
            .await
            .unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        (tmp, SqliteIndex::new(pool))
    }

    fn doc(path: &str, hash: &str) -> SourceDocument {
        SourceDocument {
            id: document_id_for(path),
            source_path: path.to_string(),
            category: "physics".to_string(),
            file_name: path.rsplit('/').next().unwrap().to_string(),
            file_type: "md".to_string(),
            content_hash: hash.to_string(),
            ingested_at: 0,
        }
    }

    fn passage(doc: &SourceDocument, idx: i64, text: &str) -> Passage {
        Passage {
            id: format!("{}-{}-{}", doc.id, idx, text.len()),
            document_id: doc.id.clone(),
            chunk_index: idx,
            text: text.to_string(),
            hash: crate::chunk::hash_text(text),
            section: None,
        }
    }

    #[tokio::test]
    async fn test_replace_removes_previous_passages() {
        let (_tmp, index) = index().await;
        let d = doc("physics/waves.md", "h1");
        index
            .replace_document(
                &d,
                &[passage(&d, 0, "old one"), passage(&d, 1, "old two")],
                &[vec![1.0, 0.0], vec![0.0, 1.0]],
            )
            .await
            .unwrap();
        index
            .replace_document(&d, &[passage(&d, 0, "new")], &[vec![1.0, 0.0]])
            .await
            .unwrap();

        let hits = index.nearest(&[1.0, 1.0], 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "new");
        assert_eq!(index.content_hash("physics/waves.md").await.unwrap().as_deref(), Some("h1"));

        let stats = index.stats().await.unwrap();
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.passages, 1);
        assert_eq!(stats.categories, vec![("physics".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_mismatched_vectors_leave_index_untouched() {
        let (_tmp, index) = index().await;
        let d = doc("a.md", "h");
        let err = index
            .replace_document(&d, &[passage(&d, 0, "x")], &[])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "storage_error");
        assert!(index.source_paths().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_document() {
        let (_tmp, index) = index().await;
        let d = doc("a.md", "h");
        index
            .replace_document(&d, &[passage(&d, 0, "x")], &[vec![1.0]])
            .await
            .unwrap();
        assert!(index.remove_document("a.md").await.unwrap());
        assert!(!index.remove_document("a.md").await.unwrap());
        assert!(index.nearest(&[1.0], 3).await.unwrap().is_empty());
    }
}
