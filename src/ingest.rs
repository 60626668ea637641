//! Document ingestion: content directory → extraction → passages →
//! embeddings → similarity index.
//!
//! Files are visited in sorted path order. Each file is handled on its own:
//! a file that is unsupported, too large, empty or fails to embed is listed
//! in [`IngestReport::errors`] while the rest of the batch carries on. If such
//! a file was indexed before and its content has changed since, the old
//! version is removed. A file's passages are replaced in one
//! [`SimilarityIndex::replace_document`] call, so a re-ingest never leaves
//! stale passages behind.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::chunk::chunk_text;
use crate::config::Config;
use crate::embedding::{embed_batched, Embedder};
use crate::error::{BotError, BotResult};
use crate::extract::{extract_text, FileFormat};
use crate::index::{document_id_for, SimilarityIndex};
use crate::models::SourceDocument;

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub max_file_bytes: u64,
    /// Lowercased extensions without the dot.
    pub extensions: Vec<String>,
    pub max_tokens: usize,
    pub batch_size: usize,
    pub embed_timeout: Duration,
    /// Re-ingest files whose content hash is unchanged.
    pub force: bool,
    /// Remove indexed documents whose file is gone.
    pub prune: bool,
}

impl IngestOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_file_bytes: config.content.max_file_bytes,
            extensions: config
                .content
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            max_tokens: config.chunking.max_tokens,
            batch_size: config.embedding.batch_size,
            embed_timeout: Duration::from_secs(config.embedding.timeout_secs),
            force: false,
            prune: true,
        }
    }
}

/// A file that could not be ingested.
#[derive(Debug)]
pub struct FileError {
    pub path: String,
    pub error: BotError,
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.error)
    }
}

#[derive(Debug, Default)]
pub struct IngestReport {
    /// Documents (re)indexed in this run.
    pub documents: usize,
    /// Passages written in this run.
    pub passages: usize,
    /// Files skipped because their content hash was unchanged.
    pub unchanged: usize,
    /// Indexed documents removed because their file disappeared, or because
    /// the changed file could not be re-ingested.
    pub removed: usize,
    pub errors: Vec<FileError>,
}

enum FileOutcome {
    Indexed { passages: usize },
    Unchanged,
}

pub struct Ingestor {
    index: Arc<dyn SimilarityIndex>,
    embedder: Arc<dyn Embedder>,
    options: IngestOptions,
}

impl Ingestor {
    pub fn new(
        index: Arc<dyn SimilarityIndex>,
        embedder: Arc<dyn Embedder>,
        options: IngestOptions,
    ) -> Self {
        Self {
            index,
            embedder,
            options,
        }
    }

    pub fn options(&self) -> &IngestOptions {
        &self.options
    }

    /// Same index and embedder, re-ingesting files even when unchanged.
    pub fn forced(&self) -> Self {
        Self {
            index: self.index.clone(),
            embedder: self.embedder.clone(),
            options: IngestOptions {
                force: true,
                ..self.options.clone()
            },
        }
    }

    /// Ingest every file under `dir`. Only an unreadable directory or a
    /// failing index listing aborts the whole call.
    pub async fn ingest(&self, dir: &Path) -> BotResult<IngestReport> {
        let meta = tokio::fs::metadata(dir).await?;
        if !meta.is_dir() {
            return Err(BotError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a directory", dir.display()),
            )));
        }

        let mut report = IngestReport::default();
        let mut seen = BTreeSet::new();

        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e
                        .path()
                        .map(|p| relative_path(dir, p))
                        .unwrap_or_default();
                    warn!(path = %path, error = %e, "unreadable entry");
                    report.errors.push(FileError {
                        path,
                        error: BotError::Io(e.into()),
                    });
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let rel = relative_path(dir, entry.path());
            seen.insert(rel.clone());

            match self.ingest_file(entry.path(), &rel).await {
                Ok(FileOutcome::Indexed { passages }) => {
                    report.documents += 1;
                    report.passages += passages;
                }
                Ok(FileOutcome::Unchanged) => report.unchanged += 1,
                Err(error) => {
                    warn!(path = %rel, error = %error, "skipped file");
                    if self.drop_stale(entry.path(), &rel).await? {
                        debug!(path = %rel, "removed previous version of failed file");
                        report.removed += 1;
                    }
                    report.errors.push(FileError { path: rel, error });
                }
            }
        }

        if self.options.prune {
            for path in self.index.source_paths().await? {
                if !seen.contains(&path) && self.index.remove_document(&path).await? {
                    debug!(path = %path, "removed document for missing file");
                    report.removed += 1;
                }
            }
        }

        info!(
            dir = %dir.display(),
            documents = report.documents,
            passages = report.passages,
            unchanged = report.unchanged,
            removed = report.removed,
            errors = report.errors.len(),
            "ingest finished"
        );
        Ok(report)
    }

    async fn ingest_file(&self, path: &Path, rel: &str) -> BotResult<FileOutcome> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        let format = self
            .options
            .extensions
            .contains(&ext)
            .then(|| FileFormat::from_extension(&ext))
            .flatten()
            .ok_or_else(|| {
                BotError::UnsupportedFormat(if ext.is_empty() {
                    "(no extension)".to_string()
                } else {
                    format!(".{}", ext)
                })
            })?;

        let size = tokio::fs::metadata(path).await?.len();
        if size > self.options.max_file_bytes {
            return Err(BotError::FileTooLarge {
                size,
                limit: self.options.max_file_bytes,
            });
        }

        let bytes = tokio::fs::read(path).await?;
        let content_hash = content_hash(&bytes);
        if !self.options.force
            && self.index.content_hash(rel).await?.as_deref() == Some(content_hash.as_str())
        {
            debug!(path = %rel, "unchanged");
            return Ok(FileOutcome::Unchanged);
        }

        let text = if format.is_binary() {
            tokio::task::spawn_blocking(move || extract_text(&bytes, format))
                .await
                .map_err(|e| BotError::Extraction(format!("extraction task failed: {}", e)))??
        } else {
            extract_text(&bytes, format)?
        };
        if text.trim().is_empty() {
            return Err(BotError::Extraction("no text extracted".to_string()));
        }

        let doc = SourceDocument {
            id: document_id_for(rel),
            source_path: rel.to_string(),
            category: category_for(rel),
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            file_type: ext,
            content_hash,
            ingested_at: Utc::now().timestamp(),
        };

        let passages = chunk_text(&doc.id, &text, self.options.max_tokens);
        let texts: Vec<String> = passages.iter().map(|p| p.text.clone()).collect();
        let vectors = tokio::time::timeout(
            self.options.embed_timeout,
            embed_batched(self.embedder.as_ref(), &texts, self.options.batch_size),
        )
        .await
        .map_err(|_| BotError::Embedding("timed out".to_string()))?
        .map_err(|e| BotError::Embedding(e.to_string()))?;

        self.index.replace_document(&doc, &passages, &vectors).await?;
        debug!(path = %rel, passages = passages.len(), "indexed");
        Ok(FileOutcome::Indexed {
            passages: passages.len(),
        })
    }

    /// Remove the indexed version of `rel` unless the file on disk still
    /// hashes to it. An unreadable file counts as changed.
    async fn drop_stale(&self, path: &Path, rel: &str) -> BotResult<bool> {
        let Some(stored) = self.index.content_hash(rel).await? else {
            return Ok(false);
        };
        let current = tokio::fs::read(path).await.ok().map(|b| content_hash(&b));
        if current.as_deref() == Some(stored.as_str()) {
            return Ok(false);
        }
        self.index.remove_document(rel).await
    }
}

fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// `/`-separated path of `path` under `root`.
fn relative_path(root: &Path, path: &Path) -> String {
    let rel: PathBuf = path.strip_prefix(root).unwrap_or(path).to_path_buf();
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Name of the file's parent folder, or `general` at the root.
fn category_for(rel: &str) -> String {
    let mut parts: Vec<&str> = rel.split('/').collect();
    parts.pop();
    parts
        .pop()
        .filter(|p| !p.is_empty())
        .unwrap_or("general")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::index::InMemoryIndex;
    use tempfile::TempDir;

    fn options() -> IngestOptions {
        IngestOptions {
            max_file_bytes: 1024,
            extensions: vec!["txt".into(), "md".into(), "pdf".into(), "docx".into()],
            max_tokens: 50,
            batch_size: 8,
            embed_timeout: Duration::from_secs(5),
            force: false,
            prune: true,
        }
    }

    fn ingestor(index: Arc<InMemoryIndex>) -> Ingestor {
        Ingestor::new(index, Arc::new(HashEmbedder::new(64)), options())
    }

    #[test]
    fn test_category_for() {
        assert_eq!(category_for("notes.md"), "general");
        assert_eq!(category_for("biology/cells.md"), "biology");
        assert_eq!(category_for("sci/chem/acids.pdf"), "chem");
    }

    #[tokio::test]
    async fn test_ingest_skips_unchanged_and_prunes() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("bio")).unwrap();
        std::fs::write(tmp.path().join("bio/cells.md"), "# Cells\n\nCells divide.").unwrap();
        std::fs::write(tmp.path().join("intro.txt"), "Welcome to the course.").unwrap();

        let index = Arc::new(InMemoryIndex::new());
        let ingestor = ingestor(index.clone());

        let first = ingestor.ingest(tmp.path()).await.unwrap();
        assert_eq!(first.documents, 2);
        assert!(first.errors.is_empty());

        let second = ingestor.ingest(tmp.path()).await.unwrap();
        assert_eq!(second.documents, 0);
        assert_eq!(second.unchanged, 2);

        std::fs::remove_file(tmp.path().join("intro.txt")).unwrap();
        let third = ingestor.ingest(tmp.path()).await.unwrap();
        assert_eq!(third.removed, 1);
        assert_eq!(index.source_paths().await.unwrap(), vec!["bio/cells.md"]);
    }

    #[tokio::test]
    async fn test_bad_files_reported_without_aborting() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("ok.md"), "Photosynthesis makes sugar.").unwrap();
        std::fs::write(tmp.path().join("big.txt"), "x".repeat(4096)).unwrap();
        std::fs::write(tmp.path().join("image.png"), [0u8, 1, 2]).unwrap();
        std::fs::write(tmp.path().join("blank.txt"), "   \n\n ").unwrap();

        let index = Arc::new(InMemoryIndex::new());
        let report = ingestor(index.clone()).ingest(tmp.path()).await.unwrap();

        assert_eq!(report.documents, 1);
        let codes: Vec<_> = report
            .errors
            .iter()
            .map(|e| (e.path.as_str(), e.error.code()))
            .collect();
        assert_eq!(
            codes,
            vec![
                ("big.txt", "file_too_large"),
                ("blank.txt", "extraction_error"),
                ("image.png", "unsupported_format"),
            ]
        );
        assert_eq!(index.source_paths().await.unwrap(), vec!["ok.md"]);
    }

    #[tokio::test]
    async fn test_oversized_rewrite_drops_old_version() {
        let tmp = TempDir::new().unwrap();
        let notes = tmp.path().join("notes.md");
        std::fs::write(&notes, "Old version: the exam is on Monday.").unwrap();

        let index = Arc::new(InMemoryIndex::new());
        let ingestor = Ingestor::new(
            index.clone(),
            Arc::new(HashEmbedder::new(64)),
            IngestOptions {
                max_file_bytes: 200,
                ..options()
            },
        );
        ingestor.ingest(tmp.path()).await.unwrap();

        std::fs::write(&notes, "New version. ".repeat(26)).unwrap();
        let report = ingestor.ingest(tmp.path()).await.unwrap();
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].error.code(), "file_too_large");
        assert_eq!(report.removed, 1);

        let query = HashEmbedder::new(64).embed_one("when is the exam");
        assert!(index.nearest(&query, 5).await.unwrap().is_empty());
        assert!(index.source_paths().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_forced_failure_on_unchanged_file_keeps_it() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("notes.md"), "Exams are in June.").unwrap();

        let index = Arc::new(InMemoryIndex::new());
        ingestor(index.clone()).ingest(tmp.path()).await.unwrap();

        // Same bytes, but a lower size limit makes the forced re-ingest fail.
        let strict = Ingestor::new(
            index.clone(),
            Arc::new(HashEmbedder::new(64)),
            IngestOptions {
                max_file_bytes: 4,
                force: true,
                ..options()
            },
        );
        let report = strict.ingest(tmp.path()).await.unwrap();
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.removed, 0);
        assert_eq!(index.source_paths().await.unwrap(), vec!["notes.md"]);
    }

    #[tokio::test]
    async fn test_missing_directory_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let index = Arc::new(InMemoryIndex::new());
        let err = ingestor(index)
            .ingest(&tmp.path().join("absent"))
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::Io(_)));
    }
}
