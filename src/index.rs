//! Exact nearest-neighbor vector index and its on-disk snapshot.

use crate::cancel::CancelToken;
use crate::chunking::Passage;
use crate::embeddings::{BatchEmbedder, Embedding, EmbeddingModel};
use crate::error::{RagError, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Bumped whenever the persisted layout changes
pub const INDEX_FORMAT_VERSION: u32 = 1;

/// Default number of passages returned by a search
pub const DEFAULT_TOP_K: usize = 4;

/// A passage returned by a search, closest first
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPassage {
    pub passage: Passage,
    /// Distance under the index metric; smaller is closer
    pub distance: f32,
    /// Relevance derived from the distance; larger is better
    pub score: f32,
}

/// Ordered search hits, at most `k` long
pub type RetrievalResult = Vec<ScoredPassage>;

/// Passages and their vectors, in insertion order
#[derive(Debug, Clone)]
pub struct VectorIndex {
    model: EmbeddingModel,
    passages: Vec<Passage>,
    vectors: Vec<Embedding>,
}

impl VectorIndex {
    /// An index with no entries; every search on it comes back empty
    pub fn empty(model: EmbeddingModel) -> Self {
        VectorIndex {
            model,
            passages: Vec::new(),
            vectors: Vec::new(),
        }
    }

    /// Embed every passage and build a populated index
    pub async fn build(
        passages: Vec<Passage>,
        embedder: &BatchEmbedder,
        cancel: &CancelToken,
    ) -> Result<Self> {
        if passages.is_empty() {
            return Err(RagError::EmptyCorpus { documents: 0 });
        }

        let texts: Vec<String> = passages.iter().map(|p| p.content.clone()).collect();
        let vectors = embedder.embed_all(&texts, cancel).await?;

        Self::from_parts(embedder.model().clone(), passages, vectors)
    }

    /// Assemble an index from already-embedded passages
    pub fn from_parts(
        model: EmbeddingModel,
        passages: Vec<Passage>,
        vectors: Vec<Embedding>,
    ) -> Result<Self> {
        if passages.is_empty() {
            return Err(RagError::EmptyCorpus { documents: 0 });
        }
        if passages.len() != vectors.len() {
            return Err(RagError::permanent_embedding(format!(
                "{} passages but {} vectors",
                passages.len(),
                vectors.len()
            )));
        }
        if let Some(bad) = vectors.iter().find(|v| v.dimension() != model.dimension) {
            return Err(RagError::DimensionMismatch {
                expected: model.dimension,
                actual: bad.dimension(),
            });
        }
        if vectors.iter().any(|v| !v.is_finite()) {
            return Err(RagError::permanent_embedding(
                "index vectors must not contain NaN or infinite values".to_string(),
            ));
        }

        Ok(VectorIndex {
            model,
            passages,
            vectors,
        })
    }

    /// Return up to `k` passages nearest to `query`.
    ///
    /// Equal distances keep insertion order, so the first-indexed passage wins ties.
    pub fn search(&self, query: &Embedding, k: usize) -> Result<RetrievalResult> {
        if self.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if query.dimension() != self.model.dimension {
            return Err(RagError::DimensionMismatch {
                expected: self.model.dimension,
                actual: query.dimension(),
            });
        }

        let metric = self.model.metric;
        let mut ranked: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i, metric.distance(&query.values, &v.values)))
            .collect();

        // sort_by is stable, which gives the insertion-order tie-break
        ranked.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        ranked.truncate(k);

        Ok(ranked
            .into_iter()
            .map(|(i, distance)| ScoredPassage {
                passage: self.passages[i].clone(),
                distance,
                score: metric.relevance(distance),
            })
            .collect())
    }

    pub fn model(&self) -> &EmbeddingModel {
        &self.model
    }

    pub fn passages(&self) -> &[Passage] {
        &self.passages
    }

    /// Number of stored vectors (equal to the number of passages)
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Number of distinct source documents
    pub fn document_count(&self) -> usize {
        self.passages
            .iter()
            .map(|p| p.source_id.as_str())
            .collect::<HashSet<_>>()
            .len()
    }
}

/// Header of the persisted artifact, checked before the payload is trusted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexManifest {
    pub format_version: u32,
    pub model: EmbeddingModel,
    pub vector_count: usize,
    pub document_count: usize,
}

#[derive(Serialize, Deserialize)]
struct PersistedIndex {
    manifest: IndexManifest,
    passages: Vec<Passage>,
    vectors: Vec<Vec<f32>>,
}

impl From<&VectorIndex> for PersistedIndex {
    fn from(index: &VectorIndex) -> Self {
        PersistedIndex {
            manifest: IndexManifest {
                format_version: INDEX_FORMAT_VERSION,
                model: index.model.clone(),
                vector_count: index.len(),
                document_count: index.document_count(),
            },
            passages: index.passages.clone(),
            vectors: index.vectors.iter().map(|v| v.values.clone()).collect(),
        }
    }
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Single-file snapshot of an index on disk.
///
/// Writers are serialized and replace the file with a rename, so a reader opens either the
/// previous snapshot or the new one in full.
#[derive(Debug)]
pub struct IndexStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl IndexStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        IndexStore {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `index` to a temporary file next to the artifact, then rename it into place
    pub async fn persist(&self, index: &VectorIndex) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let bytes = serde_json::to_vec(&PersistedIndex::from(index)).map_err(|e| {
            self.persistence_error(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.persistence_error(e))?;
        }

        let temp_path = self.temp_path();
        if let Err(e) = write_synced(&temp_path, &bytes).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(self.persistence_error(e));
        }
        if let Err(e) = tokio::fs::rename(&temp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(self.persistence_error(e));
        }

        info!(
            "Persisted index with {} vectors to {}",
            index.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Load the snapshot if there is a usable one.
    ///
    /// A missing or unreadable file is `Ok(None)`. A readable snapshot built by a different
    /// embedding model or format version is an [`RagError::IndexVersionMismatch`].
    pub async fn load(&self, expected: &EmbeddingModel) -> Result<Option<VectorIndex>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No index at {}", self.path.display());
                return Ok(None);
            }
            Err(e) => {
                warn!("Could not read index at {}: {}", self.path.display(), e);
                return Ok(None);
            }
        };

        let persisted: PersistedIndex = match serde_json::from_slice(&bytes) {
            Ok(persisted) => persisted,
            Err(e) => {
                warn!("Ignoring corrupted index at {}: {}", self.path.display(), e);
                return Ok(None);
            }
        };

        let manifest = &persisted.manifest;
        if manifest.format_version != INDEX_FORMAT_VERSION {
            return Err(self.mismatch(format!(
                "format version {} (expected {})",
                manifest.format_version, INDEX_FORMAT_VERSION
            )));
        }
        if &manifest.model != expected {
            return Err(self.mismatch(format!(
                "built with {} ({} dims, {:?}), current model is {} ({} dims, {:?})",
                manifest.model.name,
                manifest.model.dimension,
                manifest.model.metric,
                expected.name,
                expected.dimension,
                expected.metric
            )));
        }

        let consistent = persisted.passages.len() == manifest.vector_count
            && persisted.vectors.len() == manifest.vector_count
            && persisted
                .vectors
                .iter()
                .all(|v| v.len() == manifest.model.dimension);
        if !consistent {
            warn!(
                "Ignoring corrupted index at {}: vector and passage counts disagree",
                self.path.display()
            );
            return Ok(None);
        }

        let PersistedIndex {
            manifest,
            passages,
            vectors,
        } = persisted;
        let vectors = vectors.into_iter().map(Embedding::new).collect();

        debug!(
            "Loaded index with {} vectors from {}",
            manifest.vector_count,
            self.path.display()
        );
        Ok(Some(VectorIndex {
            model: manifest.model,
            passages,
            vectors,
        }))
    }

    fn temp_path(&self) -> PathBuf {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "index".to_string());
        let unique = TEMP_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
        self.path.with_file_name(format!(
            ".{}.{}.{}.tmp",
            file_name,
            std::process::id(),
            unique
        ))
    }

    fn persistence_error(&self, source: std::io::Error) -> RagError {
        RagError::Persistence {
            path: self.path.clone(),
            source,
        }
    }

    fn mismatch(&self, reason: String) -> RagError {
        RagError::IndexVersionMismatch {
            path: self.path.clone(),
            reason,
        }
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}
