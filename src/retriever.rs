use crate::cancel::CancelToken;
use crate::chunking::{split_into_chunks, ChunkingConfig};
use crate::document::RawDocument;
use crate::embeddings::{BatchEmbedder, EmbeddingModel};
use crate::error::{RagError, Result};
use crate::index::{IndexStore, RetrievalResult, VectorIndex};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Size of the index currently served
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IndexStats {
    /// Number of passage vectors in the index
    pub document_vector_count: usize,
    /// Number of distinct source documents
    pub document_count: usize,
    /// Embedding model of the index, if one exists
    pub model: Option<EmbeddingModel>,
}

impl IndexStats {
    pub fn of(index: Option<&VectorIndex>) -> Self {
        match index {
            Some(index) => IndexStats {
                document_vector_count: index.len(),
                document_count: index.document_count(),
                model: Some(index.model().clone()),
            },
            None => IndexStats::default(),
        }
    }

    /// Read the stats of the snapshot at `store` without an embedder or credential
    pub async fn load(store: &IndexStore, model: &EmbeddingModel) -> Result<Self> {
        Ok(Self::of(store.load(model).await?.as_ref()))
    }
}

/// Builds the index from documents and answers nearest-passage queries against it.
///
/// The retriever owns the live index handle. It is loaded from the store on first use and
/// replaced after every successful build; queries keep the snapshot they started with.
pub struct Retriever {
    embedder: BatchEmbedder,
    store: IndexStore,
    live: RwLock<Option<Arc<VectorIndex>>>,
    build_lock: Mutex<()>,
}

impl Retriever {
    pub fn new(embedder: BatchEmbedder, store: IndexStore) -> Self {
        Retriever {
            embedder,
            store,
            live: RwLock::new(None),
            build_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    /// Chunk, embed, build and persist an index over `documents`.
    ///
    /// Documents whose text cannot be extracted are logged and skipped. The build fails with
    /// [`RagError::EmptyCorpus`] only when no document yields a passage, and with
    /// [`RagError::Configuration`] when two documents share an id.
    pub async fn index_documents(
        &self,
        documents: &[RawDocument],
        chunking: &ChunkingConfig,
        cancel: &CancelToken,
    ) -> Result<Arc<VectorIndex>> {
        let mut seen = HashSet::new();
        if let Some(duplicate) = documents.iter().find(|d| !seen.insert(d.id.as_str())) {
            return Err(RagError::Configuration(format!(
                "document id {} is used more than once",
                duplicate.id
            )));
        }

        let mut passages = Vec::new();

        for document in documents {
            if cancel.is_cancelled() {
                return Err(RagError::Cancelled);
            }

            let text = match document.extract_text() {
                Ok(text) => text,
                Err(e) => {
                    warn!("Skipping document: {}", e);
                    continue;
                }
            };

            let document_passages = split_into_chunks(&text, &document.id, chunking);
            if document_passages.is_empty() {
                warn!("Skipping document {}: no text content", document.id);
                continue;
            }

            debug!(
                "Split {} into {} passages",
                document.id,
                document_passages.len()
            );
            passages.extend(document_passages);
        }

        if passages.is_empty() {
            return Err(RagError::EmptyCorpus {
                documents: documents.len(),
            });
        }

        info!(
            "Embedding {} passages from {} documents",
            passages.len(),
            documents.len()
        );
        let index = Arc::new(VectorIndex::build(passages, &self.embedder, cancel).await?);

        // Persist and publish together so the live handle always matches the file on disk
        let _guard = self.build_lock.lock().await;
        self.store.persist(&index).await?;
        *self.live.write().await = Some(index.clone());

        info!(
            "Indexed {} passages from {} documents",
            index.len(),
            index.document_count()
        );
        Ok(index)
    }

    /// Return the `k` passages nearest to `query`.
    ///
    /// Fails with [`RagError::IndexNotFound`] if no index has been built; an index with no
    /// close passages gives an empty result instead.
    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
        cancel: &CancelToken,
    ) -> Result<RetrievalResult> {
        let index = self.current_index().await?.ok_or(RagError::IndexNotFound)?;
        let query_vector = self.embedder.embed_query(query, cancel).await?;
        let hits = index.search(&query_vector, k)?;
        debug!("Retrieved {} passages for query", hits.len());
        Ok(hits)
    }

    /// The served index, loading the persisted snapshot on first use
    pub async fn current_index(&self) -> Result<Option<Arc<VectorIndex>>> {
        if let Some(index) = self.live.read().await.as_ref() {
            return Ok(Some(index.clone()));
        }

        let mut live = self.live.write().await;
        if let Some(index) = live.as_ref() {
            return Ok(Some(index.clone()));
        }

        let loaded = self.store.load(self.embedder.model()).await?.map(Arc::new);
        if let Some(index) = &loaded {
            info!(
                "Loaded index with {} vectors from {}",
                index.len(),
                self.store.path().display()
            );
        }
        *live = loaded.clone();
        Ok(loaded)
    }

    pub async fn has_index(&self) -> Result<bool> {
        Ok(self.current_index().await?.is_some())
    }

    pub async fn stats(&self) -> Result<IndexStats> {
        Ok(IndexStats::of(self.current_index().await?.as_deref()))
    }
}
