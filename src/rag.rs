use crate::cancel::CancelToken;
use crate::chunking::{ChunkingConfig, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
use crate::context::ContextBuilder;
use crate::document::RawDocument;
use crate::embeddings::{BatchEmbedder, Embedder, EmbeddingOptions};
use crate::error::{RagError, Result};
use crate::gemini::{GeminiConfig, GeminiEmbedder};
use crate::index::{IndexStore, DEFAULT_TOP_K};
use crate::retriever::{IndexStats, Retriever};
use crate::synthesizer::{Answer, AnswerSynthesizer, GeneratorFactory, SynthesizerOptions};
use log::info;
use std::collections::hash_map::DefaultHasher;
use std::env;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

const DEFAULT_INDEX_PATH: &str = "./vector_store/index.json";

/// Engine-wide settings
#[derive(Debug, Clone)]
pub struct RagConfig {
    /// Location of the persisted index file
    pub index_path: PathBuf,
    /// Passages retrieved per question
    pub top_k: usize,
    pub embedding: EmbeddingOptions,
    pub synthesis: SynthesizerOptions,
}

impl Default for RagConfig {
    fn default() -> Self {
        RagConfig {
            index_path: PathBuf::from(DEFAULT_INDEX_PATH),
            top_k: DEFAULT_TOP_K,
            embedding: EmbeddingOptions::default(),
            synthesis: SynthesizerOptions::default(),
        }
    }
}

impl RagConfig {
    /// Create a new configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = RagConfig::default();

        let index_path = env::var("RAG_INDEX_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.index_path);
        let top_k = match env::var("RAG_TOP_K") {
            Ok(raw) => raw
                .trim()
                .parse()
                .map_err(|_| RagError::Configuration(format!("RAG_TOP_K is not a number: {}", raw)))?,
            Err(_) => defaults.top_k,
        };
        let synthesis = SynthesizerOptions {
            context: ContextBuilder::from_env()?,
            ..defaults.synthesis
        };

        Ok(RagConfig {
            index_path,
            top_k,
            embedding: defaults.embedding,
            synthesis,
        })
    }
}

/// Outcome of an ingestion run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSummary {
    /// Passages in the new index
    pub chunk_count: usize,
    /// Documents that contributed at least one passage
    pub document_count: usize,
}

struct CachedSynthesizer {
    fingerprint: u64,
    synthesizer: Arc<AnswerSynthesizer>,
}

/// RAG (Retrieval-Augmented Generation) engine
pub struct RagEngine {
    retriever: Retriever,
    generators: Arc<dyn GeneratorFactory>,
    synthesis: SynthesizerOptions,
    synthesizer: Mutex<Option<CachedSynthesizer>>,
}

impl RagEngine {
    /// Create a new RAG engine
    pub fn new(
        retriever: Retriever,
        generators: Arc<dyn GeneratorFactory>,
        synthesis: SynthesizerOptions,
    ) -> Self {
        RagEngine {
            retriever,
            generators,
            synthesis,
            synthesizer: Mutex::new(None),
        }
    }

    /// Wire an engine from an embedder and configuration
    pub fn with_embedder(
        embedder: Arc<dyn Embedder>,
        generators: Arc<dyn GeneratorFactory>,
        config: RagConfig,
    ) -> Self {
        let retriever = Retriever::new(
            BatchEmbedder::new(embedder, config.embedding),
            IndexStore::new(config.index_path),
        );
        Self::new(retriever, generators, config.synthesis)
    }

    /// Wire an engine backed by Gemini for both embeddings and generation
    pub fn gemini(gemini: GeminiConfig, config: RagConfig) -> Result<Self> {
        let mut config = config;
        config.embedding.timeout = gemini.request_timeout;
        config.synthesis.timeout = gemini.request_timeout;

        let embedder = Arc::new(GeminiEmbedder::new(gemini.clone())?);
        Ok(Self::with_embedder(embedder, Arc::new(gemini), config))
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    /// Chunk, embed and index `documents`, replacing any previous index
    pub async fn index_documents(
        &self,
        documents: &[RawDocument],
        chunk_size: usize,
        overlap: usize,
        cancel: &CancelToken,
    ) -> Result<IndexSummary> {
        let chunking = ChunkingConfig::new(chunk_size, overlap)?;
        let index = self
            .retriever
            .index_documents(documents, &chunking, cancel)
            .await?;

        Ok(IndexSummary {
            chunk_count: index.len(),
            document_count: index.document_count(),
        })
    }

    /// [`RagEngine::index_documents`] with the default chunk size and overlap
    pub async fn index_documents_default(
        &self,
        documents: &[RawDocument],
        cancel: &CancelToken,
    ) -> Result<IndexSummary> {
        self.index_documents(documents, DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_OVERLAP, cancel)
            .await
    }

    /// Retrieve the `k` most relevant passages and answer `query` from them.
    ///
    /// Checks run in order: an index must exist, then a credential must be supplied. The
    /// credential is only used to reach the generation service and is never stored on disk
    /// or logged.
    pub async fn retrieve_and_answer(
        &self,
        query: &str,
        k: usize,
        credential: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<Answer> {
        if !self.retriever.has_index().await? {
            return Err(RagError::IndexNotFound);
        }

        let credential = credential
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or(RagError::MissingCredential)?;

        let synthesizer = self.synthesizer_for(credential, cancel).await?;
        let hits = self.retriever.retrieve(query, k, cancel).await?;
        synthesizer.synthesize(query, &hits, cancel).await
    }

    pub async fn get_index_stats(&self) -> Result<IndexStats> {
        self.retriever.stats().await
    }

    /// Forget the cached synthesizer so the next question probes the service again
    pub async fn reset_synthesizer(&self) {
        *self.synthesizer.lock().await = None;
    }

    /// The synthesizer for `credential`, probing the service when the cache misses.
    ///
    /// The probe runs without holding the cache lock, so a slow probe never blocks questions
    /// that already have a synthesizer. Two first questions racing on a new key may both
    /// probe; the last one to finish is cached.
    async fn synthesizer_for(
        &self,
        credential: &str,
        cancel: &CancelToken,
    ) -> Result<Arc<AnswerSynthesizer>> {
        let fingerprint = fingerprint(credential);

        if let Some(entry) = self
            .synthesizer
            .lock()
            .await
            .as_ref()
            .filter(|c| c.fingerprint == fingerprint)
        {
            return Ok(entry.synthesizer.clone());
        }

        info!("Initializing answer synthesizer");
        let generator = self.generators.connect(credential)?;
        let synthesizer = Arc::new(
            AnswerSynthesizer::initialize(Some(generator), self.synthesis.clone(), cancel).await?,
        );

        *self.synthesizer.lock().await = Some(CachedSynthesizer {
            fingerprint,
            synthesizer: synthesizer.clone(),
        });
        Ok(synthesizer)
    }
}

fn fingerprint(credential: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    credential.hash(&mut hasher);
    hasher.finish()
}
