//! Error types for the retrieval pipeline

use std::path::PathBuf;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, RagError>;

/// Every failure the pipeline can surface to a caller.
///
/// "No index yet" ([`RagError::IndexNotFound`]) is an error, while "index built but nothing
/// matched" is an empty retrieval result and never shows up here.
#[derive(Debug, thiserror::Error)]
pub enum RagError {
    /// Bad chunking parameters or other invalid settings
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// No usable text was found across a whole ingestion batch
    #[error("No usable text found across {documents} document(s)")]
    EmptyCorpus { documents: usize },

    /// A query arrived before any index was built
    #[error("No index has been built yet; index some documents first")]
    IndexNotFound,

    /// The persisted index was built with a different embedding model
    #[error("Persisted index at {path} is incompatible: {reason}")]
    IndexVersionMismatch { path: PathBuf, reason: String },

    /// A vector's length differs from the index dimension
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The embedding service failed or timed out
    #[error("Embedding service failed: {message}")]
    Embedding { message: String, transient: bool },

    /// The generation service failed or timed out
    #[error("Generation service failed: {0}")]
    Generation(String),

    /// No generation credential was supplied
    #[error("No generation credential supplied")]
    MissingCredential,

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Writing the index artifact failed
    #[error("Failed to persist index to {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A single document could not be read; recovered locally during ingestion
    #[error("Could not extract text from document {id}: {reason}")]
    Extraction { id: String, reason: String },
}

impl RagError {
    /// Embedding failure worth retrying (timeouts, transport errors, 429/5xx)
    pub fn transient_embedding<S: Into<String>>(message: S) -> Self {
        Self::Embedding {
            message: message.into(),
            transient: true,
        }
    }

    /// Embedding failure that will not improve on retry
    pub fn permanent_embedding<S: Into<String>>(message: S) -> Self {
        Self::Embedding {
            message: message.into(),
            transient: false,
        }
    }

    /// Whether the embedding retry loop should try again
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Embedding { transient: true, .. })
    }
}
