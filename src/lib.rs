pub mod cancel;
pub mod chunking;
pub mod context;
pub mod document;
pub mod embeddings;
pub mod error;
pub mod gemini;
pub mod index;
pub mod rag;
pub mod retriever;
pub mod synthesizer;

pub use error::{RagError, Result};
