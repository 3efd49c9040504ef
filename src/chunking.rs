use crate::error::{RagError, Result};
use serde::{Deserialize, Serialize};
use std::env;

/// Default passage length in characters
pub const DEFAULT_CHUNK_SIZE: usize = 1000;
/// Default overlap between successive passages in characters
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

/// Separators tried, in order, when picking where a passage ends
const BREAK_PREFERENCES: [&str; 3] = ["\n\n", "\n", " "];

/// Represents a passage of a source document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Passage {
    /// The actual text content of this passage
    pub content: String,
    /// Identifier of the document this passage belongs to
    pub source_id: String,
    /// Position among the passages of the same document
    pub sequence_index: usize,
    /// Character offset of this passage in the original document
    pub start_char: usize,
}

/// Chunk sizing, validated on construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    chunk_size: usize,
    overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        ChunkingConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

impl ChunkingConfig {
    /// Create a configuration; `overlap` must be strictly smaller than `chunk_size`
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(RagError::Configuration(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if overlap >= chunk_size {
            return Err(RagError::Configuration(format!(
                "overlap ({}) must be smaller than chunk_size ({})",
                overlap, chunk_size
            )));
        }
        Ok(ChunkingConfig {
            chunk_size,
            overlap,
        })
    }

    /// Create a configuration from `RAG_CHUNK_SIZE` / `RAG_CHUNK_OVERLAP`, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let chunk_size = read_usize_var("RAG_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?;
        let overlap = read_usize_var("RAG_CHUNK_OVERLAP", DEFAULT_CHUNK_OVERLAP)?;
        Self::new(chunk_size, overlap)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }
}

fn read_usize_var(name: &str, default: usize) -> Result<usize> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| RagError::Configuration(format!("{} is not a number: {}", name, raw))),
        Err(_) => Ok(default),
    }
}

/// Split `text` into passages of at most `chunk_size` characters overlapping by `overlap`
pub fn split(text: &str, source_id: &str, chunk_size: usize, overlap: usize) -> Result<Vec<Passage>> {
    let config = ChunkingConfig::new(chunk_size, overlap)?;
    Ok(split_into_chunks(text, source_id, &config))
}

/// Split text into overlapping passages.
///
/// Each window ends at the last paragraph break, line break or space that still leaves it
/// longer than the overlap, or at exactly `chunk_size` characters when there is none. The
/// next passage starts `overlap` characters before the previous one ended, so dropping the
/// first `overlap` characters of every passage after the first rebuilds the input.
///
/// Long whitespace runs are tiled like any other text, so a passage may hold only
/// whitespace. Such passages are kept to preserve the exact rebuild.
pub fn split_into_chunks(text: &str, source_id: &str, config: &ChunkingConfig) -> Vec<Passage> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let byte_offsets: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let total = chars.len();

    let mut passages = Vec::new();
    let mut start = 0;

    loop {
        let hard_end = (start + config.chunk_size).min(total);
        let end = if hard_end == total {
            total
        } else {
            find_break(&chars, start + config.overlap + 1, hard_end)
        };

        passages.push(Passage {
            content: text[byte_offsets[start]..byte_offsets[end]].to_string(),
            source_id: source_id.to_string(),
            sequence_index: passages.len(),
            start_char: start,
        });

        if end == total {
            break;
        }
        start = end - config.overlap;
    }

    passages
}

/// Latest end position in `min_end..=hard_end` that follows a preferred separator
fn find_break(chars: &[char], min_end: usize, hard_end: usize) -> usize {
    for separator in BREAK_PREFERENCES {
        let sep: Vec<char> = separator.chars().collect();
        let candidate = (min_end.max(sep.len())..=hard_end)
            .rev()
            .find(|&end| chars[end - sep.len()..end] == sep[..]);
        if let Some(end) = candidate {
            return end;
        }
    }
    hard_end
}

/// Rebuild the source text from one document's passages
pub fn reassemble(passages: &[Passage], overlap: usize) -> String {
    let mut text = String::new();
    for (i, passage) in passages.iter().enumerate() {
        if i == 0 {
            text.push_str(&passage.content);
        } else {
            text.extend(passage.content.chars().skip(overlap));
        }
    }
    text
}
