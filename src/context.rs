use crate::error::{RagError, Result};
use crate::index::ScoredPassage;
use std::env;

/// Default character budget for the context block of a prompt
pub const DEFAULT_MAX_CONTEXT_CHARS: usize = 12_000;

const PASSAGE_SEPARATOR: &str = "\n\n";

/// Retrieved passages joined into one bounded block of text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextWindow {
    /// Passage contents in retrieval order, separated by blank lines
    pub text: String,
    /// How many retrieved passages contributed (fully or partly) to `text`
    pub passages_used: usize,
    /// Whether anything was cut to fit the budget
    pub truncated: bool,
}

/// Joins retrieved passages under a character budget.
///
/// Truncation works from the end: trailing passages are dropped first, and the first
/// passage is cut at a character boundary only if it alone exceeds the budget.
#[derive(Debug, Clone, Copy)]
pub struct ContextBuilder {
    max_chars: usize,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        ContextBuilder {
            max_chars: DEFAULT_MAX_CONTEXT_CHARS,
        }
    }
}

impl ContextBuilder {
    pub fn new(max_chars: usize) -> Result<Self> {
        if max_chars == 0 {
            return Err(RagError::Configuration(
                "context budget must be greater than zero".to_string(),
            ));
        }
        Ok(ContextBuilder { max_chars })
    }

    /// Create a builder from `RAG_MAX_CONTEXT_CHARS`, falling back to the default
    pub fn from_env() -> Result<Self> {
        match env::var("RAG_MAX_CONTEXT_CHARS") {
            Ok(raw) => {
                let max_chars = raw.trim().parse().map_err(|_| {
                    RagError::Configuration(format!("RAG_MAX_CONTEXT_CHARS is not a number: {}", raw))
                })?;
                Self::new(max_chars)
            }
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    /// Concatenate passage contents in order until the budget is spent
    pub fn assemble(&self, hits: &[ScoredPassage]) -> ContextWindow {
        let separator_chars = PASSAGE_SEPARATOR.chars().count();
        let mut text = String::new();
        let mut used_chars = 0;
        let mut passages_used = 0;
        let mut truncated = false;

        for hit in hits {
            let content = &hit.passage.content;
            let content_chars = content.chars().count();

            if passages_used == 0 {
                if content_chars > self.max_chars {
                    text.extend(content.chars().take(self.max_chars));
                    passages_used = 1;
                    truncated = true;
                    break;
                }
                text.push_str(content);
                used_chars = content_chars;
                passages_used = 1;
                continue;
            }

            if used_chars + separator_chars + content_chars > self.max_chars {
                truncated = true;
                break;
            }
            text.push_str(PASSAGE_SEPARATOR);
            text.push_str(content);
            used_chars += separator_chars + content_chars;
            passages_used += 1;
        }

        ContextWindow {
            text,
            passages_used,
            truncated,
        }
    }
}
