use crate::error::{RagError, Result};
use log::{debug, info, warn};
use mime_guess::from_path;
use pdf_extract::extract_text;
use std::fs;
use std::path::{Path, PathBuf};

/// Where the text of a document comes from
#[derive(Debug, Clone)]
pub enum DocumentSource {
    /// Text supplied directly by the caller
    Text(String),
    /// A text or PDF file read at ingestion time
    File(PathBuf),
}

/// A document submitted for indexing
#[derive(Debug, Clone)]
pub struct RawDocument {
    /// Identifier stored as the `source_id` of every passage
    pub id: String,
    pub source: DocumentSource,
}

impl RawDocument {
    pub fn from_text<I: Into<String>, T: Into<String>>(id: I, text: T) -> Self {
        RawDocument {
            id: id.into(),
            source: DocumentSource::Text(text.into()),
        }
    }

    /// A file document identified by its path as given
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        RawDocument {
            id: path.display().to_string(),
            source: DocumentSource::File(path.to_path_buf()),
        }
    }

    /// Produce the document text, reading the file if needed
    pub fn extract_text(&self) -> Result<String> {
        match &self.source {
            DocumentSource::Text(text) => Ok(text.clone()),
            DocumentSource::File(path) => {
                let mime = from_path(path).first_or_octet_stream();
                let mime_type = mime.to_string();
                debug!("Detected MIME type for {}: {}", self.id, mime_type);

                read_document_content(path, &mime_type).map_err(|reason| RagError::Extraction {
                    id: self.id.clone(),
                    reason,
                })
            }
        }
    }
}

/// Read content from a document based on its MIME type
fn read_document_content(path: &Path, mime_type: &str) -> std::result::Result<String, String> {
    match mime_type {
        mime if mime.starts_with("application/pdf") => {
            info!("Processing PDF document: {}", path.display());
            let content = extract_text(path)
                .map_err(|e| format!("failed to extract text from PDF: {}", e))?;

            // PDF extraction can sometimes include excessive whitespace
            let cleaned_content = normalize_whitespace(&content);

            if cleaned_content.is_empty() {
                warn!("Extracted PDF content is empty or contains only whitespace");
            }

            Ok(cleaned_content)
        }

        mime if mime.starts_with("text/") => {
            info!("Processing text document: {}", path.display());
            fs::read_to_string(path).map_err(|e| format!("failed to read text file: {}", e))
        }

        _ => Err(format!(
            "unsupported document format {}; only text and PDF files are supported",
            mime_type
        )),
    }
}

/// Collapse runs of spaces and cap newline runs at one paragraph break
fn normalize_whitespace(text: &str) -> String {
    let result = text.replace('\r', "");

    let mut prev_char = ' ';
    let mut newline_count = 0;
    let mut normalized = String::with_capacity(result.len());

    for c in result.chars() {
        if c == '\n' {
            newline_count += 1;
        } else {
            if newline_count > 0 {
                push_newlines(&mut normalized, newline_count);
                newline_count = 0;
            }

            if !(c == ' ' && prev_char == ' ') {
                normalized.push(c);
            }

            prev_char = c;
        }
    }

    if newline_count > 0 {
        push_newlines(&mut normalized, newline_count);
    }

    normalized.trim().to_string()
}

fn push_newlines(out: &mut String, count: usize) {
    if count >= 2 {
        out.push_str("\n\n");
    } else {
        out.push('\n');
    }
}
