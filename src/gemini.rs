use crate::embeddings::{DistanceMetric, Embedder, Embedding, EmbeddingModel};
use crate::error::{RagError, Result};
use crate::synthesizer::{Generator, GeneratorFactory};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_EMBEDDING_MODEL: &str = "models/text-embedding-004";
const DEFAULT_EMBEDDING_DIMENSION: usize = 768;
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const API_KEY_HEADER: &str = "x-goog-api-key";

/// Configuration for Gemini API
#[derive(Clone)]
pub struct GeminiConfig {
    /// Key used for embedding requests; generation keys are supplied per call
    pub api_key: Option<String>,
    pub base_url: String,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub request_timeout: Duration,
}

// Hand-written so the key never ends up in logs
impl std::fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("embedding_model", &self.embedding_model)
            .field("embedding_dimension", &self.embedding_dimension)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl Default for GeminiConfig {
    fn default() -> Self {
        GeminiConfig {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            embedding_dimension: DEFAULT_EMBEDDING_DIMENSION,
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl GeminiConfig {
    /// Create a new configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = GeminiConfig::default();

        let api_key = env::var("GEMINI_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty());
        let base_url = env::var("GEMINI_BASE_URL").unwrap_or(defaults.base_url);
        let embedding_model =
            env::var("GEMINI_EMBEDDING_MODEL").unwrap_or(defaults.embedding_model);
        let embedding_dimension = match env::var("GEMINI_EMBEDDING_DIMENSION") {
            Ok(raw) => raw.trim().parse().map_err(|_| {
                RagError::Configuration(format!("GEMINI_EMBEDDING_DIMENSION is not a number: {}", raw))
            })?,
            Err(_) => defaults.embedding_dimension,
        };
        let request_timeout = match env::var("GEMINI_TIMEOUT_SECS") {
            Ok(raw) => Duration::from_secs(raw.trim().parse().map_err(|_| {
                RagError::Configuration(format!("GEMINI_TIMEOUT_SECS is not a number: {}", raw))
            })?),
            Err(_) => defaults.request_timeout,
        };

        Ok(GeminiConfig {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            embedding_model,
            embedding_dimension,
            request_timeout,
        })
    }

    /// Descriptor of the embedding model this configuration targets
    pub fn embedding_model(&self) -> EmbeddingModel {
        EmbeddingModel {
            name: self.embedding_model.clone(),
            dimension: self.embedding_dimension,
            metric: DistanceMetric::Cosine,
        }
    }
}

/// Client for interacting with Gemini API
#[derive(Clone)]
pub struct GeminiClient {
    config: GeminiConfig,
    api_key: String,
    client: reqwest::Client,
}

impl GeminiClient {
    /// Create a new Gemini client authenticating with `api_key`
    pub fn new(config: GeminiConfig, api_key: String) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(RagError::MissingCredential);
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| RagError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(GeminiClient {
            config,
            api_key,
            client,
        })
    }

    /// Get the client configuration
    pub fn config(&self) -> &GeminiConfig {
        &self.config
    }

    /// Generate embeddings for several texts in one request
    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let model = self.config.embedding_model.as_str();
        let request = BatchEmbedRequest {
            requests: texts
                .iter()
                .map(|text| EmbedContentRequest {
                    model,
                    content: Content::new(text),
                })
                .collect(),
        };

        let url = format!("{}/{}:batchEmbedContents", self.config.base_url, model);

        let response = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| RagError::transient_embedding(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            let message = format!("API request failed: {} {}", status, error_text);
            return Err(if is_transient_status(status) {
                RagError::transient_embedding(message)
            } else {
                RagError::permanent_embedding(message)
            });
        }

        let response_data: BatchEmbedResponse = response
            .json()
            .await
            .map_err(|e| RagError::permanent_embedding(format!("Malformed response: {}", e)))?;

        Ok(response_data
            .embeddings
            .into_iter()
            .map(|e| Embedding::new(e.values))
            .collect())
    }

    /// Generate text using a Gemini model
    pub async fn generate_text(&self, model: &str, prompt: &str) -> Result<String> {
        let request = GenerateRequest {
            contents: vec![Content::new_with_role(prompt, "user")],
            generation_config: GenerationConfig {
                temperature: 0.2,
                top_p: 0.8,
                top_k: 40,
                max_output_tokens: 1024,
            },
        };

        let url = format!("{}/{}:generateContent", self.config.base_url, model);

        let response = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| RagError::Generation(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(RagError::Generation(format!(
                "API request failed: {} {}",
                status, error_text
            )));
        }

        let response_data: GenerateResponse = response
            .json()
            .await
            .map_err(|e| RagError::Generation(format!("Malformed response: {}", e)))?;

        // Extract the generated text from the response
        response_data
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .filter(|text| !text.is_empty())
            .ok_or_else(|| RagError::Generation("No response generated".to_string()))
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

#[async_trait]
impl Generator for GeminiClient {
    async fn generate(&self, model: &str, prompt: &str) -> Result<String> {
        self.generate_text(model, prompt).await
    }
}

/// Gemini embedding model as an [`Embedder`]
pub struct GeminiEmbedder {
    client: GeminiClient,
    model: EmbeddingModel,
}

impl GeminiEmbedder {
    /// Build an embedder from the configuration's own API key
    pub fn new(config: GeminiConfig) -> Result<Self> {
        let api_key = config.api_key.clone().ok_or(RagError::MissingCredential)?;
        let model = config.embedding_model();
        let client = GeminiClient::new(config, api_key)?;
        Ok(GeminiEmbedder { client, model })
    }
}

#[async_trait]
impl Embedder for GeminiEmbedder {
    fn model(&self) -> &EmbeddingModel {
        &self.model
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        self.client.embed_texts(texts).await
    }
}

impl GeneratorFactory for GeminiConfig {
    fn connect(&self, credential: &str) -> Result<Arc<dyn Generator>> {
        Ok(Arc::new(GeminiClient::new(self.clone(), credential.to_string())?))
    }
}

#[derive(Serialize)]
struct BatchEmbedRequest<'a> {
    requests: Vec<EmbedContentRequest<'a>>,
}

#[derive(Serialize)]
struct EmbedContentRequest<'a> {
    model: &'a str,
    content: Content<'a>,
}

#[derive(Deserialize, Debug)]
struct BatchEmbedResponse {
    #[serde(default)]
    embeddings: Vec<EmbeddingData>,
}

#[derive(Deserialize, Debug)]
struct EmbeddingData {
    values: Vec<f32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
}

impl<'a> Content<'a> {
    fn new(text: &'a str) -> Self {
        Content {
            parts: vec![Part { text }],
            role: None,
        }
    }

    fn new_with_role(text: &'a str, role: &'static str) -> Self {
        Content {
            parts: vec![Part { text }],
            role: Some(role),
        }
    }
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
}

#[derive(Deserialize, Debug)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize, Debug)]
struct Candidate {
    content: Option<ResponseContent>,
}

#[derive(Deserialize, Debug)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize, Debug)]
struct ResponsePart {
    #[serde(default)]
    text: String,
}
