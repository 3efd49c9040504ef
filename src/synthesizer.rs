//! Grounded answer generation over retrieved passages.
//!
//! A synthesizer probes the generation service once when it is created and settles into
//! one of three states:
//!
//! - [`SynthesizerState::NoKey`]: no credential, every answer is a fixed message
//! - [`SynthesizerState::Ready`]: a candidate model answered the probe
//! - [`SynthesizerState::Degraded`]: every candidate failed; terminal for this instance
//!
//! Build a new synthesizer to probe again.

use crate::cancel::CancelToken;
use crate::chunking::Passage;
use crate::context::ContextBuilder;
use crate::error::{RagError, Result};
use crate::index::ScoredPassage;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

/// Sentence the model is told to give when the context does not cover the question
pub const INSUFFICIENT_INFORMATION: &str =
    "I don't have enough information to answer this question based on the provided documents.";

/// Answer text when no generation credential is configured
pub const MISSING_CREDENTIAL_MESSAGE: &str =
    "Error: Please provide a Gemini API key to generate answers.";

/// Answer text when no candidate model could be reached
pub const SERVICE_UNAVAILABLE_MESSAGE: &str =
    "Error: Could not initialize a Gemini model. Please check your API key and try again.";

/// Models probed in order at initialization
pub const DEFAULT_MODEL_CANDIDATES: [&str; 4] = [
    "models/gemini-2.0-flash",
    "models/gemini-2.0-flash-001",
    "models/gemini-flash-latest",
    "models/gemini-pro-latest",
];

const PROBE_PROMPT: &str = "Hello";

/// External text generation capability
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate a completion for `prompt` with the given model identifier
    async fn generate(&self, model: &str, prompt: &str) -> Result<String>;
}

/// Builds a [`Generator`] authenticated with a caller-supplied credential
pub trait GeneratorFactory: Send + Sync {
    fn connect(&self, credential: &str) -> Result<Arc<dyn Generator>>;
}

/// A candidate model that failed the initialization probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeFailure {
    pub model: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesizerState {
    NoKey,
    Ready { model: String },
    Degraded { failures: Vec<ProbeFailure> },
}

/// How an answer was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    /// Text came back from the generation service
    Generated,
    /// Nothing was retrieved, so the insufficient-information sentence was returned directly
    NoRelevantPassages,
    MissingCredential,
    ServiceUnavailable,
    /// The generation call failed; `text` describes the error
    GenerationFailed,
}

/// Synthesized answer and the passages that grounded it
#[derive(Debug, Clone)]
pub struct Answer {
    pub text: String,
    pub outcome: AnswerOutcome,
    pub sources: Vec<Passage>,
}

impl Answer {
    fn fixed(text: &str, outcome: AnswerOutcome) -> Self {
        Answer {
            text: text.to_string(),
            outcome,
            sources: Vec::new(),
        }
    }
}

/// Settings for probing and generation
#[derive(Debug, Clone)]
pub struct SynthesizerOptions {
    /// Model identifiers tried in order during the probe
    pub candidates: Vec<String>,
    /// Deadline for every generation call, probes included
    pub timeout: Duration,
    pub context: ContextBuilder,
}

impl Default for SynthesizerOptions {
    fn default() -> Self {
        SynthesizerOptions {
            candidates: DEFAULT_MODEL_CANDIDATES
                .iter()
                .map(|m| m.to_string())
                .collect(),
            timeout: Duration::from_secs(60),
            context: ContextBuilder::default(),
        }
    }
}

pub struct AnswerSynthesizer {
    generator: Option<Arc<dyn Generator>>,
    state: SynthesizerState,
    options: SynthesizerOptions,
}

impl AnswerSynthesizer {
    /// Probe the candidates and settle into a state.
    ///
    /// Fails only if `cancel` fires during the probe.
    pub async fn initialize(
        generator: Option<Arc<dyn Generator>>,
        options: SynthesizerOptions,
        cancel: &CancelToken,
    ) -> Result<Self> {
        let state = match &generator {
            None => {
                info!("No generation credential configured");
                SynthesizerState::NoKey
            }
            Some(generator) => probe(generator.as_ref(), &options, cancel).await?,
        };

        Ok(AnswerSynthesizer {
            generator,
            state,
            options,
        })
    }

    pub fn state(&self) -> &SynthesizerState {
        &self.state
    }

    /// Answer `query` from `hits`.
    ///
    /// Service failures come back as an [`Answer`] with a descriptive text; the only error
    /// is [`RagError::Cancelled`].
    pub async fn synthesize(
        &self,
        query: &str,
        hits: &[ScoredPassage],
        cancel: &CancelToken,
    ) -> Result<Answer> {
        let model = match &self.state {
            SynthesizerState::NoKey => {
                return Ok(Answer::fixed(
                    MISSING_CREDENTIAL_MESSAGE,
                    AnswerOutcome::MissingCredential,
                ))
            }
            SynthesizerState::Degraded { .. } => {
                return Ok(Answer::fixed(
                    SERVICE_UNAVAILABLE_MESSAGE,
                    AnswerOutcome::ServiceUnavailable,
                ))
            }
            SynthesizerState::Ready { model } => model,
        };
        let Some(generator) = &self.generator else {
            return Ok(Answer::fixed(
                MISSING_CREDENTIAL_MESSAGE,
                AnswerOutcome::MissingCredential,
            ));
        };

        if hits.is_empty() {
            return Ok(Answer::fixed(
                INSUFFICIENT_INFORMATION,
                AnswerOutcome::NoRelevantPassages,
            ));
        }

        let window = self.options.context.assemble(hits);
        if window.truncated {
            debug!(
                "Context truncated to {} of {} passages ({} chars max)",
                window.passages_used,
                hits.len(),
                self.options.context.max_chars()
            );
        }
        let prompt = build_prompt(query, &window.text);
        let sources = hits
            .iter()
            .take(window.passages_used)
            .map(|h| h.passage.clone())
            .collect();

        let timeout = self.options.timeout;
        let outcome = cancel
            .run(timeout, generator.generate(model, &prompt), || {
                RagError::Generation(format!("Request timed out after {:?}", timeout))
            })
            .await;

        match outcome {
            Ok(text) => Ok(Answer {
                text,
                outcome: AnswerOutcome::Generated,
                sources,
            }),
            Err(RagError::Cancelled) => Err(RagError::Cancelled),
            Err(e) => {
                warn!("Answer generation failed: {}", e);
                Ok(Answer {
                    text: format!("Error generating answer: {}", e),
                    outcome: AnswerOutcome::GenerationFailed,
                    sources,
                })
            }
        }
    }
}

async fn probe(
    generator: &dyn Generator,
    options: &SynthesizerOptions,
    cancel: &CancelToken,
) -> Result<SynthesizerState> {
    let mut failures = Vec::new();

    for model in &options.candidates {
        let timeout = options.timeout;
        let outcome = cancel
            .run(timeout, generator.generate(model, PROBE_PROMPT), || {
                RagError::Generation(format!("Probe timed out after {:?}", timeout))
            })
            .await;

        match outcome {
            Ok(_) => {
                info!("Initialized generation model {}", model);
                return Ok(SynthesizerState::Ready {
                    model: model.clone(),
                });
            }
            Err(RagError::Cancelled) => return Err(RagError::Cancelled),
            Err(e) => {
                warn!("Generation model {} unavailable: {}", model, e);
                failures.push(ProbeFailure {
                    model: model.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    warn!("No compatible generation model found");
    Ok(SynthesizerState::Degraded { failures })
}

/// Build the grounding prompt sent to the generation service
pub fn build_prompt(query: &str, context: &str) -> String {
    format!(
        "Using the following context from documents, answer the user's question succinctly and accurately.\n\n\
         Context:\n{}\n\n\
         Question: {}\n\n\
         Answer the question based only on the provided context. \
         If the context doesn't contain relevant information, say \"{}\"\n\n\
         Answer:",
        context, query, INSUFFICIENT_INFORMATION
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Answers with a canned reply, failing for the listed models
    struct ScriptedGenerator {
        failing_models: Vec<&'static str>,
        reply: Result<String>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedGenerator {
        fn new(failing_models: Vec<&'static str>, reply: Result<String>) -> Self {
            ScriptedGenerator {
                failing_models,
                reply,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn generate(&self, model: &str, prompt: &str) -> Result<String> {
            self.calls
                .lock()
                .unwrap()
                .push((model.to_string(), prompt.to_string()));
            if self.failing_models.contains(&model) {
                return Err(RagError::Generation(format!("{} not found", model)));
            }
            match &self.reply {
                Ok(text) => Ok(text.clone()),
                Err(e) => Err(RagError::Generation(e.to_string())),
            }
        }
    }

    fn hit(content: &str) -> ScoredPassage {
        ScoredPassage {
            passage: Passage {
                content: content.to_string(),
                source_id: "doc".to_string(),
                sequence_index: 0,
                start_char: 0,
            },
            distance: 0.1,
            score: 0.9,
        }
    }

    #[tokio::test]
    async fn test_no_key_returns_fixed_message() {
        let synthesizer =
            AnswerSynthesizer::initialize(None, SynthesizerOptions::default(), &CancelToken::new())
                .await
                .unwrap();

        assert_eq!(synthesizer.state(), &SynthesizerState::NoKey);
        let answer = synthesizer
            .synthesize("q", &[hit("ctx")], &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(answer.text, MISSING_CREDENTIAL_MESSAGE);
        assert_eq!(answer.outcome, AnswerOutcome::MissingCredential);
    }

    #[tokio::test]
    async fn test_probe_falls_back_through_candidates() {
        let generator = Arc::new(ScriptedGenerator::new(
            vec!["models/gemini-2.0-flash", "models/gemini-2.0-flash-001"],
            Ok("hi".to_string()),
        ));
        let synthesizer = AnswerSynthesizer::initialize(
            Some(generator.clone()),
            SynthesizerOptions::default(),
            &CancelToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(
            synthesizer.state(),
            &SynthesizerState::Ready {
                model: "models/gemini-flash-latest".to_string()
            }
        );
        assert_eq!(generator.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_degraded_when_every_candidate_fails() {
        let generator = Arc::new(ScriptedGenerator::new(
            DEFAULT_MODEL_CANDIDATES.to_vec(),
            Ok("unused".to_string()),
        ));
        let synthesizer = AnswerSynthesizer::initialize(
            Some(generator.clone()),
            SynthesizerOptions::default(),
            &CancelToken::new(),
        )
        .await
        .unwrap();

        match synthesizer.state() {
            SynthesizerState::Degraded { failures } => assert_eq!(failures.len(), 4),
            other => panic!("unexpected state {:?}", other),
        }

        let answer = synthesizer
            .synthesize("q", &[hit("ctx")], &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(answer.text, SERVICE_UNAVAILABLE_MESSAGE);
        // Degraded does not re-probe per call
        assert_eq!(generator.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_ready_sends_grounding_prompt_and_returns_text_verbatim() {
        let generator = Arc::new(ScriptedGenerator::new(vec![], Ok("  Paris.\n".to_string())));
        let synthesizer = AnswerSynthesizer::initialize(
            Some(generator.clone()),
            SynthesizerOptions::default(),
            &CancelToken::new(),
        )
        .await
        .unwrap();

        let answer = synthesizer
            .synthesize(
                "What is the capital of France?",
                &[hit("The capital of France is Paris."), hit("Other text.")],
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(answer.text, "  Paris.\n");
        assert_eq!(answer.outcome, AnswerOutcome::Generated);
        assert_eq!(answer.sources.len(), 2);

        let calls = generator.calls();
        let (model, prompt) = calls.last().unwrap();
        assert_eq!(model, "models/gemini-2.0-flash");
        assert!(prompt.contains("The capital of France is Paris.\n\nOther text."));
        assert!(prompt.contains("Question: What is the capital of France?"));
        assert!(prompt.contains("based only on the provided context"));
        assert!(prompt.contains(INSUFFICIENT_INFORMATION));
    }

    #[tokio::test]
    async fn test_generation_failure_becomes_answer_text() {
        struct FailAfterProbe;

        #[async_trait]
        impl Generator for FailAfterProbe {
            async fn generate(&self, _model: &str, prompt: &str) -> Result<String> {
                if prompt == PROBE_PROMPT {
                    Ok("hello".to_string())
                } else {
                    Err(RagError::Generation("connection reset".to_string()))
                }
            }
        }

        let synthesizer = AnswerSynthesizer::initialize(
            Some(Arc::new(FailAfterProbe)),
            SynthesizerOptions::default(),
            &CancelToken::new(),
        )
        .await
        .unwrap();

        let answer = synthesizer
            .synthesize("q", &[hit("ctx")], &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(answer.outcome, AnswerOutcome::GenerationFailed);
        assert!(answer.text.contains("connection reset"));
    }

    #[tokio::test]
    async fn test_empty_retrieval_skips_generation() {
        let generator = Arc::new(ScriptedGenerator::new(vec![], Ok("hi".to_string())));
        let synthesizer = AnswerSynthesizer::initialize(
            Some(generator.clone()),
            SynthesizerOptions::default(),
            &CancelToken::new(),
        )
        .await
        .unwrap();
        let probes = generator.calls().len();

        let answer = synthesizer
            .synthesize("q", &[], &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(answer.text, INSUFFICIENT_INFORMATION);
        assert_eq!(answer.outcome, AnswerOutcome::NoRelevantPassages);
        assert_eq!(generator.calls().len(), probes);
    }

    #[tokio::test]
    async fn test_cancelled_probe_is_an_error() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let generator = Arc::new(ScriptedGenerator::new(vec![], Ok("hi".to_string())));

        let result =
            AnswerSynthesizer::initialize(Some(generator), SynthesizerOptions::default(), &cancel)
                .await;
        assert!(matches!(result, Err(RagError::Cancelled)));
    }
}
