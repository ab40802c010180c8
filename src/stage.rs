//! Stages: the unit of work a generation advances through.
//!
//! A [`Stage`] turns the previous stage's output into a new value, usually
//! with one model call. [`LlmStage`] is the built-in implementation driven
//! by a [`StageSpec`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::backend::LlmMessage;
use crate::client::RetryingClient;
use crate::config::OrchestratorConfig;
use crate::diagnostics::CallDiagnostics;
use crate::error::Result;
use crate::prompt::render;
use crate::record::StageDefinition;
use crate::types::{OutputMode, StageSpec};

/// Default sampling temperature for text stages.
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
/// Default token budget for text stages.
pub const DEFAULT_MAX_TOKENS: u32 = 2048;

/// Everything a stage may read while it runs.
pub struct StageContext<'a> {
    pub generation_id: Uuid,
    /// Output of the previous stage, or the request input for the first one.
    pub input: &'a str,
    /// Request variables plus the text output of every completed stage, by name.
    pub vars: &'a BTreeMap<String, String>,
    pub client: &'a RetryingClient,
}

/// What a stage produced.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    pub value: Value,
    pub tokens_used: u32,
    pub diagnostics: CallDiagnostics,
}

impl StageOutput {
    /// The value as prompt text: strings verbatim, anything else as JSON.
    pub fn as_text(&self) -> String {
        match &self.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// One phase of a generation.
///
/// Object-safe; pipelines hold stages as `Arc<dyn Stage>`.
#[async_trait]
pub trait Stage: Send + Sync {
    fn definition(&self) -> &StageDefinition;

    /// Run the stage. Errors carry any tokens already spent (see
    /// [`OrchestratorError::tokens_used`](crate::OrchestratorError::tokens_used)).
    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutput>;
}

/// A stage that renders a prompt and makes one model call.
#[derive(Debug, Clone)]
pub struct LlmStage {
    definition: StageDefinition,
    model: String,
    prompt_template: String,
    system_prompt: Option<String>,
    output: OutputMode,
    temperature: Option<f64>,
    max_tokens: Option<u32>,
}

impl LlmStage {
    /// Build from a [`StageSpec`], resolving the model through `config` when it names none.
    pub fn from_spec(spec: &StageSpec, config: &OrchestratorConfig) -> Self {
        let model = spec
            .model
            .clone()
            .unwrap_or_else(|| config.model_for_stage(&spec.name).to_string());
        Self {
            definition: spec.definition(),
            model,
            prompt_template: spec.prompt_template.clone(),
            system_prompt: spec.system_prompt.clone(),
            output: spec.output.clone(),
            temperature: spec.temperature,
            max_tokens: spec.max_tokens,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn messages(&self, ctx: &StageContext<'_>) -> Vec<LlmMessage> {
        let mut messages = Vec::with_capacity(2);
        if let Some(ref system) = self.system_prompt {
            let rendered = render(system, ctx.input, ctx.vars);
            if !rendered.trim().is_empty() {
                messages.push(LlmMessage::system(rendered));
            }
        }
        messages.push(LlmMessage::user(render(
            &self.prompt_template,
            ctx.input,
            ctx.vars,
        )));
        messages
    }
}

#[async_trait]
impl Stage for LlmStage {
    fn definition(&self) -> &StageDefinition {
        &self.definition
    }

    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutput> {
        let messages = self.messages(ctx);

        match &self.output {
            OutputMode::Text => {
                let completion = ctx
                    .client
                    .generate(
                        &messages,
                        &self.model,
                        self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
                        self.temperature.unwrap_or(DEFAULT_TEMPERATURE),
                    )
                    .await?;
                let tokens_used = completion.tokens_used();
                Ok(StageOutput {
                    value: Value::String(completion.response.content),
                    tokens_used,
                    diagnostics: completion.diagnostics,
                })
            }
            OutputMode::Structured { schema_hint } => {
                let structured = match (self.max_tokens, self.temperature) {
                    (None, None) => {
                        ctx.client
                            .generate_structured(&messages, &self.model, schema_hint)
                            .await?
                    }
                    (max_tokens, temperature) => {
                        ctx.client
                            .generate_structured_with(
                                &messages,
                                &self.model,
                                schema_hint,
                                max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
                                temperature.unwrap_or(DEFAULT_TEMPERATURE),
                            )
                            .await?
                    }
                };
                let tokens_used = structured.completion.tokens_used();
                Ok(StageOutput {
                    value: structured.value,
                    tokens_used,
                    diagnostics: structured.completion.diagnostics,
                })
            }
        }
    }
}
