use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::record::{validate_plan, StageDefinition};

/// What a stage asks the model for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum OutputMode {
    /// Free text, passed on verbatim.
    Text,
    /// A JSON object matching `schema_hint`, recovered from the reply.
    Structured { schema_hint: String },
}

/// Declarative description of one stage of a generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub weight: u8,
    /// Template with `{input}`, `{key}` and `{previous_stage_name}` placeholders.
    pub prompt_template: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Model for this stage. `None` = configured stage model or default.
    #[serde(default)]
    pub model: Option<String>,
    pub output: OutputMode,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl StageSpec {
    /// A stage producing free text.
    pub fn text(name: impl Into<String>, weight: u8, prompt_template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            weight,
            prompt_template: prompt_template.into(),
            system_prompt: None,
            model: None,
            output: OutputMode::Text,
            temperature: None,
            max_tokens: None,
        }
    }

    /// A stage producing a JSON object.
    pub fn structured(
        name: impl Into<String>,
        weight: u8,
        prompt_template: impl Into<String>,
        schema_hint: impl Into<String>,
    ) -> Self {
        Self {
            output: OutputMode::Structured {
                schema_hint: schema_hint.into(),
            },
            ..Self::text(name, weight, prompt_template)
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn definition(&self) -> StageDefinition {
        StageDefinition::new(self.name.clone(), self.description.clone(), self.weight)
    }
}

/// Immutable input of a generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Fed to the first stage as `{input}`.
    pub input: String,
    /// Extra template variables available to every stage.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    pub stages: Vec<StageSpec>,
}

impl GenerationRequest {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            vars: BTreeMap::new(),
            stages: Vec::new(),
        }
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn with_stage(mut self, stage: StageSpec) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stage_definitions(&self) -> Vec<StageDefinition> {
        self.stages.iter().map(StageSpec::definition).collect()
    }

    /// Reject requests that can never run.
    pub fn validate(&self) -> Result<()> {
        validate_plan(&self.stage_definitions())?;
        if let Some(empty) = self
            .stages
            .iter()
            .find(|s| s.prompt_template.trim().is_empty())
        {
            return Err(OrchestratorError::Validation(format!(
                "stage '{}' has an empty prompt template",
                empty.name
            )));
        }
        Ok(())
    }

    /// A new request derived from this one.
    pub fn with_overrides(&self, overrides: &RequestOverrides) -> Self {
        let mut derived = self.clone();
        if let Some(ref input) = overrides.input {
            derived.input = input.clone();
        }
        derived
            .vars
            .extend(overrides.vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        for stage in &mut derived.stages {
            if let Some(model) = overrides.stage_models.get(&stage.name) {
                stage.model = Some(model.clone());
            }
        }
        derived
    }
}

/// Changes applied by `regenerate` on top of an earlier request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestOverrides {
    pub input: Option<String>,
    /// Merged over the original variables.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    /// Stage name to model.
    #[serde(default)]
    pub stage_models: HashMap<String, String>,
}

impl RequestOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn stage_model(mut self, stage: impl Into<String>, model: impl Into<String>) -> Self {
        self.stage_models.insert(stage.into(), model.into());
        self
    }
}

/// Output of a completed generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResult {
    pub id: Uuid,
    /// Stage name to that stage's output.
    pub output: Value,
    pub tokens_used: u32,
    pub elapsed: Duration,
    pub completed_at: DateTime<Utc>,
}

impl FinalResult {
    pub fn stage_output(&self, stage: &str) -> Option<&Value> {
        self.output.get(stage)
    }
}
