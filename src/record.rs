//! The persisted generation aggregate and its status.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::types::GenerationRequest;

/// Lifecycle state of a generation.
///
/// `Pending` and `Running` are the only non-terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl GenerationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GenerationStatus::Completed | GenerationStatus::Failed | GenerationStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStatus::Pending => "pending",
            GenerationStatus::Running => "running",
            GenerationStatus::Completed => "completed",
            GenerationStatus::Failed => "failed",
            GenerationStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One phase of a generation and its share of overall progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    pub description: String,
    /// Percentage points this stage contributes when it completes.
    pub weight: u8,
}

impl StageDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, weight: u8) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            weight,
        }
    }
}

/// Check that a stage plan is non-empty, named, and weighted to exactly 100.
pub fn validate_plan(stages: &[StageDefinition]) -> Result<()> {
    if stages.is_empty() {
        return Err(OrchestratorError::Validation(
            "a generation needs at least one stage".to_string(),
        ));
    }
    if let Some(unnamed) = stages.iter().position(|s| s.name.trim().is_empty()) {
        return Err(OrchestratorError::Validation(format!(
            "stage {} has an empty name",
            unnamed
        )));
    }
    for (i, stage) in stages.iter().enumerate() {
        if stages[..i].iter().any(|earlier| earlier.name == stage.name) {
            return Err(OrchestratorError::Validation(format!(
                "stage name '{}' is used twice",
                stage.name
            )));
        }
    }
    let total: u32 = stages.iter().map(|s| u32::from(s.weight)).sum();
    if total != 100 {
        return Err(OrchestratorError::Validation(format!(
            "stage weights sum to {}, expected 100",
            total
        )));
    }
    Ok(())
}

/// Position and accounting of a running generation, written in one update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageProgress {
    /// 0-based index of the current stage.
    pub index: usize,
    pub name: String,
    pub description: String,
    /// Sum of the weights of fully completed stages.
    pub progress: u8,
    pub stages_completed: usize,
    pub tokens_used: u32,
}

/// Persisted state of one generation.
///
/// Written only by the generation's own pipeline task; read-only to
/// everyone else. Immutable once `status` is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub id: Uuid,
    pub status: GenerationStatus,
    /// `None` until the first stage is entered.
    pub current_stage_index: Option<usize>,
    pub current_stage_name: Option<String>,
    pub current_stage_description: Option<String>,
    pub stages: Vec<StageDefinition>,
    /// 0..=100, sum of completed stage weights.
    pub progress: u8,
    pub stages_completed: usize,
    pub tokens_used: u32,
    pub error_message: Option<String>,
    /// Final output, present once `Completed`.
    pub result: Option<Value>,
    /// The immutable input this generation was created from.
    pub request: GenerationRequest,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall time from start to completion.
    pub elapsed_ms: Option<u64>,
}

impl GenerationRecord {
    /// A fresh `Pending` record for `request`, with a new id.
    pub fn new(request: GenerationRequest) -> Result<Self> {
        request.validate()?;
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            status: GenerationStatus::Pending,
            current_stage_index: None,
            current_stage_name: None,
            current_stage_description: None,
            stages: request.stage_definitions(),
            progress: 0,
            stages_completed: 0,
            tokens_used: 0,
            error_message: None,
            result: None,
            request,
            created_at: now,
            updated_at: now,
            completed_at: None,
            elapsed_ms: None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Copy a stage update into the record.
    pub fn apply_progress(&mut self, update: &StageProgress) {
        self.current_stage_index = Some(update.index);
        self.current_stage_name = Some(update.name.clone());
        self.current_stage_description = Some(update.description.clone());
        self.progress = update.progress;
        self.stages_completed = update.stages_completed;
        self.tokens_used = update.tokens_used;
        self.updated_at = Utc::now();
    }
}
