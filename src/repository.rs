//! Persistence port for generation records.
//!
//! The pipeline writes a generation as a sequence of independent point
//! updates; it never needs multi-record transactions. [`InMemoryRepository`]
//! is the bundled adapter, also used by the test suite.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::record::{GenerationRecord, GenerationStatus, StageProgress};

/// Storage for [`GenerationRecord`]s.
///
/// Implementations must make each method atomic for the record it touches.
#[async_trait]
pub trait GenerationRepository: Send + Sync {
    async fn create(&self, record: GenerationRecord) -> Result<()>;

    /// Snapshot of one record. [`OrchestratorError::NotFound`] if unknown.
    async fn get_by_id(&self, id: Uuid) -> Result<GenerationRecord>;

    /// Record the current stage together with progress and token totals.
    async fn update_stage(&self, id: Uuid, update: &StageProgress) -> Result<()>;

    async fn update_status(&self, id: Uuid, status: GenerationStatus) -> Result<()>;

    async fn set_completed(
        &self,
        id: Uuid,
        result: Value,
        tokens_used: u32,
        elapsed: Duration,
    ) -> Result<()>;

    /// Mark failed, keeping the tokens spent before the failure.
    async fn set_failed(&self, id: Uuid, reason: &str, tokens_used: u32) -> Result<()>;
}

/// Process-local repository backed by a `HashMap`.
///
/// Rejects every write to a record that already reached a terminal state,
/// and any update that would move progress or token totals backwards.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    records: RwLock<HashMap<Uuid, GenerationRecord>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// All records in the given status.
    pub async fn list_by_status(&self, status: GenerationStatus) -> Vec<GenerationRecord> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect()
    }

    /// Apply `write` to a non-terminal record under the write lock.
    async fn mutate<F>(&self, id: Uuid, action: &'static str, write: F) -> Result<()>
    where
        F: FnOnce(&mut GenerationRecord) -> Result<()> + Send,
    {
        let mut records = self.records.write().await;
        let record = records.get_mut(&id).ok_or(OrchestratorError::NotFound(id))?;
        if record.is_terminal() {
            return Err(OrchestratorError::InvalidTransition {
                from: record.status,
                action,
            });
        }
        write(record)?;
        record.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl GenerationRepository for InMemoryRepository {
    async fn create(&self, record: GenerationRecord) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(OrchestratorError::Repository(format!(
                "generation {} already exists",
                record.id
            )));
        }
        records.insert(record.id, record);
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<GenerationRecord> {
        self.records
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(OrchestratorError::NotFound(id))
    }

    async fn update_stage(&self, id: Uuid, update: &StageProgress) -> Result<()> {
        self.mutate(id, "update stage of", |record| {
            let regresses = update.progress < record.progress
                || update.tokens_used < record.tokens_used
                || record
                    .current_stage_index
                    .is_some_and(|current| update.index < current);
            if regresses {
                return Err(OrchestratorError::Repository(format!(
                    "stage update for {} would move backwards",
                    id
                )));
            }
            record.apply_progress(update);
            Ok(())
        })
        .await
    }

    async fn update_status(&self, id: Uuid, status: GenerationStatus) -> Result<()> {
        self.mutate(id, "change status of", |record| {
            if status.is_terminal() {
                record.completed_at = Some(Utc::now());
            }
            record.status = status;
            Ok(())
        })
        .await
    }

    async fn set_completed(
        &self,
        id: Uuid,
        result: Value,
        tokens_used: u32,
        elapsed: Duration,
    ) -> Result<()> {
        self.mutate(id, "complete", |record| {
            record.status = GenerationStatus::Completed;
            record.result = Some(result);
            record.tokens_used = record.tokens_used.max(tokens_used);
            record.progress = 100;
            record.stages_completed = record.stages.len();
            record.completed_at = Some(Utc::now());
            record.elapsed_ms = Some(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
            Ok(())
        })
        .await
    }

    async fn set_failed(&self, id: Uuid, reason: &str, tokens_used: u32) -> Result<()> {
        self.mutate(id, "fail", |record| {
            record.status = GenerationStatus::Failed;
            record.error_message = Some(reason.to_string());
            record.tokens_used = record.tokens_used.max(tokens_used);
            record.completed_at = Some(Utc::now());
            Ok(())
        })
        .await
    }
}
