//! Generation state machine and the pipeline that drives it.
//!
//! [`GenerationMachine`] is the pure transition logic:
//!
//! ```text
//! Pending ──start──► Running(0) ──advance──► Running(1) ... Running(N-1) ──advance──► Completed
//!    │                   │                                      │
//!    └──cancel──► Cancelled ◄──────────────cancel───────────────┤
//!                        └───────────────fail──────────────────►└──► Failed
//! ```
//!
//! [`GenerationPipeline`] owns one generation's execution: it runs each
//! stage, feeds the machine, and persists every transition through the
//! [`GenerationRepository`]. Cancellation is cooperative: the flag is
//! checked before the first stage and before every advance, so a model
//! call already in flight always finishes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::RetryingClient;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::events::{emit, Event, EventHandler};
use crate::record::{validate_plan, GenerationRecord, GenerationStatus, StageDefinition, StageProgress};
use crate::repository::GenerationRepository;
use crate::stage::{LlmStage, Stage, StageContext};
use crate::types::GenerationRequest;

/// Result of [`GenerationMachine::advance_stage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Entered the stage at this index.
    Entered(usize),
    /// The last stage completed; the generation is `Completed`.
    Finished,
}

/// Pure state machine for one generation.
///
/// Progress is the sum of the weights of stages marked complete; it only
/// grows, as do the stage index and the token total.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationMachine {
    status: GenerationStatus,
    stages: Vec<StageDefinition>,
    current: Option<usize>,
    /// Whether the stage at `current` has finished its work.
    current_done: bool,
    stages_completed: usize,
    progress: u8,
    tokens_used: u32,
    failure: Option<String>,
}

impl GenerationMachine {
    /// A `Pending` machine for a validated stage plan.
    pub fn new(stages: Vec<StageDefinition>) -> Result<Self> {
        validate_plan(&stages)?;
        Ok(Self {
            status: GenerationStatus::Pending,
            stages,
            current: None,
            current_done: false,
            stages_completed: 0,
            progress: 0,
            tokens_used: 0,
            failure: None,
        })
    }

    /// Resume from a persisted record, keeping its status.
    pub fn from_record(record: &GenerationRecord) -> Result<Self> {
        let mut machine = Self::new(record.stages.clone())?;
        machine.status = record.status;
        machine.current = record.current_stage_index;
        machine.stages_completed = record.stages_completed;
        machine.progress = record.progress;
        machine.tokens_used = record.tokens_used;
        machine.failure = record.error_message.clone();
        Ok(machine)
    }

    pub fn status(&self) -> GenerationStatus {
        self.status
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn tokens_used(&self) -> u32 {
        self.tokens_used
    }

    pub fn current_stage(&self) -> Option<usize> {
        self.current
    }

    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Pending → Running(0). Rejects any other state, so a record runs at most once.
    pub fn start(&mut self) -> Result<()> {
        if self.status != GenerationStatus::Pending {
            return Err(self.invalid("start"));
        }
        self.status = GenerationStatus::Running;
        self.current = Some(0);
        self.current_done = false;
        Ok(())
    }

    /// Mark the current stage's work as done, adding its weight and tokens.
    pub fn complete_stage(&mut self, tokens_used: u32) -> Result<u8> {
        let index = self.running_index("complete a stage of")?;
        if self.current_done {
            return Err(self.invalid("complete a stage twice in"));
        }
        self.current_done = true;
        self.stages_completed = index + 1;
        self.progress = self.progress.saturating_add(self.stages[index].weight).min(100);
        self.tokens_used = self.tokens_used.saturating_add(tokens_used);
        Ok(self.progress)
    }

    /// Running(i) with stage i complete → Running(i+1), or → Completed after the last stage.
    pub fn advance_stage(&mut self) -> Result<Advance> {
        let index = self.running_index("advance")?;
        if !self.current_done {
            return Err(self.invalid("advance past an unfinished stage of"));
        }
        let next = index + 1;
        if next < self.stages.len() {
            self.current = Some(next);
            self.current_done = false;
            Ok(Advance::Entered(next))
        } else {
            self.status = GenerationStatus::Completed;
            Ok(Advance::Finished)
        }
    }

    /// Running(i) → Failed, keeping every token spent, including `extra_tokens`
    /// from the call that failed.
    pub fn fail(&mut self, reason: impl Into<String>, extra_tokens: u32) -> Result<()> {
        self.running_index("fail")?;
        self.tokens_used = self.tokens_used.saturating_add(extra_tokens);
        self.failure = Some(reason.into());
        self.status = GenerationStatus::Failed;
        Ok(())
    }

    /// Pending or Running → Cancelled. The stage index stays where it is.
    pub fn cancel(&mut self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.invalid("cancel"));
        }
        self.status = GenerationStatus::Cancelled;
        Ok(())
    }

    /// The persisted form of the machine's current position.
    pub fn snapshot(&self) -> Option<StageProgress> {
        let index = self.current?;
        let stage = self.stages.get(index)?;
        Some(StageProgress {
            index,
            name: stage.name.clone(),
            description: stage.description.clone(),
            progress: self.progress,
            stages_completed: self.stages_completed,
            tokens_used: self.tokens_used,
        })
    }

    fn running_index(&self, action: &'static str) -> Result<usize> {
        match (self.status, self.current) {
            (GenerationStatus::Running, Some(index)) => Ok(index),
            _ => Err(self.invalid(action)),
        }
    }

    fn invalid(&self, action: &'static str) -> OrchestratorError {
        OrchestratorError::InvalidTransition {
            from: self.status,
            action,
        }
    }
}

/// Executes one generation from its persisted `Pending` record to a terminal state.
pub struct GenerationPipeline {
    id: Uuid,
    request: GenerationRequest,
    stages: Vec<Arc<dyn Stage>>,
    client: Arc<RetryingClient>,
    repository: Arc<dyn GenerationRepository>,
    cancel: Arc<AtomicBool>,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl GenerationPipeline {
    /// Pipeline running `request`'s stages as [`LlmStage`]s.
    pub fn from_request(
        id: Uuid,
        request: GenerationRequest,
        config: &OrchestratorConfig,
        client: Arc<RetryingClient>,
        repository: Arc<dyn GenerationRepository>,
    ) -> Self {
        let stages = request
            .stages
            .iter()
            .map(|spec| Arc::new(LlmStage::from_spec(spec, config)) as Arc<dyn Stage>)
            .collect();
        Self::with_stages(id, request, stages, client, repository)
    }

    /// Pipeline over custom stages. Their definitions must match the record's plan.
    pub fn with_stages(
        id: Uuid,
        request: GenerationRequest,
        stages: Vec<Arc<dyn Stage>>,
        client: Arc<RetryingClient>,
        repository: Arc<dyn GenerationRepository>,
    ) -> Self {
        Self {
            id,
            request,
            stages,
            client,
            repository,
            cancel: Arc::new(AtomicBool::new(false)),
            event_handler: None,
        }
    }

    /// Share a cancellation flag with whoever may cancel this generation.
    pub fn with_cancellation(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_event_handler(mut self, handler: Option<Arc<dyn EventHandler>>) -> Self {
        self.event_handler = handler;
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Run to a terminal state and return it.
    ///
    /// Stage failures end in `Failed` and are not errors here. `Err` means
    /// the record could not be started or a repository write failed.
    pub async fn run(self) -> Result<GenerationStatus> {
        let id = self.id;
        let record = self.repository.get_by_id(id).await?;
        let mut machine = GenerationMachine::from_record(&record)?;

        let plan: Vec<&StageDefinition> = self.stages.iter().map(|s| s.definition()).collect();
        if plan.len() != machine.stages().len()
            || plan.iter().zip(machine.stages()).any(|(a, b)| *a != b)
        {
            return Err(OrchestratorError::InvalidConfig(format!(
                "stages do not match the plan stored for generation {}",
                id
            )));
        }

        if self.is_cancelled() {
            machine.cancel()?;
            self.repository
                .update_status(id, GenerationStatus::Cancelled)
                .await?;
            info!(generation = %id, "generation cancelled before start");
            return Ok(self.finish(&machine));
        }

        machine.start()?;
        self.repository
            .update_status(id, GenerationStatus::Running)
            .await?;
        self.persist_position(&machine).await?;
        info!(generation = %id, stages = self.stages.len(), "generation started");
        emit(
            &self.event_handler,
            Event::GenerationStarted {
                id,
                stages: self.stages.len(),
            },
        );

        let started = Instant::now();
        let mut input = self.request.input.clone();
        let mut vars: BTreeMap<String, String> = self.request.vars.clone();
        let mut outputs = Map::new();

        for (index, stage) in self.stages.iter().enumerate() {
            let definition = stage.definition();
            debug!(generation = %id, stage = %definition.name, index, "stage started");
            emit(
                &self.event_handler,
                Event::StageStarted {
                    id,
                    index,
                    name: definition.name.clone(),
                },
            );

            let ctx = StageContext {
                generation_id: id,
                input: &input,
                vars: &vars,
                client: &self.client,
            };
            let output = match stage.run(&ctx).await {
                Ok(output) => output,
                Err(err) => {
                    let reason = format!("stage '{}' failed: {}", definition.name, err);
                    warn!(generation = %id, stage = %definition.name, error = %err, "stage failed");
                    machine.fail(reason.clone(), err.tokens_used())?;
                    self.repository
                        .set_failed(id, &reason, machine.tokens_used())
                        .await?;
                    return Ok(self.finish(&machine));
                }
            };

            let progress = machine.complete_stage(output.tokens_used)?;
            info!(
                generation = %id,
                stage = %definition.name,
                progress,
                tokens = output.tokens_used,
                "stage completed"
            );
            emit(
                &self.event_handler,
                Event::StageCompleted {
                    id,
                    index,
                    name: definition.name.clone(),
                    progress,
                    tokens_used: output.tokens_used,
                },
            );

            input = output.as_text();
            vars.insert(definition.name.clone(), input.clone());
            outputs.insert(definition.name.clone(), output.value);

            if self.is_cancelled() {
                machine.cancel()?;
                self.persist_position(&machine).await?;
                self.repository
                    .update_status(id, GenerationStatus::Cancelled)
                    .await?;
                info!(generation = %id, after_stage = %definition.name, "generation cancelled");
                return Ok(self.finish(&machine));
            }

            match machine.advance_stage()? {
                Advance::Entered(_) => self.persist_position(&machine).await?,
                Advance::Finished => {
                    self.repository
                        .set_completed(
                            id,
                            Value::Object(outputs),
                            machine.tokens_used(),
                            started.elapsed(),
                        )
                        .await?;
                    info!(
                        generation = %id,
                        tokens = machine.tokens_used(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "generation completed"
                    );
                    return Ok(self.finish(&machine));
                }
            }
        }

        // The plan is never empty, so the loop always returns.
        Err(OrchestratorError::Other(format!(
            "generation {} ran out of stages without finishing",
            id
        )))
    }

    async fn persist_position(&self, machine: &GenerationMachine) -> Result<()> {
        match machine.snapshot() {
            Some(update) => self.repository.update_stage(self.id, &update).await,
            None => Ok(()),
        }
    }

    fn finish(&self, machine: &GenerationMachine) -> GenerationStatus {
        emit(
            &self.event_handler,
            Event::GenerationFinished {
                id: self.id,
                status: machine.status(),
                tokens_used: machine.tokens_used(),
            },
        );
        machine.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(weights: &[u8]) -> GenerationMachine {
        let stages = weights
            .iter()
            .enumerate()
            .map(|(i, w)| StageDefinition::new(format!("s{}", i), format!("stage {}", i), *w))
            .collect();
        GenerationMachine::new(stages).unwrap()
    }

    #[test]
    fn test_weights_40_60_progress() {
        let mut m = machine(&[40, 60]);
        m.start().unwrap();
        assert_eq!(m.progress(), 0);
        assert_eq!(m.current_stage(), Some(0));

        assert_eq!(m.complete_stage(100).unwrap(), 40);
        assert_eq!(m.advance_stage().unwrap(), Advance::Entered(1));
        assert_eq!(m.progress(), 40);
        assert_eq!(m.status(), GenerationStatus::Running);

        assert_eq!(m.complete_stage(150).unwrap(), 100);
        assert_eq!(m.advance_stage().unwrap(), Advance::Finished);
        assert_eq!(m.status(), GenerationStatus::Completed);
        assert_eq!(m.tokens_used(), 250);
    }

    #[test]
    fn test_progress_monotonic_over_many_stages() {
        let mut m = machine(&[10, 20, 30, 15, 25]);
        m.start().unwrap();
        let mut last = 0;
        let mut expected = 0;
        for (i, w) in [10u8, 20, 30, 15, 25].iter().enumerate() {
            let p = m.complete_stage(1).unwrap();
            expected += w;
            assert!(p >= last);
            assert_eq!(p, expected);
            last = p;
            let step = m.advance_stage().unwrap();
            if i < 4 {
                assert_eq!(step, Advance::Entered(i + 1));
            } else {
                assert_eq!(step, Advance::Finished);
            }
        }
        assert_eq!(m.progress(), 100);
    }

    #[test]
    fn test_start_only_from_pending() {
        let mut m = machine(&[100]);
        m.start().unwrap();
        assert!(matches!(
            m.start(),
            Err(OrchestratorError::InvalidTransition {
                from: GenerationStatus::Running,
                action: "start"
            })
        ));
    }

    #[test]
    fn test_cannot_advance_unfinished_stage() {
        let mut m = machine(&[50, 50]);
        m.start().unwrap();
        assert!(m.advance_stage().is_err());
        m.complete_stage(1).unwrap();
        assert!(m.complete_stage(1).is_err());
    }

    #[test]
    fn test_fail_preserves_tokens() {
        let mut m = machine(&[40, 60]);
        m.start().unwrap();
        m.complete_stage(120).unwrap();
        m.advance_stage().unwrap();
        m.fail("parse error", 30).unwrap();

        assert_eq!(m.status(), GenerationStatus::Failed);
        assert_eq!(m.tokens_used(), 150);
        assert_eq!(m.progress(), 40);
        assert_eq!(m.failure(), Some("parse error"));
        assert!(m.cancel().is_err());
        assert!(m.advance_stage().is_err());
    }

    #[test]
    fn test_fail_requires_running() {
        let mut m = machine(&[100]);
        assert!(m.fail("nope", 0).is_err());
    }

    #[test]
    fn test_cancel_freezes_stage_index() {
        let mut m = machine(&[40, 60]);
        m.start().unwrap();
        m.complete_stage(10).unwrap();
        m.cancel().unwrap();

        assert_eq!(m.status(), GenerationStatus::Cancelled);
        assert_eq!(m.current_stage(), Some(0));
        let snap = m.snapshot().unwrap();
        assert_eq!(snap.index, 0);
        assert_eq!(snap.stages_completed, 1);
        assert_eq!(snap.progress, 40);
    }

    #[test]
    fn test_cancel_from_pending() {
        let mut m = machine(&[100]);
        m.cancel().unwrap();
        assert_eq!(m.status(), GenerationStatus::Cancelled);
        assert!(m.snapshot().is_none());
        assert!(m.start().is_err());
    }

    #[test]
    fn test_invalid_plan_rejected() {
        assert!(GenerationMachine::new(vec![StageDefinition::new("a", "", 99)]).is_err());
    }

    /// Upper-cases its input without calling a model.
    struct Shout(StageDefinition);

    #[async_trait::async_trait]
    impl Stage for Shout {
        fn definition(&self) -> &StageDefinition {
            &self.0
        }

        async fn run(&self, ctx: &StageContext<'_>) -> Result<crate::stage::StageOutput> {
            Ok(crate::stage::StageOutput {
                value: Value::String(ctx.input.to_uppercase()),
                tokens_used: 3,
                diagnostics: Default::default(),
            })
        }
    }

    fn fixture(
        request: &GenerationRequest,
    ) -> (Arc<RetryingClient>, Arc<crate::repository::InMemoryRepository>, GenerationRecord) {
        let client = Arc::new(
            RetryingClient::builder(
                Arc::new(crate::backend::MockBackend::fixed("unused")),
                Arc::new(crate::rate_limiter::RateLimiter::per_minute(10)),
            )
            .build(),
        );
        let repo = Arc::new(crate::repository::InMemoryRepository::new());
        let record = GenerationRecord::new(request.clone()).unwrap();
        (client, repo, record)
    }

    #[tokio::test]
    async fn test_custom_stages_run_to_completion() {
        use crate::types::StageSpec;

        let request = GenerationRequest::new("hello")
            .with_stage(StageSpec::text("first", 30, "{input}"))
            .with_stage(StageSpec::text("second", 70, "{input}"));
        let (client, repo, record) = fixture(&request);
        let id = record.id;
        repo.create(record).await.unwrap();

        let stages: Vec<Arc<dyn Stage>> = request
            .stage_definitions()
            .into_iter()
            .map(|d| Arc::new(Shout(d)) as Arc<dyn Stage>)
            .collect();
        let status = GenerationPipeline::with_stages(id, request, stages, client, repo.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(status, GenerationStatus::Completed);
        let stored = repo.get_by_id(id).await.unwrap();
        assert_eq!(stored.tokens_used, 6);
        assert_eq!(stored.result, Some(serde_json::json!({"first": "HELLO", "second": "HELLO"})));
    }

    #[tokio::test]
    async fn test_pre_cancelled_pipeline_never_starts() {
        use crate::types::StageSpec;

        let request = GenerationRequest::new("x").with_stage(StageSpec::text("only", 100, "{input}"));
        let (client, repo, record) = fixture(&request);
        let id = record.id;
        repo.create(record).await.unwrap();

        let stages = vec![Arc::new(Shout(request.stage_definitions().remove(0))) as Arc<dyn Stage>];
        let pipeline = GenerationPipeline::with_stages(id, request, stages, client, repo.clone());
        pipeline.cancel_flag().store(true, Ordering::SeqCst);

        assert_eq!(pipeline.run().await.unwrap(), GenerationStatus::Cancelled);
        let stored = repo.get_by_id(id).await.unwrap();
        assert_eq!(stored.progress, 0);
        assert_eq!(stored.current_stage_index, None);
    }

    #[tokio::test]
    async fn test_stages_must_match_stored_plan() {
        use crate::types::StageSpec;

        let request = GenerationRequest::new("x").with_stage(StageSpec::text("only", 100, "{input}"));
        let (client, repo, record) = fixture(&request);
        let id = record.id;
        repo.create(record).await.unwrap();

        let stages = vec![Arc::new(Shout(StageDefinition::new("other", "", 100))) as Arc<dyn Stage>];
        let result = GenerationPipeline::with_stages(id, request, stages, client, repo)
            .run()
            .await;
        assert!(matches!(result, Err(OrchestratorError::InvalidConfig(_))));
    }
}
