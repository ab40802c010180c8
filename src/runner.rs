//! Detached execution of generations.
//!
//! [`PipelineRunner::submit`] persists a `Pending` record and returns its id
//! at once; the generation then runs on its own tokio task, independent of
//! the caller. Each task is wrapped by a supervisor that marks the record
//! `Failed` if the pipeline errors out or panics, so no record is ever left
//! dangling in a non-terminal state by this process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::Backend;
use crate::client::RetryingClient;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::events::EventHandler;
use crate::pipeline::GenerationPipeline;
use crate::rate_limiter::RateLimiter;
use crate::record::{GenerationRecord, GenerationStatus};
use crate::repository::GenerationRepository;
use crate::types::{FinalResult, GenerationRequest, RequestOverrides};

/// Handle to a generation running in this process.
struct ActiveGeneration {
    cancel: Arc<AtomicBool>,
    done: watch::Receiver<Option<GenerationStatus>>,
}

struct RunnerInner {
    config: OrchestratorConfig,
    client: Arc<RetryingClient>,
    repository: Arc<dyn GenerationRepository>,
    active: Mutex<HashMap<Uuid, ActiveGeneration>>,
    permits: Option<Arc<Semaphore>>,
}

impl RunnerInner {
    fn active(&self) -> MutexGuard<'_, HashMap<Uuid, ActiveGeneration>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Submits generations and answers questions about them.
///
/// Cloning is cheap; clones share the same registry, client and repository.
/// The event handler belongs to the handle, so each clone may carry its own.
///
/// # Example
///
/// ```no_run
/// # async fn demo() -> llm_orchestrator::Result<()> {
/// use std::sync::Arc;
/// use llm_orchestrator::backend::MockBackend;
/// use llm_orchestrator::config::OrchestratorConfig;
/// use llm_orchestrator::repository::InMemoryRepository;
/// use llm_orchestrator::runner::PipelineRunner;
/// use llm_orchestrator::types::{GenerationRequest, StageSpec};
///
/// let runner = PipelineRunner::from_config(
///     OrchestratorConfig::default(),
///     Arc::new(MockBackend::fixed("text")),
///     Arc::new(InMemoryRepository::new()),
/// )?;
/// let id = runner
///     .submit(GenerationRequest::new("idea").with_stage(StageSpec::text("draft", 100, "{input}")))
///     .await?;
/// let result = runner.wait(id).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PipelineRunner {
    inner: Arc<RunnerInner>,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl std::fmt::Debug for PipelineRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRunner")
            .field("client", &self.inner.client)
            .field("active", &self.inner.active().len())
            .field(
                "available_permits",
                &self.inner.permits.as_ref().map(|s| s.available_permits()),
            )
            .field("has_event_handler", &self.event_handler.is_some())
            .finish()
    }
}

impl PipelineRunner {
    /// Runner over an existing client. The client's limiter is the shared quota.
    pub fn new(
        config: OrchestratorConfig,
        client: Arc<RetryingClient>,
        repository: Arc<dyn GenerationRepository>,
    ) -> Result<Self> {
        config.validate()?;
        let permits = config
            .max_concurrent_generations
            .map(|n| Arc::new(Semaphore::new(n)));
        Ok(Self {
            inner: Arc::new(RunnerInner {
                config,
                client,
                repository,
                active: Mutex::new(HashMap::new()),
                permits,
            }),
            event_handler: None,
        })
    }

    /// Runner with a client, limiter and retry policy all derived from `config`.
    pub fn from_config(
        config: OrchestratorConfig,
        backend: Arc<dyn Backend>,
        repository: Arc<dyn GenerationRepository>,
    ) -> Result<Self> {
        let limiter = Arc::new(RateLimiter::from_config(&config));
        let client = Arc::new(RetryingClient::from_config(&config, backend, limiter));
        Self::new(config, client, repository)
    }

    /// Receive stage and lifecycle events for every generation this handle
    /// (or a clone of it) submits from now on.
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Create a `Pending` record and start it in the background.
    ///
    /// Returns as soon as the record is persisted. Invalid requests fail
    /// here with [`OrchestratorError::Validation`].
    pub async fn submit(&self, request: GenerationRequest) -> Result<Uuid> {
        let record = GenerationRecord::new(request.clone())?;
        let id = record.id;
        self.inner.repository.create(record).await?;

        let cancel = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = watch::channel(None);
        self.inner.active().insert(
            id,
            ActiveGeneration {
                cancel: cancel.clone(),
                done: done_rx,
            },
        );

        let pipeline = GenerationPipeline::from_request(
            id,
            request,
            &self.inner.config,
            self.inner.client.clone(),
            self.inner.repository.clone(),
        )
        .with_cancellation(cancel)
        .with_event_handler(self.event_handler.clone());

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _permit = match inner.permits.clone() {
                Some(sem) => match sem.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        error!(generation = %id, "concurrency semaphore closed");
                        None
                    }
                },
                None => None,
            };

            let status = match tokio::spawn(pipeline.run()).await {
                Ok(Ok(status)) => status,
                Ok(Err(err)) => {
                    error!(generation = %id, error = %err, "generation aborted");
                    mark_failed(&inner, id, &err.to_string()).await
                }
                Err(join_err) => {
                    error!(generation = %id, error = %join_err, "generation task panicked");
                    mark_failed(&inner, id, "generation task panicked").await
                }
            };

            inner.active().remove(&id);
            // Waiters may have gone away; nothing to do then.
            let _ = done_tx.send(Some(status));
            debug!(generation = %id, %status, "generation task finished");
        });

        info!(generation = %id, "generation submitted");
        Ok(id)
    }

    /// Snapshot of the persisted record.
    pub async fn status(&self, id: Uuid) -> Result<GenerationRecord> {
        self.inner.repository.get_by_id(id).await
    }

    /// Request cooperative cancellation.
    ///
    /// Takes effect at the next stage boundary; a model call in flight
    /// completes first. Cancelling a cancelled generation is a no-op;
    /// cancelling a completed or failed one is an error.
    pub async fn cancel(&self, id: Uuid) -> Result<()> {
        let record = self.inner.repository.get_by_id(id).await?;
        if let Some(outcome) = cancel_terminal(record.status) {
            return outcome;
        }

        let flag = self.inner.active().get(&id).map(|a| a.cancel.clone());
        if let Some(flag) = flag {
            flag.store(true, Ordering::SeqCst);
            info!(generation = %id, "cancellation requested");
            return Ok(());
        }

        match self
            .inner
            .repository
            .update_status(id, GenerationStatus::Cancelled)
            .await
        {
            Ok(()) => {
                // Nothing in this process is executing it.
                warn!(generation = %id, "cancelled orphaned generation record");
                Ok(())
            }
            Err(err) => {
                // The task may have finished between the read and the lookup.
                let latest = self.inner.repository.get_by_id(id).await?;
                cancel_terminal(latest.status).unwrap_or(Err(err))
            }
        }
    }

    /// The output of a completed generation.
    ///
    /// [`OrchestratorError::NotReady`] while it is still pending or running,
    /// [`OrchestratorError::GenerationFailed`] or
    /// [`OrchestratorError::Cancelled`] for the other terminal states.
    pub async fn result(&self, id: Uuid) -> Result<FinalResult> {
        let record = self.inner.repository.get_by_id(id).await?;
        final_result(record)
    }

    /// Wait for a generation to reach a terminal state, then return its result.
    pub async fn wait(&self, id: Uuid) -> Result<FinalResult> {
        let done = self.inner.active().get(&id).map(|a| a.done.clone());
        if let Some(mut done) = done {
            // An Err means the supervisor is gone; the record is final either way.
            let _ = done.wait_for(Option::is_some).await;
        }
        self.result(id).await
    }

    /// [`wait`](Self::wait) with an upper bound.
    pub async fn wait_timeout(&self, id: Uuid, timeout: Duration) -> Result<FinalResult> {
        tokio::time::timeout(timeout, self.wait(id))
            .await
            .map_err(|_| OrchestratorError::Timeout(timeout))?
    }

    /// Submit a new generation built from an earlier one's request.
    pub async fn regenerate(&self, original_id: Uuid, overrides: RequestOverrides) -> Result<Uuid> {
        let original = self.inner.repository.get_by_id(original_id).await?;
        let request = original.request.with_overrides(&overrides);
        let id = self.submit(request).await?;
        info!(generation = %id, original = %original_id, "regeneration submitted");
        Ok(id)
    }

    /// Ids of generations currently executing (or queued) in this process.
    pub fn list_active(&self) -> Vec<Uuid> {
        self.inner.active().keys().copied().collect()
    }
}

/// Outcome of cancelling a generation already in `status`, if it is terminal.
fn cancel_terminal(status: GenerationStatus) -> Option<Result<()>> {
    match status {
        GenerationStatus::Cancelled => Some(Ok(())),
        GenerationStatus::Completed | GenerationStatus::Failed => {
            Some(Err(OrchestratorError::InvalidTransition {
                from: status,
                action: "cancel",
            }))
        }
        GenerationStatus::Pending | GenerationStatus::Running => None,
    }
}

/// Map a record to the caller-facing result of its current state.
fn final_result(record: GenerationRecord) -> Result<FinalResult> {
    match record.status {
        GenerationStatus::Completed => {
            let output = record.result.ok_or_else(|| {
                OrchestratorError::Repository(format!(
                    "completed generation {} has no stored result",
                    record.id
                ))
            })?;
            Ok(FinalResult {
                id: record.id,
                output,
                tokens_used: record.tokens_used,
                elapsed: Duration::from_millis(record.elapsed_ms.unwrap_or(0)),
                completed_at: record.completed_at.unwrap_or(record.updated_at),
            })
        }
        GenerationStatus::Pending | GenerationStatus::Running => Err(OrchestratorError::NotReady {
            id: record.id,
            status: record.status,
        }),
        GenerationStatus::Failed => Err(OrchestratorError::GenerationFailed(
            record
                .error_message
                .unwrap_or_else(|| "unknown failure".to_string()),
        )),
        GenerationStatus::Cancelled => Err(OrchestratorError::Cancelled),
    }
}

/// Best-effort transition to `Failed` after the pipeline itself could not finish.
async fn mark_failed(inner: &RunnerInner, id: Uuid, reason: &str) -> GenerationStatus {
    let record = match inner.repository.get_by_id(id).await {
        Ok(record) => record,
        Err(err) => {
            error!(generation = %id, error = %err, "cannot load record to mark it failed");
            return GenerationStatus::Failed;
        }
    };
    if record.is_terminal() {
        return record.status;
    }
    if let Err(err) = inner
        .repository
        .set_failed(id, reason, record.tokens_used)
        .await
    {
        error!(generation = %id, error = %err, "cannot mark generation failed");
    }
    GenerationStatus::Failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;

    use crate::backend::{MockBackend, MockOutcome};
    use crate::events::{Event, EventLog};
    use crate::record::StageProgress;
    use crate::repository::InMemoryRepository;
    use crate::types::StageSpec;

    /// Serves one out-of-date `Running` snapshot, as if the generation
    /// finished right after it was read.
    struct StaleFirstRead {
        inner: InMemoryRepository,
        stale: AtomicBool,
    }

    impl StaleFirstRead {
        fn new() -> Self {
            Self {
                inner: InMemoryRepository::new(),
                stale: AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl GenerationRepository for StaleFirstRead {
        async fn create(&self, record: GenerationRecord) -> Result<()> {
            self.inner.create(record).await
        }

        async fn get_by_id(&self, id: Uuid) -> Result<GenerationRecord> {
            let mut record = self.inner.get_by_id(id).await?;
            if self.stale.swap(false, Ordering::SeqCst) {
                record.status = GenerationStatus::Running;
            }
            Ok(record)
        }

        async fn update_stage(&self, id: Uuid, update: &StageProgress) -> Result<()> {
            self.inner.update_stage(id, update).await
        }

        async fn update_status(&self, id: Uuid, status: GenerationStatus) -> Result<()> {
            self.inner.update_status(id, status).await
        }

        async fn set_completed(
            &self,
            id: Uuid,
            result: Value,
            tokens_used: u32,
            elapsed: Duration,
        ) -> Result<()> {
            self.inner
                .set_completed(id, result, tokens_used, elapsed)
                .await
        }

        async fn set_failed(&self, id: Uuid, reason: &str, tokens_used: u32) -> Result<()> {
            self.inner.set_failed(id, reason, tokens_used).await
        }
    }

    async fn runner_over_stale(finish: GenerationStatus) -> (PipelineRunner, Uuid) {
        let repo = Arc::new(StaleFirstRead::new());
        let record = GenerationRecord::new(request()).unwrap();
        let id = record.id;
        repo.inner.create(record).await.unwrap();
        match finish {
            GenerationStatus::Completed => repo
                .inner
                .set_completed(id, serde_json::json!({}), 20, Duration::from_millis(5))
                .await
                .unwrap(),
            status => repo.inner.update_status(id, status).await.unwrap(),
        }

        let runner = PipelineRunner::from_config(
            OrchestratorConfig::default(),
            Arc::new(MockBackend::fixed("x")),
            repo,
        )
        .unwrap();
        (runner, id)
    }

    fn runner(mock: MockBackend) -> (PipelineRunner, Arc<InMemoryRepository>) {
        let repo = Arc::new(InMemoryRepository::new());
        let config = OrchestratorConfig::default()
            .with_requests_per_minute(1000)
            .with_base_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(100));
        let runner = PipelineRunner::from_config(config, Arc::new(mock), repo.clone()).unwrap();
        (runner, repo)
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new("posting")
            .with_stage(StageSpec::text("analysis", 40, "Analyze {input}"))
            .with_stage(StageSpec::text("content", 60, "Write from {analysis}"))
    }

    #[tokio::test]
    async fn test_submit_returns_pending_id_and_completes() {
        let (runner, _repo) = runner(MockBackend::fixed("text"));
        let id = runner.submit(request()).await.unwrap();

        let result = runner.wait(id).await.unwrap();
        assert_eq!(result.id, id);
        assert_eq!(result.stage_output("content"), Some(&serde_json::json!("text")));
        assert_eq!(result.tokens_used, 20);
        assert!(runner.list_active().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_request_rejected_synchronously() {
        let (runner, repo) = runner(MockBackend::fixed("text"));
        let bad = GenerationRequest::new("x").with_stage(StageSpec::text("a", 10, "{input}"));
        assert!(matches!(
            runner.submit(bad).await,
            Err(OrchestratorError::Validation(_))
        ));
        assert!(repo.is_empty().await);
    }

    #[tokio::test]
    async fn test_result_not_ready_while_running() {
        let (runner, _repo) =
            runner(MockBackend::fixed("slow").with_latency(Duration::from_millis(200)));
        let id = runner.submit(request()).await.unwrap();

        assert!(matches!(
            runner.result(id).await,
            Err(OrchestratorError::NotReady { .. })
        ));
        assert!(runner.list_active().contains(&id));
        runner.wait(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let (runner, _repo) = runner(MockBackend::fixed("x"));
        let id = Uuid::new_v4();
        assert!(matches!(runner.status(id).await, Err(OrchestratorError::NotFound(_))));
        assert!(matches!(runner.cancel(id).await, Err(OrchestratorError::NotFound(_))));
        assert!(matches!(runner.wait(id).await, Err(OrchestratorError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_failed_generation_result() {
        let (runner, _repo) = runner(MockBackend::scripted(vec![MockOutcome::Rejected(
            "HTTP 400: unknown model".into(),
        )]));
        let id = runner.submit(request()).await.unwrap();

        match runner.wait(id).await {
            Err(OrchestratorError::GenerationFailed(reason)) => {
                assert!(reason.contains("analysis"));
                assert!(reason.contains("unknown model"));
            }
            other => panic!("expected GenerationFailed, got {:?}", other),
        }
        assert!(matches!(
            runner.cancel(id).await,
            Err(OrchestratorError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_orphaned_record_cancelled_through_repository() {
        let (runner, repo) = runner(MockBackend::fixed("x"));
        let record = GenerationRecord::new(request()).unwrap();
        let id = record.id;
        repo.create(record).await.unwrap();

        runner.cancel(id).await.unwrap();
        assert_eq!(
            runner.status(id).await.unwrap().status,
            GenerationStatus::Cancelled
        );
        assert!(matches!(runner.result(id).await, Err(OrchestratorError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancel_racing_completion_reports_terminal_state() {
        let (runner, id) = runner_over_stale(GenerationStatus::Completed).await;
        assert!(matches!(
            runner.cancel(id).await,
            Err(OrchestratorError::InvalidTransition {
                from: GenerationStatus::Completed,
                action: "cancel",
            })
        ));

        let (runner, id) = runner_over_stale(GenerationStatus::Failed).await;
        assert!(matches!(
            runner.cancel(id).await,
            Err(OrchestratorError::InvalidTransition {
                from: GenerationStatus::Failed,
                action: "cancel",
            })
        ));
    }

    #[tokio::test]
    async fn test_cancel_racing_cancellation_is_a_no_op() {
        let (runner, id) = runner_over_stale(GenerationStatus::Cancelled).await;
        runner.cancel(id).await.unwrap();
        assert_eq!(
            runner.status(id).await.unwrap().status,
            GenerationStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_event_handler_applies_to_cloned_handle() {
        let (runner, _repo) = runner(MockBackend::fixed("text"));
        let shared = runner.clone();
        let log = Arc::new(EventLog::new());
        let observed = shared.with_event_handler(log.clone());

        let id = observed.submit(request()).await.unwrap();
        observed.wait(id).await.unwrap();
        assert!(matches!(
            log.events().last(),
            Some(Event::GenerationFinished {
                status: GenerationStatus::Completed,
                ..
            })
        ));

        let quiet = runner.submit(request()).await.unwrap();
        runner.wait(quiet).await.unwrap();
        assert!(log.events().iter().all(|event| !matches!(
            event,
            Event::GenerationStarted { id: started, .. } if *started == quiet
        )));
    }

    #[tokio::test]
    async fn test_regenerate_applies_overrides() {
        let mock = MockBackend::fixed("out");
        let (runner, _repo) = runner(mock);
        let first = runner.submit(request()).await.unwrap();
        runner.wait(first).await.unwrap();

        let second = runner
            .regenerate(first, RequestOverrides::new().input("another posting"))
            .await
            .unwrap();
        assert_ne!(first, second);
        runner.wait(second).await.unwrap();

        let record = runner.status(second).await.unwrap();
        assert_eq!(record.request.input, "another posting");
        assert_eq!(record.status, GenerationStatus::Completed);
    }
}
