//! # LLM Orchestrator
//!
//! Resilient model calls and multi-stage generations that run detached
//! from the caller.
//!
//! The crate has two layers:
//!
//! - a **resilient client**: [`RetryingClient`] validates a call, takes a
//!   slot from the shared [`RateLimiter`], bounds the transport call with a
//!   timeout, classifies failures and retries the transient ones with
//!   exponential backoff. [`output_parser::extract`] recovers a JSON object
//!   from fenced, prose-wrapped or otherwise messy model output.
//! - an **orchestration** layer: a generation is an ordered list of
//!   weighted stages. [`GenerationPipeline`] drives it through
//!   `Pending → Running(i) → Completed | Failed | Cancelled`, persisting
//!   every step through a [`GenerationRepository`], and [`PipelineRunner`]
//!   launches pipelines as background tasks behind `submit`, `status`,
//!   `cancel`, `result` and `regenerate`.
//!
//! Model providers plug in through the [`Backend`] trait
//! ([`OpenAiBackend`], [`OllamaBackend`], [`MockBackend`]).
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use llm_orchestrator::{
//!     GenerationRequest, InMemoryRepository, OpenAiBackend, OrchestratorConfig,
//!     PipelineRunner, StageSpec,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = OrchestratorConfig::from_env()?;
//!     let backend = Arc::new(OpenAiBackend::from_config(&config));
//!     let runner =
//!         PipelineRunner::from_config(config, backend, Arc::new(InMemoryRepository::new()))?;
//!
//!     let request = GenerationRequest::new("Senior Rust engineer, async networking")
//!         .with_stage(StageSpec::structured(
//!             "analysis",
//!             40,
//!             "Extract the key requirements from this job posting:\n{input}",
//!             r#"{"skills": ["string"], "seniority": "string"}"#,
//!         ))
//!         .with_stage(StageSpec::text(
//!             "content",
//!             60,
//!             "Write a cover letter addressing these requirements:\n{analysis}",
//!         ));
//!
//!     let id = runner.submit(request).await?;
//!     let result = runner.wait(id).await?;
//!     println!("{}", result.output["content"]);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod client;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod output_parser;
pub mod pipeline;
pub mod prompt;
pub mod rate_limiter;
pub mod record;
pub mod repository;
pub mod runner;
pub mod stage;
pub mod types;

pub use backend::{
    Backend, JitterStrategy, LlmMessage, LlmRequest, LlmResponse, MockBackend, MockOutcome,
    OllamaBackend, OpenAiBackend, RetryPolicy, Role,
};
pub use client::{Completion, RetryingClient, RetryingClientBuilder, StructuredCompletion};
pub use config::{OrchestratorConfig, RateLimitMode};
pub use diagnostics::CallDiagnostics;
pub use error::{ErrorKind, OrchestratorError, Result};
pub use events::{Event, EventHandler, EventLog, FnEventHandler};
pub use output_parser::ParseError;
pub use pipeline::{Advance, GenerationMachine, GenerationPipeline};
pub use rate_limiter::{RateDecision, RateLimiter};
pub use record::{GenerationRecord, GenerationStatus, StageDefinition, StageProgress};
pub use repository::{GenerationRepository, InMemoryRepository};
pub use runner::PipelineRunner;
pub use stage::{LlmStage, Stage, StageContext, StageOutput};
pub use types::{FinalResult, GenerationRequest, OutputMode, RequestOverrides, StageSpec};
