//! Runs a generation against an OpenAI-compatible endpoint.
//!
//! Configure through the environment (or a `.env` file):
//!
//!     LLM_BASE_URL=https://api.openai.com
//!     LLM_API_KEY=sk-...
//!     LLM_MODEL=gpt-4o-mini
//!     cargo run --example openai_generation -- "job posting text"

use std::sync::Arc;

use llm_orchestrator::{
    GenerationRequest, GenerationStatus, InMemoryRepository, OpenAiBackend, OrchestratorConfig,
    PipelineRunner, StageSpec,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("llm_orchestrator=info")),
        )
        .init();

    let config = OrchestratorConfig::from_env()?;
    let backend = Arc::new(OpenAiBackend::from_config(&config));
    let runner = PipelineRunner::from_config(config, backend, Arc::new(InMemoryRepository::new()))?;

    let posting = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "Senior Rust engineer to build async network services.".to_string());

    let request = GenerationRequest::new(posting)
        .with_var("tone", "confident but warm")
        .with_stage(StageSpec::structured(
            "analysis",
            30,
            "Extract the requirements from this job posting:\n\n{input}",
            r#"{"skills": ["string"], "responsibilities": ["string"], "seniority": "string"}"#,
        ))
        .with_stage(
            StageSpec::text(
                "content",
                50,
                "Write a short cover letter in a {tone} tone that addresses:\n\n{analysis}",
            )
            .with_system_prompt("You write concise, specific cover letters."),
        )
        .with_stage(
            StageSpec::text("polish", 20, "Tighten this letter without changing its facts:\n\n{input}")
                .with_temperature(0.3),
        );

    let id = runner.submit(request).await?;
    println!("submitted {}", id);

    let result = runner.wait(id).await;
    let record = runner.status(id).await?;
    match (record.status, result) {
        (GenerationStatus::Completed, Ok(result)) => {
            println!("{}", result.output["polish"].as_str().unwrap_or_default());
            println!("\n{} tokens in {:?}", result.tokens_used, result.elapsed);
        }
        (status, Err(err)) => {
            eprintln!("generation ended {}: {}", status, err);
            eprintln!("progress {}%, {} tokens spent", record.progress, record.tokens_used);
        }
        (status, Ok(_)) => eprintln!("unexpected state {}", status),
    }

    Ok(())
}
