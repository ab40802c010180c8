//! Runs a two-stage generation against the mock backend. No network needed.
//!
//!     RUST_LOG=llm_orchestrator=debug cargo run --example mock_generation

use std::sync::Arc;
use std::time::Duration;

use llm_orchestrator::{
    Event, FnEventHandler, GenerationRequest, InMemoryRepository, MockBackend, MockOutcome,
    OrchestratorConfig, PipelineRunner, StageSpec,
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

    // One transient failure first so the retry path shows up in the logs.
    let backend = MockBackend::scripted(vec![
        MockOutcome::ServiceError("HTTP 503".into()),
        MockOutcome::reply(
            "```json\n{\"skills\": [\"rust\", \"tokio\"], \"seniority\": \"senior\"}\n```",
            48,
        ),
        MockOutcome::reply("Dear hiring team, ...", 120),
    ])
    .with_latency(Duration::from_millis(150));

    let config = OrchestratorConfig::default()
        .with_default_model("mock-model")
        .with_base_delay(Duration::from_millis(200));
    let runner = PipelineRunner::from_config(
        config,
        Arc::new(backend),
        Arc::new(InMemoryRepository::new()),
    )?
    .with_event_handler(Arc::new(FnEventHandler(|event: Event| {
        if let Event::StageCompleted { name, progress, .. } = event {
            println!("  [{:>3}%] {}", progress, name);
        }
    })));

    let request = GenerationRequest::new("Backend engineer, async Rust")
        .with_stage(
            StageSpec::structured(
                "analysis",
                40,
                "Extract the requirements from: {input}",
                r#"{"skills": ["string"], "seniority": "string"}"#,
            )
            .with_description("Extract requirements"),
        )
        .with_stage(
            StageSpec::text("content", 60, "Write a cover letter covering {analysis}")
                .with_description("Draft the letter"),
        );

    let id = runner.submit(request).await?;
    println!("submitted {}", id);

    let result = runner.wait(id).await?;
    println!("\nanalysis: {}", result.output["analysis"]);
    println!("content:  {}", result.output["content"]);
    println!("tokens:   {} in {:?}", result.tokens_used, result.elapsed);

    Ok(())
}
