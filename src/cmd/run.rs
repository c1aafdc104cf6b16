//! Pipeline execution: `conduit run`.

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use conduit::broker::{MessageContent, ModuleIdentifier, ProcessingMessage};
use conduit::config::ConduitConfig;
use conduit::gates::{ApprovalGate, GateDecision, GatePrompt};
use conduit::pipeline::PipelineStatus;
use conduit::service::Runtime;
use conduit::ui::PipelineUI;

/// Read the input file as JSON.
fn load_input(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read input file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Input file is not valid JSON: {}", path.display()))
}

/// Ask the gate on a blocking thread, since dialoguer blocks on the terminal.
async fn ask(
    gate: ApprovalGate,
    stage: String,
    options: Vec<String>,
    preview: Value,
) -> Result<(ApprovalGate, GateDecision)> {
    tokio::task::spawn_blocking(move || {
        let mut gate = gate;
        let decision = gate.check(&GatePrompt {
            stage: &stage,
            options: &options,
            preview: &preview,
        })?;
        Ok((gate, decision))
    })
    .await
    .context("Approval prompt panicked")?
}

/// Follow pipeline events until it reaches a terminal status.
async fn follow(
    runtime: &Runtime,
    pipeline_id: &str,
    events: &mut mpsc::UnboundedReceiver<ProcessingMessage>,
    ui: &PipelineUI,
    mut gate: ApprovalGate,
) -> Result<String> {
    while let Some(message) = events.recv().await {
        if message.pipeline_id() != Some(pipeline_id) {
            continue;
        }
        match message.content {
            MessageContent::PipelineStatus {
                stage,
                status,
                progress,
                ..
            } => ui.stage_status(&stage, &status, progress),
            MessageContent::StageComplete { stage, issues, .. } => {
                ui.stage_complete(&stage, &issues)
            }
            MessageContent::StageFailed { stage, error, .. } => ui.stage_failed(&stage, &error),
            MessageContent::PipelineError { error, .. } => ui.stage_failed("pipeline", &error),
            MessageContent::ControlPointReached {
                control_point_id,
                stage,
                options,
                timeout_seconds,
                preview,
                ..
            } => {
                ui.control_point(&stage, &options, timeout_seconds);
                let (returned, decision) = ask(gate, stage, options, preview).await?;
                gate = returned;
                apply_decision(runtime, pipeline_id, control_point_id, decision);
            }
            MessageContent::ControlPointTimeout { stage, .. } => ui.control_point_timed_out(&stage),
            MessageContent::PipelineFinished { status, .. } => return Ok(status),
            MessageContent::Cancelled { .. } => {
                return Ok(PipelineStatus::Cancelled.as_str().to_string());
            }
            _ => {}
        }
    }
    bail!("Event stream closed before pipeline {} finished", pipeline_id)
}

fn apply_decision(runtime: &Runtime, pipeline_id: &str, control_point_id: Uuid, decision: GateDecision) {
    match decision {
        GateDecision::Chosen(option) | GateDecision::ChosenAll(option) => {
            if let Err(e) = runtime.decide(control_point_id, &option, json!({ "by": "cli" })) {
                warn!(control_point_id = %control_point_id, "decision not applied: {}", e);
            }
        }
        GateDecision::Aborted => {
            if let Err(e) = runtime
                .orchestrator()
                .cancel(pipeline_id, Some("aborted by operator".to_string()))
            {
                warn!(pipeline_id, "could not cancel pipeline: {}", e);
            }
        }
    }
}

pub async fn cmd_run(config: &ConduitConfig, input: &Path, timeout_secs: u64) -> Result<()> {
    let source = load_input(input)?;
    let metadata = json!({ "input": input.display().to_string() });

    let runtime = Runtime::from_config(config.toml.clone(), &config.config_dir)?;
    runtime.start()?;

    let (_, mut events) = runtime.broker().subscribe_channel(
        ModuleIdentifier::service("conduit_cli"),
        &["pipeline.#", "control_point.#"],
    )?;

    let ui = PipelineUI::new(
        runtime.orchestrator().graph().default_path_len() as u64,
        config.verbose,
    );
    let pipeline_id = runtime.orchestrator().submit(source, metadata).await?;
    ui.pipeline_started(&pipeline_id);
    info!(pipeline_id = %pipeline_id, input = %input.display(), "pipeline submitted");

    let gate = ApprovalGate::new(config.yes);
    let outcome = tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        follow(&runtime, &pipeline_id, &mut events, &ui, gate),
    )
    .await;

    let status = match outcome {
        Ok(status) => status?,
        Err(_) => {
            if let Err(e) = runtime
                .orchestrator()
                .cancel(&pipeline_id, Some("timed out".to_string()))
            {
                warn!(pipeline_id = %pipeline_id, "could not cancel pipeline: {}", e);
            }
            ui.finish("timed out");
            runtime.stop().await;
            bail!("Pipeline {} did not finish within {}s", pipeline_id, timeout_secs);
        }
    };
    ui.finish(&status);

    let report = runtime
        .staging()
        .latest_completed(&pipeline_id, "report")
        .and_then(|staged| {
            staged.payload["rendering_results"]["markdown"]
                .as_str()
                .map(str::to_string)
        });
    let errors = runtime
        .orchestrator()
        .get_status(&pipeline_id)
        .map(|state| state.errors)
        .unwrap_or_default();
    runtime.stop().await;

    if let Some(report) = report {
        println!();
        println!("{}", report);
    }

    if status != PipelineStatus::Completed.as_str() {
        for error in &errors {
            eprintln!("  {}: {}", error.stage, error.message);
        }
        bail!("Pipeline {} {}", pipeline_id, status);
    }
    Ok(())
}
