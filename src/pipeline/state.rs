//! Per-pipeline state tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::routing::INGESTION_STAGE;

/// Overall status of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    #[default]
    Pending,
    Running,
    /// Waiting for a staged result to be approved
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Pending => "pending",
            PipelineStatus::Running => "running",
            PipelineStatus::Paused => "paused",
            PipelineStatus::Completed => "completed",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageError {
    pub stage: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// A stage result held back until its staged record is approved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwaitingApproval {
    pub stage_id: Uuid,
    pub stage: String,
    pub issues: Vec<String>,
}

/// Snapshot-able state of one pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub pipeline_id: String,
    /// Shared by every message the orchestrator emits for this pipeline
    pub correlation_id: Uuid,
    pub current_stage: String,
    pub status: PipelineStatus,
    /// Fraction of routed stages finished, 0.0..=1.0
    pub progress: f64,
    pub completed_stages: Vec<String>,
    pub errors: Vec<StageError>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub awaiting: Option<AwaitingApproval>,
    /// Number of stages on the expected route, used for progress
    pub total_stages: usize,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl PipelineState {
    pub fn new(pipeline_id: impl Into<String>, metadata: Value, total_stages: usize) -> Self {
        let now = Utc::now();
        Self {
            pipeline_id: pipeline_id.into(),
            correlation_id: Uuid::new_v4(),
            current_stage: INGESTION_STAGE.to_string(),
            status: PipelineStatus::Running,
            progress: 0.0,
            completed_stages: Vec::new(),
            errors: Vec::new(),
            metadata,
            awaiting: None,
            total_stages: total_stages.max(1),
            started_at: now,
            updated_at: now,
            ended_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn raise_progress(&mut self, value: f64) {
        if self.is_terminal() {
            return;
        }
        let value = value.clamp(0.0, 1.0);
        if value > self.progress {
            self.progress = value;
        }
    }

    /// Record a finished stage. Returns false if it was already recorded.
    pub fn complete_stage(&mut self, stage: &str) -> bool {
        self.updated_at = Utc::now();
        if self.completed_stages.iter().any(|s| s == stage) {
            return false;
        }
        self.completed_stages.push(stage.to_string());
        let done = self
            .completed_stages
            .iter()
            .filter(|s| s.as_str() != INGESTION_STAGE)
            .count();
        self.raise_progress(done as f64 / self.total_stages as f64);
        true
    }

    /// Fold a stage's own progress (0..=100) into the pipeline progress.
    pub fn record_stage_progress(&mut self, stage: &str, percent: u8) {
        self.updated_at = Utc::now();
        if self.completed_stages.iter().any(|s| s == stage) {
            return;
        }
        let done = self
            .completed_stages
            .iter()
            .filter(|s| s.as_str() != INGESTION_STAGE)
            .count() as f64;
        let partial = f64::from(percent.min(100)) / 100.0;
        self.raise_progress((done + partial) / self.total_stages as f64);
    }

    pub fn transition_to(&mut self, stage: &str) {
        self.current_stage = stage.to_string();
        self.updated_at = Utc::now();
    }

    pub fn pause(&mut self, awaiting: AwaitingApproval) {
        self.status = PipelineStatus::Paused;
        self.awaiting = Some(awaiting);
        self.updated_at = Utc::now();
    }

    /// Leave the paused state, returning what was awaited.
    pub fn resume(&mut self) -> Option<AwaitingApproval> {
        if self.status == PipelineStatus::Paused {
            self.status = PipelineStatus::Running;
        }
        self.updated_at = Utc::now();
        self.awaiting.take()
    }

    pub fn record_error(&mut self, stage: &str, message: impl Into<String>) {
        let now = Utc::now();
        self.errors.push(StageError {
            stage: stage.to_string(),
            message: message.into(),
            at: now,
        });
        self.updated_at = now;
    }

    /// Move to a terminal status. Returns false if already terminal.
    pub fn finish(&mut self, status: PipelineStatus) -> bool {
        if self.is_terminal() || !status.is_terminal() {
            return false;
        }
        if status == PipelineStatus::Completed {
            self.progress = 1.0;
        }
        let now = Utc::now();
        self.status = status;
        self.awaiting = None;
        self.updated_at = now;
        self.ended_at = Some(now);
        true
    }
}
