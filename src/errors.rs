//! Typed error hierarchy for the conduit core.
//!
//! One enum per subsystem:
//! - `BrokerError`: subscription registration and message delivery
//! - `ControlPointError`: approval gates and their decisions
//! - `StagingError`: staged intermediate data
//! - `OrchestratorError`: pipeline state and routing
//! - `PhaseError`: per-phase execution failures inside a domain handler
//! - `RepositoryError`: calls into persistence collaborators

use thiserror::Error;
use uuid::Uuid;

use crate::retry::Retryable;

/// Errors from the message broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Invalid subscription: {0}")]
    Subscription(String),

    #[error("Delivery to {subscriber} failed: {message}")]
    Delivery { subscriber: String, message: String },

    #[error("Broker is not running")]
    NotRunning,
}

impl Retryable for BrokerError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Delivery { .. } | Self::NotRunning)
    }
}

/// Errors from the control-point manager.
#[derive(Debug, Error)]
pub enum ControlPointError {
    #[error("Control point {0} not found")]
    NotFound(Uuid),

    #[error("Invalid decision '{decision}' for control point {id}: {reason}")]
    InvalidDecision {
        id: Uuid,
        decision: String,
        reason: String,
    },

    #[error("Control point {0} is already resolved")]
    AlreadyResolved(Uuid),

    #[error("Control point {0} timed out before a decision arrived")]
    Timeout(Uuid),

    #[error("Control point {0} was cancelled with its pipeline")]
    Cancelled(Uuid),

    #[error("Invalid control point request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Errors from the staging manager.
#[derive(Debug, Error)]
pub enum StagingError {
    #[error("Staged data {0} not found or expired")]
    NotFound(Uuid),

    #[error(transparent)]
    ControlPoint(#[from] ControlPointError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Errors from the pipeline orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("No route from stage '{stage}' of pipeline {pipeline_id} (issues: {issues:?})")]
    Routing {
        pipeline_id: String,
        stage: String,
        issues: Vec<String>,
    },

    #[error("Pipeline {0} not found")]
    PipelineNotFound(String),

    #[error("Pipeline {pipeline_id} is already {status}")]
    InvalidTransition { pipeline_id: String, status: String },

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl Retryable for OrchestratorError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Broker(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Errors from a single phase execution.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Phase {phase} failed: {message}")]
    Failed { phase: String, message: String },

    #[error("Phase {phase} received invalid input: {message}")]
    InvalidInput { phase: String, message: String },

    #[error("Phase {phase} control point failed: {source}")]
    ControlPoint {
        phase: String,
        #[source]
        source: ControlPointError,
    },

    #[error("Phase {phase} was cancelled")]
    Cancelled { phase: String },
}

impl PhaseError {
    /// Name of the phase that raised the error.
    pub fn phase(&self) -> &str {
        match self {
            Self::Failed { phase, .. }
            | Self::InvalidInput { phase, .. }
            | Self::ControlPoint { phase, .. }
            | Self::Cancelled { phase } => phase,
        }
    }

    pub fn failed(phase: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            phase: phase.into(),
            message: message.into(),
        }
    }

    pub fn invalid_input(phase: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            phase: phase.into(),
            message: message.into(),
        }
    }
}

/// Invalid input and control points that already resolved
/// fail the same way on every attempt.
impl Retryable for PhaseError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Failed { .. } => true,
            Self::ControlPoint {
                source: ControlPointError::Broker(e),
                ..
            } => e.is_retryable(),
            Self::InvalidInput { .. } | Self::ControlPoint { .. } | Self::Cancelled { .. } => false,
        }
    }
}

/// Errors from repository collaborators.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Repository call {operation} exceeded {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("Repository I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Repository serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Repository lock poisoned")]
    LockPoisoned,

    #[error("Repository task failed: {0}")]
    Join(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_error_subscription_is_not_retryable() {
        let err = BrokerError::Subscription("empty pattern set".into());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("empty pattern set"));
    }

    #[test]
    fn broker_error_not_running_is_retryable() {
        assert!(BrokerError::NotRunning.is_retryable());
        let delivery = BrokerError::Delivery {
            subscriber: "quality.handler.quality_handler.0".into(),
            message: "boom".into(),
        };
        assert!(delivery.is_retryable());
    }

    #[test]
    fn control_point_error_invalid_decision_carries_reason() {
        let id = Uuid::new_v4();
        let err = ControlPointError::InvalidDecision {
            id,
            decision: "maybe".into(),
            reason: "not an allowed option".into(),
        };
        let text = err.to_string();
        assert!(text.contains("maybe"));
        assert!(text.contains("not an allowed option"));
        assert!(text.contains(&id.to_string()));
    }

    #[test]
    fn staging_error_converts_from_control_point_error() {
        let id = Uuid::new_v4();
        let err: StagingError = ControlPointError::NotFound(id).into();
        match err {
            StagingError::ControlPoint(ControlPointError::NotFound(got)) => assert_eq!(got, id),
            other => panic!("Expected ControlPoint(NotFound), got {:?}", other),
        }
    }

    #[test]
    fn orchestrator_error_retryable_only_for_broker_io() {
        let routing = OrchestratorError::Routing {
            pipeline_id: "p1".into(),
            stage: "quality".into(),
            issues: vec![],
        };
        assert!(!routing.is_retryable());
        let broker: OrchestratorError = BrokerError::NotRunning.into();
        assert!(broker.is_retryable());
    }

    #[test]
    fn phase_error_reports_phase_name() {
        let err = PhaseError::failed("detection", "no records");
        assert_eq!(err.phase(), "detection");
        let err = PhaseError::ControlPoint {
            phase: "approval".into(),
            source: ControlPointError::Timeout(Uuid::new_v4()),
        };
        assert_eq!(err.phase(), "approval");
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn phase_error_retryable_only_for_transient_failures() {
        assert!(PhaseError::failed("detection", "flaky source").is_retryable());
        assert!(!PhaseError::invalid_input("analysis", "no records").is_retryable());
        let gate = |source| PhaseError::ControlPoint {
            phase: "approval".into(),
            source,
        };
        assert!(!gate(ControlPointError::Timeout(Uuid::new_v4())).is_retryable());
        assert!(!gate(ControlPointError::Cancelled(Uuid::new_v4())).is_retryable());
        assert!(gate(ControlPointError::Broker(BrokerError::NotRunning)).is_retryable());
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&BrokerError::NotRunning);
        assert_std_error(&ControlPointError::AlreadyResolved(Uuid::new_v4()));
        assert_std_error(&StagingError::NotFound(Uuid::new_v4()));
        assert_std_error(&OrchestratorError::PipelineNotFound("p1".into()));
        assert_std_error(&PhaseError::Cancelled {
            phase: "x".into(),
        });
        assert_std_error(&RepositoryError::LockPoisoned);
    }
}
