//! Pipeline state, stage routing and the orchestrator that drives them.

mod orchestrator;
pub mod routing;
pub mod state;

pub use orchestrator::{PipelineOrchestrator, SOURCE_KEY, StageResults};
pub use routing::{
    CRITICAL_QUALITY_ISSUE, DECISION_REJECTED, INGESTION_STAGE, INSUFFICIENT_DATA, RouteEdge,
    RoutingGraph, TERMINAL_STAGE, stage_domain,
};
pub use state::{AwaitingApproval, PipelineState, PipelineStatus, StageError};
