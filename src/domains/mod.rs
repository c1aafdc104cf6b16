//! The five domain programs run by the pipeline.
//!
//! Each program is a deterministic JSON transform over its start input: the
//! ingested source under `source` and earlier stage results keyed by stage.

pub mod decision;
pub mod insight;
pub mod quality;
pub mod recommendation;
pub mod report;

use serde_json::Value;

use crate::errors::PhaseError;
use crate::phase::{DomainContext, DomainPhase};

pub use decision::{DecisionHandler, DecisionManager, DecisionPhase, DecisionProgram};
pub use insight::{InsightHandler, InsightManager, InsightPhase, InsightProgram};
pub use quality::{QualityHandler, QualityManager, QualityPhase, QualityProgram};
pub use recommendation::{
    RecommendationHandler, RecommendationManager, RecommendationPhase, RecommendationProgram,
};
pub use report::{ReportHandler, ReportManager, ReportPhase, ReportProgram};

/// The `records` array of the input.
fn records<P: DomainPhase>(ctx: &DomainContext<P>, phase: P) -> Result<&Vec<Value>, PhaseError> {
    ctx.input("records")
        .and_then(Value::as_array)
        .ok_or_else(|| PhaseError::invalid_input(phase.as_str(), "input has no `records` array"))
}

/// Output of an earlier phase of the same run.
fn phase_output<P: DomainPhase>(ctx: &DomainContext<P>, earlier: P, phase: P) -> Result<&Value, PhaseError> {
    ctx.output(earlier).ok_or_else(|| {
        PhaseError::failed(
            phase.as_str(),
            format!("{} output is missing", earlier.as_str()),
        )
    })
}

/// One phase's results from an earlier stage, e.g. `insight` / `validation`.
fn stage_results<'a, P: DomainPhase>(ctx: &'a DomainContext<P>, stage: &str, phase: &str) -> Option<&'a Value> {
    ctx.data.get(stage)?.get(format!("{}_results", phase))
}

/// Round to four decimals so outputs stay stable across platforms.
fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
