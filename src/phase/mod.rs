//! Generic phase machinery shared by every domain.
//!
//! A [`PhaseProgram`] names its ordered phases and runs one at a time. The
//! [`PhaseRunner`] drives a program over a [`DomainContext`], the
//! [`ChannelHandler`] runs it in response to broker messages and the
//! [`DomainManager`] fronts it towards callers, the orchestrator and the
//! repository.

mod context;
mod handler;
mod manager;
mod runner;

use async_trait::async_trait;
use serde_json::Value;
use std::fmt::Debug;
use std::hash::Hash;

use crate::broker::Domain;
use crate::errors::PhaseError;

pub use context::{DomainContext, RunState};
pub use handler::ChannelHandler;
pub use manager::{DomainManager, GenerationState, GenerationStatus};
pub use runner::{PhaseProgress, PhaseRunner};

/// A step of a domain program.
pub trait DomainPhase: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    fn as_str(&self) -> &'static str;
}

/// Key under which a phase's output appears in the final results.
pub fn results_key<P: DomainPhase>(phase: P) -> String {
    format!("{}_results", phase.as_str())
}

/// Key a phase uses to report issues that should steer routing.
pub const ROUTING_ISSUES_KEY: &str = "routing_issues";

/// The per-domain work, one phase at a time.
#[async_trait]
pub trait PhaseProgram: Send + Sync + 'static {
    type Phase: DomainPhase;

    fn domain(&self) -> Domain;

    /// Phases in execution order.
    fn phases(&self) -> &'static [Self::Phase];

    /// Run one phase. The context carries the start input and every output
    /// produced so far.
    async fn run_phase(
        &self,
        phase: Self::Phase,
        ctx: &DomainContext<Self::Phase>,
    ) -> Result<Value, PhaseError>;
}
