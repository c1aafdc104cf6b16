use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{DomainContext, DomainPhase, PhaseProgram, RunState};
use crate::broker::StepStatus;
use crate::errors::PhaseError;

/// A phase boundary crossed by a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseProgress<P> {
    pub phase: P,
    pub status: StepStatus,
    /// Percentage of the program done, 0..=100
    pub progress: u8,
}

/// Drives a [`PhaseProgram`] through its phases in order.
pub struct PhaseRunner<G: PhaseProgram> {
    program: Arc<G>,
}

impl<G: PhaseProgram> Clone for PhaseRunner<G> {
    fn clone(&self) -> Self {
        Self {
            program: Arc::clone(&self.program),
        }
    }
}

fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done * 100) / total).min(100) as u8
}

impl<G: PhaseProgram> PhaseRunner<G> {
    pub fn new(program: Arc<G>) -> Self {
        Self { program }
    }

    pub fn program(&self) -> &G {
        &self.program
    }

    /// Run every phase over `ctx`, calling `report` before and after each
    /// one. Returns the union of all phase outputs keyed `{phase}_results`.
    ///
    /// The first failing phase stops the run. Cancelling `cancel` stops it at
    /// the next suspension point with `PhaseError::Cancelled`.
    pub async fn run<F>(
        &self,
        ctx: &mut DomainContext<G::Phase>,
        cancel: &CancellationToken,
        mut report: F,
    ) -> Result<BTreeMap<String, Value>, PhaseError>
    where
        F: FnMut(PhaseProgress<G::Phase>) + Send,
    {
        let phases = self.program.phases();
        let total = phases.len();
        let domain = self.program.domain();

        for (index, &phase) in phases.iter().enumerate() {
            if cancel.is_cancelled() {
                ctx.set_state(RunState::Cancelled);
                return Err(PhaseError::Cancelled {
                    phase: phase.as_str().to_string(),
                });
            }

            ctx.set_state(RunState::Running(phase));
            report(PhaseProgress {
                phase,
                status: StepStatus::Started,
                progress: percent(index, total),
            });
            debug!(
                pipeline_id = %ctx.pipeline_id,
                domain = %domain,
                phase = phase.as_str(),
                "phase started"
            );

            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(PhaseError::Cancelled {
                    phase: phase.as_str().to_string(),
                }),
                result = self.program.run_phase(phase, ctx) => result,
            };

            match outcome {
                Ok(output) => {
                    ctx.record_output(phase, output);
                    report(PhaseProgress {
                        phase,
                        status: StepStatus::Completed,
                        progress: percent(index + 1, total),
                    });
                }
                Err(e @ PhaseError::Cancelled { .. }) => {
                    ctx.set_state(RunState::Cancelled);
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        pipeline_id = %ctx.pipeline_id,
                        domain = %domain,
                        phase = phase.as_str(),
                        error = %e,
                        "phase failed"
                    );
                    ctx.set_state(RunState::Failed(phase));
                    report(PhaseProgress {
                        phase,
                        status: StepStatus::Failed,
                        progress: percent(index, total),
                    });
                    return Err(e);
                }
            }
        }

        ctx.set_state(RunState::Completed);
        Ok(ctx.results().into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Domain;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Step {
        Count,
        Double,
        Stall,
    }

    impl DomainPhase for Step {
        fn as_str(&self) -> &'static str {
            match self {
                Step::Count => "count",
                Step::Double => "double",
                Step::Stall => "stall",
            }
        }
    }

    struct Counter {
        phases: &'static [Step],
        fail_on: Option<Step>,
    }

    #[async_trait]
    impl PhaseProgram for Counter {
        type Phase = Step;

        fn domain(&self) -> Domain {
            Domain::Insight
        }

        fn phases(&self) -> &'static [Step] {
            self.phases
        }

        async fn run_phase(&self, phase: Step, ctx: &DomainContext<Step>) -> Result<Value, PhaseError> {
            if self.fail_on == Some(phase) {
                return Err(PhaseError::failed(phase.as_str(), "boom"));
            }
            match phase {
                Step::Count => {
                    let n = ctx
                        .input("items")
                        .and_then(Value::as_array)
                        .map(|a| a.len())
                        .ok_or_else(|| PhaseError::invalid_input(phase.as_str(), "items missing"))?;
                    Ok(json!({ "count": n }))
                }
                Step::Double => {
                    let n = ctx
                        .previous()
                        .and_then(|v| v["count"].as_u64())
                        .unwrap_or_default();
                    Ok(json!({ "doubled": n * 2 }))
                }
                Step::Stall => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(Value::Null)
                }
            }
        }
    }

    fn context(data: Value) -> DomainContext<Step> {
        DomainContext::new("p1", Uuid::new_v4(), Uuid::new_v4(), data, Value::Null)
    }

    #[tokio::test]
    async fn test_phases_run_in_order_and_feed_forward() {
        let runner = PhaseRunner::new(Arc::new(Counter {
            phases: &[Step::Count, Step::Double],
            fail_on: None,
        }));
        let mut ctx = context(json!({"items": [1, 2, 3]}));
        let mut events = Vec::new();
        let results = runner
            .run(&mut ctx, &CancellationToken::new(), |p| events.push(p))
            .await
            .unwrap();

        assert_eq!(results["count_results"], json!({"count": 3}));
        assert_eq!(results["double_results"], json!({"doubled": 6}));
        assert_eq!(ctx.state, RunState::Completed);
        let seen: Vec<(Step, StepStatus, u8)> = events
            .iter()
            .map(|e| (e.phase, e.status, e.progress))
            .collect();
        assert_eq!(
            seen,
            vec![
                (Step::Count, StepStatus::Started, 0),
                (Step::Count, StepStatus::Completed, 50),
                (Step::Double, StepStatus::Started, 50),
                (Step::Double, StepStatus::Completed, 100),
            ]
        );
    }

    #[tokio::test]
    async fn test_failure_names_phase_and_stops_run() {
        let runner = PhaseRunner::new(Arc::new(Counter {
            phases: &[Step::Count, Step::Double],
            fail_on: Some(Step::Double),
        }));
        let mut ctx = context(json!({"items": []}));
        let mut events = Vec::new();
        let err = runner
            .run(&mut ctx, &CancellationToken::new(), |p| events.push(p))
            .await
            .unwrap_err();

        assert_eq!(err.phase(), "double");
        assert_eq!(ctx.state, RunState::Failed(Step::Double));
        assert_eq!(events.last().map(|e| e.status), Some(StepStatus::Failed));
        assert!(ctx.output(Step::Double).is_none());
    }

    #[tokio::test]
    async fn test_invalid_input_fails_first_phase() {
        let runner = PhaseRunner::new(Arc::new(Counter {
            phases: &[Step::Count],
            fail_on: None,
        }));
        let mut ctx = context(json!({}));
        let err = runner
            .run(&mut ctx, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, PhaseError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_running_phase() {
        let runner = PhaseRunner::new(Arc::new(Counter {
            phases: &[Step::Stall, Step::Count],
            fail_on: None,
        }));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let mut ctx = context(json!({"items": []}));
        let err = runner.run(&mut ctx, &cancel, |_| {}).await.unwrap_err();
        assert!(matches!(err, PhaseError::Cancelled { .. }));
        assert_eq!(ctx.state, RunState::Cancelled);
    }
}
