//! Decision making: weigh the options, rank them and, when configured, let a
//! person pick through a control point.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use super::{phase_output, round4, stage_results};
use crate::broker::Domain;
use crate::control_point::{ControlPointManager, ControlPointRequest};
use crate::errors::{BrokerError, ControlPointError, PhaseError};
use crate::phase::{
    ChannelHandler, DomainContext, DomainManager, DomainPhase, GenerationStatus, PhaseProgram,
    ROUTING_ISSUES_KEY,
};
use crate::pipeline::DECISION_REJECTED;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecisionPhase {
    Analysis,
    Evaluation,
    Approval,
}

impl DomainPhase for DecisionPhase {
    fn as_str(&self) -> &'static str {
        match self {
            DecisionPhase::Analysis => "analysis",
            DecisionPhase::Evaluation => "evaluation",
            DecisionPhase::Approval => "approval",
        }
    }
}

/// Option a decider can pick to turn the decision down.
pub const REJECT_OPTION: &str = "reject";

/// Ranked options offered at the approval control point.
const OFFERED_OPTIONS: usize = 3;

struct Approval {
    control_points: ControlPointManager,
    timeout: Duration,
}

#[derive(Default)]
pub struct DecisionProgram {
    approval: Option<Approval>,
}

impl DecisionProgram {
    /// Decide automatically for the best-scored option.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask a person through a control point before settling.
    pub fn with_approval(control_points: ControlPointManager, timeout: Duration) -> Self {
        Self {
            approval: Some(Approval {
                control_points,
                timeout,
            }),
        }
    }

    pub fn requires_approval(&self) -> bool {
        self.approval.is_some()
    }

    /// Options given explicitly, or derived from validated insights.
    fn options(ctx: &DomainContext<DecisionPhase>) -> Vec<Value> {
        if let Some(options) = ctx.input("options").and_then(Value::as_array) {
            return options
                .iter()
                .filter(|o| o.get("name").and_then(Value::as_str).is_some())
                .cloned()
                .collect();
        }
        stage_results(ctx, "insight", "validation")
            .and_then(|v| v["insights"].as_array())
            .map(|insights| {
                insights
                    .iter()
                    .map(|i| {
                        json!({
                            "name": format!(
                                "{}_{}",
                                i["kind"].as_str().unwrap_or("insight"),
                                i["field"].as_str().unwrap_or("unknown")
                            ),
                            "criteria": { "confidence": i["confidence"] },
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn analyse(&self, ctx: &DomainContext<DecisionPhase>) -> Result<Value, PhaseError> {
        let options = Self::options(ctx);
        if options.is_empty() {
            return Err(PhaseError::invalid_input(
                DecisionPhase::Analysis.as_str(),
                "no options to decide between",
            ));
        }

        let weights = match ctx.input("weights").and_then(Value::as_object) {
            Some(given) => given.clone(),
            None => {
                let mut criteria: Vec<String> = Vec::new();
                for option in &options {
                    if let Some(c) = option["criteria"].as_object() {
                        for key in c.keys() {
                            if !criteria.contains(key) {
                                criteria.push(key.clone());
                            }
                        }
                    }
                }
                let share = 1.0 / criteria.len().max(1) as f64;
                criteria
                    .into_iter()
                    .map(|c| (c, json!(round4(share))))
                    .collect::<Map<String, Value>>()
            }
        };
        Ok(json!({ "options": options, "weights": weights }))
    }

    fn evaluate(&self, ctx: &DomainContext<DecisionPhase>) -> Result<Value, PhaseError> {
        let analysis = phase_output(ctx, DecisionPhase::Analysis, DecisionPhase::Evaluation)?;
        let weights = analysis["weights"].as_object().cloned().unwrap_or_default();
        let mut ranked: Vec<(String, f64)> = analysis["options"]
            .as_array()
            .map(|options| {
                options
                    .iter()
                    .map(|o| {
                        let score = weights
                            .iter()
                            .map(|(k, w)| {
                                w.as_f64().unwrap_or_default()
                                    * o["criteria"][k].as_f64().unwrap_or_default()
                            })
                            .sum::<f64>();
                        (o["name"].as_str().unwrap_or_default().to_string(), round4(score))
                    })
                    .collect()
            })
            .unwrap_or_default();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let best = ranked.first().map(|(name, _)| name.clone());
        let ranked: Vec<Value> = ranked
            .into_iter()
            .map(|(name, score)| json!({ "name": name, "score": score }))
            .collect();
        Ok(json!({ "ranked": ranked, "best": best }))
    }

    async fn approve(&self, ctx: &DomainContext<DecisionPhase>) -> Result<Value, PhaseError> {
        let phase = DecisionPhase::Approval;
        let evaluation = phase_output(ctx, DecisionPhase::Evaluation, phase)?;
        let best = evaluation["best"]
            .as_str()
            .ok_or_else(|| PhaseError::failed(phase.as_str(), "nothing was ranked"))?;

        let Some(approval) = &self.approval else {
            return Ok(json!({
                "approved": true,
                "selected": best,
                "decided_by": "auto",
                ROUTING_ISSUES_KEY: [],
            }));
        };

        let mut offered: Vec<String> = evaluation["ranked"]
            .as_array()
            .map(|r| {
                r.iter()
                    .take(OFFERED_OPTIONS)
                    .filter_map(|o| o["name"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        offered.push(REJECT_OPTION.to_string());

        let control_point_error = |source: ControlPointError| PhaseError::ControlPoint {
            phase: phase.as_str().to_string(),
            source,
        };
        let request = ControlPointRequest::new(ctx.pipeline_id.clone(), Domain::Decision.as_str(), offered)
            .with_preview(json!({ "ranked": evaluation["ranked"] }))
            .with_timeout(approval.timeout)
            .with_correlation_id(ctx.correlation_id);
        let control_point_id = approval
            .control_points
            .create_control_point(request)
            .map_err(control_point_error)?;
        info!(pipeline_id = %ctx.pipeline_id, control_point_id = %control_point_id, "decision awaiting approval");

        let decision = approval
            .control_points
            .wait_for_decision(control_point_id)
            .await
            .map_err(control_point_error)?;

        if decision.option == REJECT_OPTION {
            return Ok(json!({
                "approved": false,
                "selected": Value::Null,
                "decided_by": "control_point",
                "control_point_id": control_point_id,
                "details": decision.details,
                ROUTING_ISSUES_KEY: [DECISION_REJECTED],
            }));
        }
        Ok(json!({
            "approved": true,
            "selected": decision.option,
            "decided_by": "control_point",
            "control_point_id": control_point_id,
            "details": decision.details,
            ROUTING_ISSUES_KEY: [],
        }))
    }
}

#[async_trait]
impl PhaseProgram for DecisionProgram {
    type Phase = DecisionPhase;

    fn domain(&self) -> Domain {
        Domain::Decision
    }

    fn phases(&self) -> &'static [DecisionPhase] {
        &[
            DecisionPhase::Analysis,
            DecisionPhase::Evaluation,
            DecisionPhase::Approval,
        ]
    }

    async fn run_phase(
        &self,
        phase: DecisionPhase,
        ctx: &DomainContext<DecisionPhase>,
    ) -> Result<Value, PhaseError> {
        match phase {
            DecisionPhase::Analysis => self.analyse(ctx),
            DecisionPhase::Evaluation => self.evaluate(ctx),
            DecisionPhase::Approval => self.approve(ctx).await,
        }
    }
}

pub type DecisionHandler = ChannelHandler<DecisionProgram>;
pub type DecisionManager = DomainManager<DecisionProgram>;

impl DomainManager<DecisionProgram> {
    pub fn initiate_decision(
        &self,
        pipeline_id: &str,
        data: Value,
        context: Value,
    ) -> Result<Uuid, BrokerError> {
        self.initiate(pipeline_id, data, context)
    }

    pub fn get_decision_status(&self, generation_id: Uuid) -> Option<GenerationStatus> {
        self.get_status(generation_id)
    }
}
