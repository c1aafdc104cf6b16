//! Recommendations: candidate actions from insights and the decision,
//! ranked and cut to the top k.

use async_trait::async_trait;
use serde_json::{Value, json};
use uuid::Uuid;

use super::{phase_output, round4, stage_results};
use crate::broker::Domain;
use crate::errors::{BrokerError, PhaseError};
use crate::phase::{
    ChannelHandler, DomainContext, DomainManager, DomainPhase, GenerationStatus, PhaseProgram,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecommendationPhase {
    Generation,
    Ranking,
    Filtering,
}

impl DomainPhase for RecommendationPhase {
    fn as_str(&self) -> &'static str {
        match self {
            RecommendationPhase::Generation => "generation",
            RecommendationPhase::Ranking => "ranking",
            RecommendationPhase::Filtering => "filtering",
        }
    }
}

#[derive(Debug)]
pub struct RecommendationProgram {
    top_k: usize,
}

impl Default for RecommendationProgram {
    fn default() -> Self {
        Self::new(5)
    }
}

impl RecommendationProgram {
    pub fn new(top_k: usize) -> Self {
        Self { top_k }
    }

    fn generate(&self, ctx: &DomainContext<RecommendationPhase>) -> Result<Value, PhaseError> {
        let mut candidates = Vec::new();

        if let Some(approval) = stage_results(ctx, "decision", "approval") {
            if let Some(selected) = approval["selected"].as_str() {
                candidates.push(json!({
                    "action": format!("Proceed with {}", selected),
                    "source": "decision",
                    "score": 1.0,
                }));
            }
        }

        let insights = stage_results(ctx, "insight", "validation")
            .and_then(|v| v["insights"].as_array())
            .cloned()
            .unwrap_or_default();
        for insight in &insights {
            let field = insight["field"].as_str().unwrap_or("data");
            let action = match insight["kind"].as_str() {
                Some("trend") => format!("Monitor the trend in {}", field),
                _ => format!("Review {}: {}", field, insight["text"].as_str().unwrap_or_default()),
            };
            candidates.push(json!({
                "action": action,
                "source": "insight",
                "score": round4(insight["confidence"].as_f64().unwrap_or_default() * 0.9),
            }));
        }

        if let Some(fixes) = stage_results(ctx, "quality", "resolution").and_then(|v| v["fixes"].as_array()) {
            for fix in fixes {
                candidates.push(json!({
                    "action": format!(
                        "Apply {} to {}",
                        fix["action"].as_str().unwrap_or("a fix"),
                        fix["field"].as_str().unwrap_or("data")
                    ),
                    "source": "quality",
                    "score": 0.5,
                }));
            }
        }

        if let Some(extra) = ctx.input("candidates").and_then(Value::as_array) {
            candidates.extend(extra.iter().filter(|c| c["action"].is_string()).cloned());
        }

        Ok(json!({ "candidates": candidates }))
    }

    fn rank(&self, ctx: &DomainContext<RecommendationPhase>) -> Result<Value, PhaseError> {
        let generated = phase_output(ctx, RecommendationPhase::Generation, RecommendationPhase::Ranking)?;
        let mut candidates = generated["candidates"].as_array().cloned().unwrap_or_default();
        candidates.sort_by(|a, b| {
            let score = |v: &Value| v["score"].as_f64().unwrap_or_default();
            score(b)
                .total_cmp(&score(a))
                .then_with(|| a["action"].as_str().cmp(&b["action"].as_str()))
        });
        for (rank, candidate) in candidates.iter_mut().enumerate() {
            if let Some(obj) = candidate.as_object_mut() {
                obj.insert("rank".into(), json!(rank + 1));
            }
        }
        Ok(json!({ "ranked": candidates }))
    }

    fn filter(&self, ctx: &DomainContext<RecommendationPhase>) -> Result<Value, PhaseError> {
        let ranked = phase_output(ctx, RecommendationPhase::Ranking, RecommendationPhase::Filtering)?;
        let all = ranked["ranked"].as_array().cloned().unwrap_or_default();
        let dropped = all.len().saturating_sub(self.top_k);
        let kept: Vec<Value> = all.into_iter().take(self.top_k).collect();
        Ok(json!({ "recommendations": kept, "dropped": dropped, "top_k": self.top_k }))
    }
}

#[async_trait]
impl PhaseProgram for RecommendationProgram {
    type Phase = RecommendationPhase;

    fn domain(&self) -> Domain {
        Domain::Recommendation
    }

    fn phases(&self) -> &'static [RecommendationPhase] {
        &[
            RecommendationPhase::Generation,
            RecommendationPhase::Ranking,
            RecommendationPhase::Filtering,
        ]
    }

    async fn run_phase(
        &self,
        phase: RecommendationPhase,
        ctx: &DomainContext<RecommendationPhase>,
    ) -> Result<Value, PhaseError> {
        match phase {
            RecommendationPhase::Generation => self.generate(ctx),
            RecommendationPhase::Ranking => self.rank(ctx),
            RecommendationPhase::Filtering => self.filter(ctx),
        }
    }
}

pub type RecommendationHandler = ChannelHandler<RecommendationProgram>;
pub type RecommendationManager = DomainManager<RecommendationProgram>;

impl DomainManager<RecommendationProgram> {
    pub fn initiate_recommendation(
        &self,
        pipeline_id: &str,
        data: Value,
        context: Value,
    ) -> Result<Uuid, BrokerError> {
        self.initiate(pipeline_id, data, context)
    }

    pub fn get_recommendation_status(&self, generation_id: Uuid) -> Option<GenerationStatus> {
        self.get_status(generation_id)
    }
}
