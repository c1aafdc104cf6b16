//! Insight generation: numeric field statistics turned into scored
//! statements, filtered by confidence.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use super::{phase_output, records, round4};
use crate::broker::Domain;
use crate::errors::{BrokerError, PhaseError};
use crate::phase::{
    ChannelHandler, DomainContext, DomainManager, DomainPhase, GenerationStatus, PhaseProgram,
    ROUTING_ISSUES_KEY,
};
use crate::pipeline::INSUFFICIENT_DATA;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InsightPhase {
    Analysis,
    Generation,
    Validation,
}

impl DomainPhase for InsightPhase {
    fn as_str(&self) -> &'static str {
        match self {
            InsightPhase::Analysis => "analysis",
            InsightPhase::Generation => "generation",
            InsightPhase::Validation => "validation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct FieldStats {
    count: usize,
    min: f64,
    max: f64,
    mean: f64,
    std_dev: f64,
    /// Mean of the second half minus mean of the first half
    drift: f64,
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn stats(values: &[f64]) -> FieldStats {
    let m = mean(values);
    let variance = if values.is_empty() {
        0.0
    } else {
        values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64
    };
    let half = values.len() / 2;
    let drift = if half == 0 {
        0.0
    } else {
        mean(&values[values.len() - half..]) - mean(&values[..half])
    };
    FieldStats {
        count: values.len(),
        min: values.iter().copied().fold(f64::INFINITY, f64::min),
        max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        mean: m,
        std_dev: variance.sqrt(),
        drift,
    }
}

#[derive(Debug)]
pub struct InsightProgram {
    min_confidence: f64,
}

impl Default for InsightProgram {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl InsightProgram {
    pub fn new(min_confidence: f64) -> Self {
        Self { min_confidence }
    }

    fn analyse(&self, ctx: &DomainContext<InsightPhase>) -> Result<Value, PhaseError> {
        let records = records(ctx, InsightPhase::Analysis)?;
        let mut columns: Vec<(String, Vec<f64>)> = Vec::new();
        for record in records {
            let Some(object) = record.as_object() else {
                continue;
            };
            for (key, value) in object {
                let Some(number) = value.as_f64() else {
                    continue;
                };
                match columns.iter_mut().find(|(k, _)| k == key) {
                    Some((_, values)) => values.push(number),
                    None => columns.push((key.clone(), vec![number])),
                }
            }
        }

        let mut fields = Map::new();
        for (key, values) in &columns {
            let s = stats(values);
            fields.insert(
                key.clone(),
                json!({
                    "count": s.count,
                    "min": round4(s.min),
                    "max": round4(s.max),
                    "mean": round4(s.mean),
                    "std_dev": round4(s.std_dev),
                    "drift": round4(s.drift),
                }),
            );
        }
        Ok(json!({ "record_count": records.len(), "fields": fields }))
    }

    fn generate(&self, ctx: &DomainContext<InsightPhase>) -> Result<Value, PhaseError> {
        let analysis = phase_output(ctx, InsightPhase::Analysis, InsightPhase::Generation)?;
        let record_count = analysis["record_count"].as_u64().unwrap_or_default().max(1) as f64;
        let mut insights = Vec::new();
        let Some(fields) = analysis["fields"].as_object() else {
            return Ok(json!({ "insights": insights }));
        };

        for (field, s) in fields {
            let count = s["count"].as_f64().unwrap_or_default();
            let coverage = (count / record_count).min(1.0);
            let (min, max, avg) = (
                s["min"].as_f64().unwrap_or_default(),
                s["max"].as_f64().unwrap_or_default(),
                s["mean"].as_f64().unwrap_or_default(),
            );
            insights.push(json!({
                "field": field,
                "kind": "summary",
                "text": format!("{} averages {} (range {} to {})", field, avg, min, max),
                "confidence": round4(coverage),
            }));

            let drift = s["drift"].as_f64().unwrap_or_default();
            let std_dev = s["std_dev"].as_f64().unwrap_or_default();
            if drift != 0.0 && count >= 2.0 {
                let strength = if std_dev > 0.0 {
                    (drift.abs() / std_dev).min(1.0)
                } else {
                    1.0
                };
                let direction = if drift > 0.0 { "increasing" } else { "decreasing" };
                insights.push(json!({
                    "field": field,
                    "kind": "trend",
                    "text": format!("{} is {} across the dataset", field, direction),
                    "confidence": round4(coverage * strength),
                }));
            }
        }
        Ok(json!({ "insights": insights }))
    }

    fn validate(&self, ctx: &DomainContext<InsightPhase>) -> Result<Value, PhaseError> {
        let generated = phase_output(ctx, InsightPhase::Generation, InsightPhase::Validation)?;
        let all = generated["insights"].as_array().cloned().unwrap_or_default();
        let (kept, rejected): (Vec<Value>, Vec<Value>) = all.into_iter().partition(|i| {
            i["confidence"].as_f64().unwrap_or_default() >= self.min_confidence
        });
        let routing_issues: Vec<&str> = if kept.is_empty() {
            vec![INSUFFICIENT_DATA]
        } else {
            Vec::new()
        };
        Ok(json!({
            "insights": kept,
            "rejected": rejected.len(),
            "min_confidence": self.min_confidence,
            ROUTING_ISSUES_KEY: routing_issues,
        }))
    }
}

#[async_trait]
impl PhaseProgram for InsightProgram {
    type Phase = InsightPhase;

    fn domain(&self) -> Domain {
        Domain::Insight
    }

    fn phases(&self) -> &'static [InsightPhase] {
        &[
            InsightPhase::Analysis,
            InsightPhase::Generation,
            InsightPhase::Validation,
        ]
    }

    async fn run_phase(
        &self,
        phase: InsightPhase,
        ctx: &DomainContext<InsightPhase>,
    ) -> Result<Value, PhaseError> {
        match phase {
            InsightPhase::Analysis => self.analyse(ctx),
            InsightPhase::Generation => self.generate(ctx),
            InsightPhase::Validation => self.validate(ctx),
        }
    }
}

pub type InsightHandler = ChannelHandler<InsightProgram>;
pub type InsightManager = DomainManager<InsightProgram>;

impl DomainManager<InsightProgram> {
    pub fn initiate_insight_generation(
        &self,
        pipeline_id: &str,
        data: Value,
        context: Value,
    ) -> Result<Uuid, BrokerError> {
        self.initiate(pipeline_id, data, context)
    }

    pub fn get_insight_status(&self, generation_id: Uuid) -> Option<GenerationStatus> {
        self.get_status(generation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::PhaseRunner;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    async fn run(program: InsightProgram, data: Value) -> BTreeMap<String, Value> {
        let runner = PhaseRunner::new(Arc::new(program));
        let mut ctx = DomainContext::new("p1", Uuid::new_v4(), Uuid::new_v4(), data, Value::Null);
        runner
            .run(&mut ctx, &CancellationToken::new(), |_| {})
            .await
            .unwrap()
    }

    #[test]
    fn test_stats() {
        let s = stats(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(s.count, 4);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 4.0);
        assert_eq!(s.mean, 2.5);
        assert_eq!(s.drift, 2.0);
        assert!((s.std_dev - 1.118).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_numeric_fields_produce_summary_and_trend() {
        let results = run(
            InsightProgram::default(),
            json!({"records": [
                {"sales": 10, "region": "n"},
                {"sales": 20, "region": "s"},
                {"sales": 30, "region": "e"},
                {"sales": 40, "region": "w"},
            ]}),
        )
        .await;

        let fields = &results["analysis_results"]["fields"];
        assert!(fields.get("region").is_none());
        assert_eq!(fields["sales"]["mean"], json!(25.0));

        let kept = results["validation_results"]["insights"].as_array().unwrap();
        let kinds: Vec<&str> = kept.iter().filter_map(|i| i["kind"].as_str()).collect();
        assert_eq!(kinds, vec!["summary", "trend"]);
        assert!(kept[1]["text"].as_str().unwrap().contains("increasing"));
        assert_eq!(results["validation_results"][ROUTING_ISSUES_KEY], json!([]));
    }

    #[tokio::test]
    async fn test_sparse_field_is_filtered_out() {
        let results = run(
            InsightProgram::new(0.6),
            json!({"records": [
                {"score": 5},
                {"note": "x"},
                {"note": "y"},
            ]}),
        )
        .await;
        assert_eq!(results["validation_results"]["insights"], json!([]));
        assert_eq!(results["validation_results"]["rejected"], json!(1));
        assert_eq!(
            results["validation_results"][ROUTING_ISSUES_KEY],
            json!([INSUFFICIENT_DATA])
        );
    }
}
