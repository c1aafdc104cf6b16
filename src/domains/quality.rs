//! Data quality: find missing values, grade them per field, propose fixes.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::{phase_output, records, round4};
use crate::broker::Domain;
use crate::errors::{BrokerError, PhaseError};
use crate::phase::{
    ChannelHandler, DomainContext, DomainManager, DomainPhase, GenerationStatus, PhaseProgram,
    ROUTING_ISSUES_KEY,
};
use crate::pipeline::CRITICAL_QUALITY_ISSUE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QualityPhase {
    Detection,
    Analysis,
    Resolution,
}

impl DomainPhase for QualityPhase {
    fn as_str(&self) -> &'static str {
        match self {
            QualityPhase::Detection => "detection",
            QualityPhase::Analysis => "analysis",
            QualityPhase::Resolution => "resolution",
        }
    }
}

/// Share of missing cells in a field at which it counts as critical.
const CRITICAL_RATIO: f64 = 0.5;
const MAJOR_RATIO: f64 = 0.2;

fn severity(ratio: f64) -> &'static str {
    if ratio >= CRITICAL_RATIO {
        "critical"
    } else if ratio >= MAJOR_RATIO {
        "major"
    } else {
        "minor"
    }
}

#[derive(Debug, Default)]
pub struct QualityProgram;

impl QualityProgram {
    fn detect(&self, ctx: &DomainContext<QualityPhase>) -> Result<Value, PhaseError> {
        let records = records(ctx, QualityPhase::Detection)?;
        let mut fields: Vec<String> = Vec::new();
        for record in records {
            let Some(object) = record.as_object() else {
                return Err(PhaseError::invalid_input(
                    QualityPhase::Detection.as_str(),
                    "every record must be an object",
                ));
            };
            for key in object.keys() {
                if !fields.contains(key) {
                    fields.push(key.clone());
                }
            }
        }

        let mut issues = Vec::new();
        for (index, record) in records.iter().enumerate() {
            for field in &fields {
                let kind = match record.get(field) {
                    None => "missing",
                    Some(Value::Null) => "null",
                    Some(Value::String(s)) if s.trim().is_empty() => "empty",
                    Some(_) => continue,
                };
                issues.push(json!({ "record": index, "field": field, "kind": kind }));
            }
        }

        Ok(json!({
            "record_count": records.len(),
            "fields": fields,
            "issues": issues,
        }))
    }

    fn analyse(&self, ctx: &DomainContext<QualityPhase>) -> Result<Value, PhaseError> {
        let phase = QualityPhase::Analysis;
        let detection = phase_output(ctx, QualityPhase::Detection, phase)?;
        let record_count = detection["record_count"].as_u64().unwrap_or_default();
        let fields: Vec<&str> = detection["fields"]
            .as_array()
            .map(|a| a.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let issues = detection["issues"].as_array().cloned().unwrap_or_default();

        let mut per_field: BTreeMap<&str, u64> = fields.iter().map(|f| (*f, 0)).collect();
        for issue in &issues {
            if let Some(count) = issue["field"].as_str().and_then(|f| per_field.get_mut(f)) {
                *count += 1;
            }
        }

        let cells = record_count * fields.len() as u64;
        let completeness = if cells == 0 {
            0.0
        } else {
            1.0 - issues.len() as f64 / cells as f64
        };

        let mut field_severity = Map::new();
        let mut critical_fields = Vec::new();
        for (field, missing) in &per_field {
            if *missing == 0 {
                continue;
            }
            let ratio = *missing as f64 / record_count.max(1) as f64;
            let grade = severity(ratio);
            if grade == "critical" {
                critical_fields.push(field.to_string());
            }
            field_severity.insert(
                field.to_string(),
                json!({ "missing": missing, "ratio": round4(ratio), "severity": grade }),
            );
        }

        Ok(json!({
            "completeness": round4(completeness),
            "empty": cells == 0,
            "field_severity": field_severity,
            "critical_fields": critical_fields,
        }))
    }

    fn resolve(&self, ctx: &DomainContext<QualityPhase>) -> Result<Value, PhaseError> {
        let analysis = phase_output(ctx, QualityPhase::Analysis, QualityPhase::Resolution)?;
        let mut fixes = Vec::new();
        if let Some(fields) = analysis["field_severity"].as_object() {
            for (field, grade) in fields {
                let action = match grade["severity"].as_str() {
                    Some("critical") => "exclude_field",
                    Some("major") => "impute_default",
                    _ => "drop_affected_records",
                };
                fixes.push(json!({ "field": field, "action": action }));
            }
        }

        let critical = analysis["empty"].as_bool().unwrap_or(false)
            || analysis["critical_fields"]
                .as_array()
                .is_some_and(|a| !a.is_empty());
        let routing_issues: Vec<&str> = if critical {
            vec![CRITICAL_QUALITY_ISSUE]
        } else {
            Vec::new()
        };

        Ok(json!({
            "fixes": fixes,
            "completeness": analysis["completeness"],
            ROUTING_ISSUES_KEY: routing_issues,
        }))
    }
}

#[async_trait]
impl PhaseProgram for QualityProgram {
    type Phase = QualityPhase;

    fn domain(&self) -> Domain {
        Domain::Quality
    }

    fn phases(&self) -> &'static [QualityPhase] {
        &[
            QualityPhase::Detection,
            QualityPhase::Analysis,
            QualityPhase::Resolution,
        ]
    }

    async fn run_phase(
        &self,
        phase: QualityPhase,
        ctx: &DomainContext<QualityPhase>,
    ) -> Result<Value, PhaseError> {
        match phase {
            QualityPhase::Detection => self.detect(ctx),
            QualityPhase::Analysis => self.analyse(ctx),
            QualityPhase::Resolution => self.resolve(ctx),
        }
    }
}

pub type QualityHandler = ChannelHandler<QualityProgram>;
pub type QualityManager = DomainManager<QualityProgram>;

impl DomainManager<QualityProgram> {
    pub fn initiate_quality_check(
        &self,
        pipeline_id: &str,
        data: Value,
        context: Value,
    ) -> Result<Uuid, BrokerError> {
        self.initiate(pipeline_id, data, context)
    }

    pub fn get_quality_status(&self, generation_id: Uuid) -> Option<GenerationStatus> {
        self.get_status(generation_id)
    }
}
