//! Reporting: gather every earlier stage into sections and render Markdown.

use async_trait::async_trait;
use serde_json::{Value, json};
use uuid::Uuid;

use super::{phase_output, stage_results};
use crate::broker::Domain;
use crate::errors::{BrokerError, PhaseError};
use crate::phase::{
    ChannelHandler, DomainContext, DomainManager, DomainPhase, GenerationStatus, PhaseProgram,
};
use crate::pipeline::SOURCE_KEY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportPhase {
    Assembly,
    Formatting,
    Rendering,
}

impl DomainPhase for ReportPhase {
    fn as_str(&self) -> &'static str {
        match self {
            ReportPhase::Assembly => "assembly",
            ReportPhase::Formatting => "formatting",
            ReportPhase::Rendering => "rendering",
        }
    }
}

const DEFAULT_TITLE: &str = "Pipeline report";

fn section(title: &str, lines: Vec<String>) -> Value {
    json!({ "title": title, "lines": lines })
}

fn quality_section(ctx: &DomainContext<ReportPhase>) -> Option<Value> {
    let analysis = stage_results(ctx, "quality", "analysis")?;
    let mut lines = vec![format!(
        "Completeness: {:.1}%",
        analysis["completeness"].as_f64().unwrap_or_default() * 100.0
    )];
    if let Some(fields) = analysis["field_severity"].as_object() {
        for (field, grade) in fields {
            lines.push(format!(
                "{}: {} missing ({})",
                field,
                grade["missing"],
                grade["severity"].as_str().unwrap_or("unknown")
            ));
        }
    }
    Some(section("Data quality", lines))
}

fn insight_section(ctx: &DomainContext<ReportPhase>) -> Option<Value> {
    let validation = stage_results(ctx, "insight", "validation")?;
    let lines = validation["insights"]
        .as_array()
        .map(|insights| {
            insights
                .iter()
                .filter_map(|i| i["text"].as_str())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let lines = if lines.is_empty() {
        vec!["No insight met the confidence threshold.".to_string()]
    } else {
        lines
    };
    Some(section("Insights", lines))
}

fn decision_section(ctx: &DomainContext<ReportPhase>) -> Option<Value> {
    let approval = stage_results(ctx, "decision", "approval")?;
    let line = match approval["selected"].as_str() {
        Some(selected) => format!(
            "Selected {} ({})",
            selected,
            approval["decided_by"].as_str().unwrap_or("auto")
        ),
        None => "The decision was rejected.".to_string(),
    };
    Some(section("Decision", vec![line]))
}

fn recommendation_section(ctx: &DomainContext<ReportPhase>) -> Option<Value> {
    let filtering = stage_results(ctx, "recommendation", "filtering")?;
    let lines = filtering["recommendations"]
        .as_array()
        .map(|recs| {
            recs.iter()
                .filter_map(|r| r["action"].as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Some(section("Recommendations", lines))
}

#[derive(Debug, Default)]
pub struct ReportProgram;

impl ReportProgram {
    fn assemble(&self, ctx: &DomainContext<ReportPhase>) -> Result<Value, PhaseError> {
        let title = ctx
            .context
            .get("title")
            .or_else(|| ctx.input("title"))
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_TITLE);

        let mut sections = Vec::new();
        if let Some(records) = ctx
            .data
            .get(SOURCE_KEY)
            .and_then(|s| s.get("records"))
            .and_then(Value::as_array)
        {
            sections.push(section("Source", vec![format!("{} records ingested", records.len())]));
        }
        sections.extend(
            [
                quality_section(ctx),
                insight_section(ctx),
                decision_section(ctx),
                recommendation_section(ctx),
            ]
            .into_iter()
            .flatten(),
        );

        let issues: Vec<String> = ctx
            .context
            .get("issues")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        if !issues.is_empty() {
            sections.push(section(
                "Routing",
                vec![format!("Reached the report early: {}", issues.join(", "))],
            ));
        }

        Ok(json!({ "title": title, "sections": sections }))
    }

    fn format(&self, ctx: &DomainContext<ReportPhase>) -> Result<Value, PhaseError> {
        let assembled = phase_output(ctx, ReportPhase::Assembly, ReportPhase::Formatting)?;
        let formatted: Vec<Value> = assembled["sections"]
            .as_array()
            .map(|sections| {
                sections
                    .iter()
                    .map(|s| {
                        let title = s["title"].as_str().unwrap_or_default();
                        let mut markdown = format!("## {}\n\n", title);
                        for line in s["lines"].as_array().into_iter().flatten() {
                            if let Some(line) = line.as_str() {
                                markdown.push_str("- ");
                                markdown.push_str(line);
                                markdown.push('\n');
                            }
                        }
                        json!({ "title": title, "markdown": markdown })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(json!({ "title": assembled["title"], "sections": formatted }))
    }

    fn render(&self, ctx: &DomainContext<ReportPhase>) -> Result<Value, PhaseError> {
        let formatted = phase_output(ctx, ReportPhase::Formatting, ReportPhase::Rendering)?;
        let title = formatted["title"].as_str().unwrap_or(DEFAULT_TITLE);
        let mut markdown = format!("# {}\n", title);
        for s in formatted["sections"].as_array().into_iter().flatten() {
            markdown.push('\n');
            markdown.push_str(s["markdown"].as_str().unwrap_or_default());
        }
        Ok(json!({
            "markdown": markdown,
            "section_count": formatted["sections"].as_array().map_or(0, Vec::len),
        }))
    }
}

#[async_trait]
impl PhaseProgram for ReportProgram {
    type Phase = ReportPhase;

    fn domain(&self) -> Domain {
        Domain::Report
    }

    fn phases(&self) -> &'static [ReportPhase] {
        &[
            ReportPhase::Assembly,
            ReportPhase::Formatting,
            ReportPhase::Rendering,
        ]
    }

    async fn run_phase(
        &self,
        phase: ReportPhase,
        ctx: &DomainContext<ReportPhase>,
    ) -> Result<Value, PhaseError> {
        match phase {
            ReportPhase::Assembly => self.assemble(ctx),
            ReportPhase::Formatting => self.format(ctx),
            ReportPhase::Rendering => self.render(ctx),
        }
    }
}

pub type ReportHandler = ChannelHandler<ReportProgram>;
pub type ReportManager = DomainManager<ReportProgram>;

impl DomainManager<ReportProgram> {
    pub fn initiate_report(
        &self,
        pipeline_id: &str,
        data: Value,
        context: Value,
    ) -> Result<Uuid, BrokerError> {
        self.initiate(pipeline_id, data, context)
    }

    pub fn get_report_status(&self, generation_id: Uuid) -> Option<GenerationStatus> {
        self.get_status(generation_id)
    }
}
