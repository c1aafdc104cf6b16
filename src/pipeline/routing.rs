//! Static stage routing graph.
//!
//! Edges are keyed by `(stage, issue)`. An issue-specific edge wins over the
//! stage's default edge; the default applies only when no reported issue has
//! an edge of its own.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::broker::Domain;
use crate::config::RouteOverride;

pub const INGESTION_STAGE: &str = "ingestion";
pub const TERMINAL_STAGE: &str = "complete";

/// Issue raised by the quality stage when the data is too broken to analyse.
pub const CRITICAL_QUALITY_ISSUE: &str = "critical_quality_issue";
/// Issue raised by the insight stage when nothing survives validation.
pub const INSUFFICIENT_DATA: &str = "insufficient_data";
/// Issue raised by the decision stage when the outcome is a rejection.
pub const DECISION_REJECTED: &str = "rejected";

/// The domain a stage name refers to, if any.
pub fn stage_domain(stage: &str) -> Option<Domain> {
    Domain::all().iter().copied().find(|d| d.as_str() == stage)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct StageEdges {
    default: Vec<String>,
    by_issue: BTreeMap<String, Vec<String>>,
}

/// One edge as listed by [`RoutingGraph::edges`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteEdge {
    pub from: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue: Option<String>,
    pub to: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingGraph {
    edges: BTreeMap<String, StageEdges>,
}

impl RoutingGraph {
    /// An empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// ingestion → quality → insight → decision → recommendation → report → complete,
    /// with short-cuts to the report for critical quality issues, insufficient
    /// data and rejected decisions.
    pub fn standard() -> Self {
        Self::new()
            .with_edge(INGESTION_STAGE, None, &["quality"])
            .with_edge("quality", None, &["insight"])
            .with_edge("quality", Some(CRITICAL_QUALITY_ISSUE), &["report"])
            .with_edge("insight", None, &["decision"])
            .with_edge("insight", Some(INSUFFICIENT_DATA), &["report"])
            .with_edge("decision", None, &["recommendation"])
            .with_edge("decision", Some(DECISION_REJECTED), &["report"])
            .with_edge("recommendation", None, &["report"])
            .with_edge("report", None, &[TERMINAL_STAGE])
    }

    /// The standard graph with configured overrides applied on top.
    pub fn with_overrides(overrides: &[RouteOverride]) -> Self {
        let mut graph = Self::standard();
        for route in overrides {
            let to: Vec<&str> = route.to.iter().map(String::as_str).collect();
            graph.set_edge(&route.from, route.issue.as_deref(), &to);
        }
        graph
    }

    pub fn with_edge(mut self, from: &str, issue: Option<&str>, to: &[&str]) -> Self {
        self.set_edge(from, issue, to);
        self
    }

    /// Insert or replace an edge.
    pub fn set_edge(&mut self, from: &str, issue: Option<&str>, to: &[&str]) {
        let targets: Vec<String> = to.iter().map(|s| s.to_string()).collect();
        let edges = self.edges.entry(from.to_string()).or_default();
        match issue {
            Some(issue) => {
                edges.by_issue.insert(issue.to_string(), targets);
            }
            None => edges.default = targets,
        }
    }

    /// Next stages after `stage` given the detected issues, deduplicated in
    /// order. Empty when nothing matches.
    pub fn resolve(&self, stage: &str, issues: &[String]) -> Vec<String> {
        let Some(edges) = self.edges.get(stage) else {
            return Vec::new();
        };
        let mut targets: Vec<String> = Vec::new();
        for issue in issues {
            if let Some(to) = edges.by_issue.get(issue) {
                for target in to {
                    if !targets.contains(target) {
                        targets.push(target.clone());
                    }
                }
            }
        }
        if targets.is_empty() {
            targets = edges.default.clone();
        }
        targets
    }

    /// Number of stages between ingestion and the terminal stage along
    /// default edges.
    pub fn default_path_len(&self) -> usize {
        let mut count = 0;
        let mut visited: Vec<&str> = Vec::new();
        let mut stage = INGESTION_STAGE;
        while let Some(next) = self
            .edges
            .get(stage)
            .and_then(|e| e.default.first())
            .map(String::as_str)
        {
            if next == TERMINAL_STAGE || visited.contains(&next) {
                break;
            }
            visited.push(next);
            count += 1;
            stage = next;
        }
        count.max(1)
    }

    pub fn edges(&self) -> Vec<RouteEdge> {
        let mut out = Vec::new();
        for (from, edges) in &self.edges {
            if !edges.default.is_empty() {
                out.push(RouteEdge {
                    from: from.clone(),
                    issue: None,
                    to: edges.default.clone(),
                });
            }
            for (issue, to) in &edges.by_issue {
                out.push(RouteEdge {
                    from: from.clone(),
                    issue: Some(issue.clone()),
                    to: to.clone(),
                });
            }
        }
        out
    }
}
