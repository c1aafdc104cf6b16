//! The message envelope: the only ABI shared with collaborators.
//!
//! `message_type` is a closed enumeration rendered as `"{namespace}.{event}"`
//! (for example `quality.start` or `control_point.reached`). `content` is a
//! tagged variant per message type rather than an open map.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::identifier::ModuleIdentifier;

/// Envelope schema version.
pub const MESSAGE_VERSION: u16 = 1;

/// The five processing domains driven by phase managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Quality,
    Insight,
    Decision,
    Recommendation,
    Report,
}

impl Domain {
    pub fn all() -> &'static [Domain] {
        &[
            Domain::Quality,
            Domain::Insight,
            Domain::Decision,
            Domain::Recommendation,
            Domain::Report,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Quality => "quality",
            Domain::Insight => "insight",
            Domain::Decision => "decision",
            Domain::Recommendation => "recommendation",
            Domain::Report => "report",
        }
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Domain {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "quality" => Ok(Domain::Quality),
            "insight" => Ok(Domain::Insight),
            "decision" => Ok(Domain::Decision),
            "recommendation" => Ok(Domain::Recommendation),
            "report" => Ok(Domain::Report),
            _ => anyhow::bail!(
                "Invalid domain '{}'. Valid values: quality, insight, decision, recommendation, report",
                s
            ),
        }
    }
}

/// Events every domain exposes on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainEvent {
    Start,
    StatusUpdate,
    Complete,
    Error,
    /// An error reported by a collaborator, fed into the handler's recovery loop
    ErrorReport,
    /// Recovery notice sent back to the component that reported an error
    Recovery,
}

impl DomainEvent {
    pub fn all() -> &'static [DomainEvent] {
        &[
            DomainEvent::Start,
            DomainEvent::StatusUpdate,
            DomainEvent::Complete,
            DomainEvent::Error,
            DomainEvent::ErrorReport,
            DomainEvent::Recovery,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DomainEvent::Start => "start",
            DomainEvent::StatusUpdate => "status_update",
            DomainEvent::Complete => "complete",
            DomainEvent::Error => "error",
            DomainEvent::ErrorReport => "error_report",
            DomainEvent::Recovery => "recovery",
        }
    }
}

/// Closed enumeration of every message type on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum MessageType {
    Domain(Domain, DomainEvent),
    ControlPointReached,
    ControlPointDecisionApplied,
    ControlPointTimeout,
    StagingApproved,
    StagingRejected,
    PipelineIngestionStart,
    PipelineStageTransition,
    PipelineStatusUpdate,
    PipelineStageComplete,
    PipelineStageFailed,
    PipelineFinished,
    PipelineCancelled,
    PipelineError,
    DeliveryFailed,
}

const FIXED_TYPES: &[(MessageType, &str)] = &[
    (MessageType::ControlPointReached, "control_point.reached"),
    (
        MessageType::ControlPointDecisionApplied,
        "control_point.decision_applied",
    ),
    (MessageType::ControlPointTimeout, "control_point.timeout"),
    (MessageType::StagingApproved, "staging.approved"),
    (MessageType::StagingRejected, "staging.rejected"),
    (MessageType::PipelineIngestionStart, "pipeline.ingestion_start"),
    (MessageType::PipelineStageTransition, "pipeline.stage_transition"),
    (MessageType::PipelineStatusUpdate, "pipeline.status_update"),
    (MessageType::PipelineStageComplete, "pipeline.stage_complete"),
    (MessageType::PipelineStageFailed, "pipeline.stage_failed"),
    (MessageType::PipelineFinished, "pipeline.finished"),
    (MessageType::PipelineCancelled, "pipeline.cancelled"),
    (MessageType::PipelineError, "pipeline.error"),
    (MessageType::DeliveryFailed, "broker.delivery_failed"),
];

impl MessageType {
    pub fn domain(domain: Domain, event: DomainEvent) -> Self {
        MessageType::Domain(domain, event)
    }

    pub fn as_string(&self) -> String {
        match self {
            MessageType::Domain(domain, event) => format!("{}.{}", domain, event.as_str()),
            fixed => FIXED_TYPES
                .iter()
                .find(|(t, _)| t == fixed)
                .map(|(_, name)| (*name).to_string())
                .unwrap_or_default(),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

impl std::str::FromStr for MessageType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((t, _)) = FIXED_TYPES.iter().find(|(_, name)| *name == s) {
            return Ok(*t);
        }
        let Some((namespace, event)) = s.split_once('.') else {
            anyhow::bail!("Invalid message type '{}': expected namespace.event", s);
        };
        let domain: Domain = namespace.parse()?;
        let event = DomainEvent::all()
            .iter()
            .find(|e| e.as_str() == event)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("Invalid event '{}' for domain {}", event, domain))?;
        Ok(MessageType::Domain(domain, event))
    }
}

impl From<MessageType> for String {
    fn from(value: MessageType) -> Self {
        value.as_string()
    }
}

impl TryFrom<String> for MessageType {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Status of one step reported in a status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Started,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Started => "started",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }
}

/// Per-type payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    Start {
        pipeline_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        generation_id: Option<Uuid>,
        data: Value,
        #[serde(default)]
        context: Value,
    },
    StatusUpdate {
        pipeline_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        generation_id: Option<Uuid>,
        phase: String,
        status: StepStatus,
        progress: u8,
    },
    Complete {
        pipeline_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        generation_id: Option<Uuid>,
        results: BTreeMap<String, Value>,
    },
    Error {
        pipeline_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        generation_id: Option<Uuid>,
        error: String,
        stage: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phase: Option<String>,
        #[serde(default)]
        escalated: bool,
        /// Cleared when another attempt would fail the same way
        #[serde(default = "retryable_by_default")]
        retryable: bool,
    },
    ErrorReport {
        pipeline_id: String,
        error: String,
    },
    Recovery {
        pipeline_id: String,
        attempt: u32,
        max_attempts: u32,
        error: String,
    },
    ControlPointReached {
        control_point_id: Uuid,
        pipeline_id: String,
        stage: String,
        options: Vec<String>,
        /// Fractional, so sub-second timeouts are not reported as zero
        timeout_seconds: f64,
        #[serde(default)]
        preview: Value,
    },
    ControlPointDecision {
        control_point_id: Uuid,
        pipeline_id: String,
        stage: String,
        decision: String,
        #[serde(default)]
        details: Value,
    },
    ControlPointTimeout {
        control_point_id: Uuid,
        pipeline_id: String,
        stage: String,
    },
    Staging {
        pipeline_id: String,
        stage_id: Uuid,
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    IngestionStart {
        pipeline_id: String,
        stage_id: Uuid,
    },
    StageTransition {
        pipeline_id: String,
        from: String,
        to: String,
    },
    PipelineStatus {
        pipeline_id: String,
        stage: String,
        status: String,
        progress: u8,
    },
    StageComplete {
        pipeline_id: String,
        stage: String,
        results: BTreeMap<String, Value>,
        #[serde(default)]
        issues: Vec<String>,
    },
    StageFailed {
        pipeline_id: String,
        stage: String,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phase: Option<String>,
    },
    PipelineFinished {
        pipeline_id: String,
        status: String,
    },
    Cancelled {
        pipeline_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    PipelineError {
        pipeline_id: String,
        error: String,
    },
    DeliveryFailed {
        original_message_id: Uuid,
        original_type: String,
        subscriber: String,
        error: String,
    },
}

fn retryable_by_default() -> bool {
    true
}

impl MessageContent {
    /// The pipeline this payload concerns, if any.
    pub fn pipeline_id(&self) -> Option<&str> {
        match self {
            MessageContent::Start { pipeline_id, .. }
            | MessageContent::StatusUpdate { pipeline_id, .. }
            | MessageContent::Complete { pipeline_id, .. }
            | MessageContent::Error { pipeline_id, .. }
            | MessageContent::ErrorReport { pipeline_id, .. }
            | MessageContent::Recovery { pipeline_id, .. }
            | MessageContent::ControlPointReached { pipeline_id, .. }
            | MessageContent::ControlPointDecision { pipeline_id, .. }
            | MessageContent::ControlPointTimeout { pipeline_id, .. }
            | MessageContent::Staging { pipeline_id, .. }
            | MessageContent::IngestionStart { pipeline_id, .. }
            | MessageContent::StageTransition { pipeline_id, .. }
            | MessageContent::PipelineStatus { pipeline_id, .. }
            | MessageContent::StageComplete { pipeline_id, .. }
            | MessageContent::StageFailed { pipeline_id, .. }
            | MessageContent::PipelineFinished { pipeline_id, .. }
            | MessageContent::Cancelled { pipeline_id, .. }
            | MessageContent::PipelineError { pipeline_id, .. } => Some(pipeline_id),
            MessageContent::DeliveryFailed { .. } => None,
        }
    }
}

/// Envelope metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Propagated unchanged along a causal chain
    pub correlation_id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Routing keys of every component the chain passed through
    #[serde(default)]
    pub routing_path: Vec<String>,
    #[serde(default)]
    pub broadcast: bool,
    #[serde(default = "default_version")]
    pub version: u16,
}

fn default_version() -> u16 {
    MESSAGE_VERSION
}

/// A message on the bus. Treated as immutable once published; responses are
/// new messages created with [`ProcessingMessage::derive`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingMessage {
    pub id: Uuid,
    pub message_type: MessageType,
    pub source: ModuleIdentifier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ModuleIdentifier>,
    pub content: MessageContent,
    pub metadata: MessageMetadata,
}

impl ProcessingMessage {
    /// Start a new causal chain.
    pub fn new(message_type: MessageType, source: ModuleIdentifier, content: MessageContent) -> Self {
        let routing_path = vec![source.routing_key()];
        Self {
            id: Uuid::new_v4(),
            message_type,
            source,
            target: None,
            content,
            metadata: MessageMetadata {
                correlation_id: Uuid::new_v4(),
                timestamp: Utc::now(),
                routing_path,
                broadcast: false,
                version: MESSAGE_VERSION,
            },
        }
    }

    /// Continue the causal chain of `self` with a new message.
    pub fn derive(
        &self,
        message_type: MessageType,
        source: ModuleIdentifier,
        content: MessageContent,
    ) -> Self {
        let mut routing_path = self.metadata.routing_path.clone();
        routing_path.push(source.routing_key());
        Self {
            id: Uuid::new_v4(),
            message_type,
            source,
            target: None,
            content,
            metadata: MessageMetadata {
                correlation_id: self.metadata.correlation_id,
                timestamp: Utc::now(),
                routing_path,
                broadcast: false,
                version: MESSAGE_VERSION,
            },
        }
    }

    pub fn to(mut self, target: ModuleIdentifier) -> Self {
        self.target = Some(target);
        self
    }

    pub fn as_broadcast(mut self) -> Self {
        self.metadata.broadcast = true;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.metadata.correlation_id = correlation_id;
        self
    }

    /// The key matched against subscription patterns: the target's direct key
    /// when a target is set, otherwise `"{message_type}.{source routing key}"`.
    pub fn routing_key(&self) -> String {
        match &self.target {
            Some(target) => target.direct_key(),
            None => format!("{}.{}", self.message_type, self.source.routing_key()),
        }
    }

    pub fn pipeline_id(&self) -> Option<&str> {
        self.content.pipeline_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::identifier::ModuleKind;
    use serde_json::json;

    fn start_message() -> ProcessingMessage {
        ProcessingMessage::new(
            MessageType::domain(Domain::Quality, DomainEvent::Start),
            ModuleIdentifier::service("api"),
            MessageContent::Start {
                pipeline_id: "p1".into(),
                generation_id: None,
                data: json!({"records": []}),
                context: Value::Null,
            },
        )
    }

    #[test]
    fn test_message_type_strings() {
        assert_eq!(
            MessageType::domain(Domain::Quality, DomainEvent::Start).to_string(),
            "quality.start"
        );
        assert_eq!(
            MessageType::domain(Domain::Report, DomainEvent::StatusUpdate).to_string(),
            "report.status_update"
        );
        assert_eq!(
            MessageType::ControlPointReached.to_string(),
            "control_point.reached"
        );
        assert_eq!(MessageType::DeliveryFailed.to_string(), "broker.delivery_failed");
    }

    #[test]
    fn test_message_type_parse_roundtrip_for_every_variant() {
        for (t, name) in FIXED_TYPES {
            assert_eq!(name.parse::<MessageType>().unwrap(), *t);
        }
        for domain in Domain::all() {
            for event in DomainEvent::all() {
                let t = MessageType::domain(*domain, *event);
                assert_eq!(t.to_string().parse::<MessageType>().unwrap(), t);
            }
        }
        assert!("quality.bogus".parse::<MessageType>().is_err());
        assert!("nonsense".parse::<MessageType>().is_err());
    }

    #[test]
    fn test_routing_key_prefers_target() {
        let msg = start_message();
        assert_eq!(msg.routing_key(), "quality.start.service.api.0");

        let target = ModuleIdentifier::new("quality_handler", ModuleKind::Handler)
            .in_department("quality");
        let msg = msg.to(target);
        assert_eq!(msg.routing_key(), "direct.quality.handler.quality_handler.0");
    }

    #[test]
    fn test_derive_keeps_correlation_and_extends_path() {
        let original = start_message();
        let handler = ModuleIdentifier::new("quality_handler", ModuleKind::Handler);
        let derived = original.derive(
            MessageType::domain(Domain::Quality, DomainEvent::StatusUpdate),
            handler.clone(),
            MessageContent::StatusUpdate {
                pipeline_id: "p1".into(),
                generation_id: None,
                phase: "detection".into(),
                status: StepStatus::Started,
                progress: 0,
            },
        );
        assert_ne!(derived.id, original.id);
        assert_eq!(derived.metadata.correlation_id, original.metadata.correlation_id);
        assert_eq!(
            derived.metadata.routing_path,
            vec!["service.api.0".to_string(), handler.routing_key()]
        );
        assert!(derived.target.is_none());
    }

    #[test]
    fn test_envelope_serializes_type_as_string_and_tags_content() {
        let msg = start_message();
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["message_type"], "quality.start");
        assert_eq!(json["content"]["kind"], "start");
        assert_eq!(json["content"]["pipeline_id"], "p1");
        assert_eq!(json["metadata"]["version"], MESSAGE_VERSION);

        let back: ProcessingMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_pipeline_id_accessor() {
        assert_eq!(start_message().pipeline_id(), Some("p1"));
        let failed = MessageContent::DeliveryFailed {
            original_message_id: Uuid::new_v4(),
            original_type: "quality.start".into(),
            subscriber: "x".into(),
            error: "boom".into(),
        };
        assert_eq!(failed.pipeline_id(), None);
    }
}
