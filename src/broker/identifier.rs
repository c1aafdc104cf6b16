//! Component identifiers and their routing keys.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::errors::BrokerError;

/// Tokens are the dot-free building blocks of routing keys and patterns.
static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("token regex is a valid static string"));

/// Leading token of keys for messages addressed to one module, so they never
/// share a namespace with `{message_type}.{source}` keys.
pub const DIRECT_PREFIX: &str = "direct";

/// Check that a single routing-key token is well formed.
pub(crate) fn is_valid_token(token: &str) -> bool {
    TOKEN_RE.is_match(token)
}

/// What role a component plays on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    Manager,
    Handler,
    Processor,
    Service,
}

impl ModuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleKind::Manager => "manager",
            ModuleKind::Handler => "handler",
            ModuleKind::Processor => "processor",
            ModuleKind::Service => "service",
        }
    }
}

impl std::fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identifies one component instance on the bus.
///
/// The routing key is `[department.]kind.name.instance_id`, which is what
/// targeted messages are matched against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleIdentifier {
    pub name: String,
    pub kind: ModuleKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    pub instance_id: String,
}

impl ModuleIdentifier {
    pub fn new(name: impl Into<String>, kind: ModuleKind) -> Self {
        Self {
            name: name.into(),
            kind,
            department: None,
            instance_id: "0".to_string(),
        }
    }

    /// Shorthand for a core service identifier with no department.
    pub fn service(name: impl Into<String>) -> Self {
        Self::new(name, ModuleKind::Service)
    }

    pub fn in_department(mut self, department: impl Into<String>) -> Self {
        self.department = Some(department.into());
        self
    }

    pub fn with_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    /// Validate every token that goes into the routing key.
    pub fn validate(&self) -> Result<(), BrokerError> {
        let mut tokens: Vec<(&str, &str)> = vec![
            ("name", self.name.as_str()),
            ("instance_id", self.instance_id.as_str()),
        ];
        if let Some(dept) = &self.department {
            tokens.push(("department", dept.as_str()));
        }
        for (field, value) in tokens {
            if !is_valid_token(value) {
                return Err(BrokerError::Subscription(format!(
                    "identifier {} '{}' must be a non-empty token of [A-Za-z0-9_-]",
                    field, value
                )));
            }
        }
        Ok(())
    }

    pub fn routing_key(&self) -> String {
        match &self.department {
            Some(dept) => format!(
                "{}.{}.{}.{}",
                dept,
                self.kind.as_str(),
                self.name,
                self.instance_id
            ),
            None => format!("{}.{}.{}", self.kind.as_str(), self.name, self.instance_id),
        }
    }

    /// Key that messages targeted at this module are routed under.
    pub fn direct_key(&self) -> String {
        format!("{}.{}", DIRECT_PREFIX, self.routing_key())
    }
}

impl std::fmt::Display for ModuleIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.routing_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_key_without_department() {
        let id = ModuleIdentifier::service("orchestrator");
        assert_eq!(id.routing_key(), "service.orchestrator.0");
    }

    #[test]
    fn test_routing_key_with_department_and_instance() {
        let id = ModuleIdentifier::new("quality_handler", ModuleKind::Handler)
            .in_department("quality")
            .with_instance("7");
        assert_eq!(id.routing_key(), "quality.handler.quality_handler.7");
        assert_eq!(id.to_string(), id.routing_key());
        assert_eq!(id.direct_key(), "direct.quality.handler.quality_handler.7");
    }

    #[test]
    fn test_routing_key_is_deterministic() {
        let a = ModuleIdentifier::new("x", ModuleKind::Processor).in_department("d");
        let b = ModuleIdentifier::new("x", ModuleKind::Processor).in_department("d");
        assert_eq!(a.routing_key(), b.routing_key());
    }

    #[test]
    fn test_validate_rejects_dots_and_empty_tokens() {
        assert!(ModuleIdentifier::service("a.b").validate().is_err());
        assert!(ModuleIdentifier::service("").validate().is_err());
        assert!(
            ModuleIdentifier::service("ok")
                .in_department("has space")
                .validate()
                .is_err()
        );
        assert!(
            ModuleIdentifier::service("ok")
                .with_instance("")
                .validate()
                .is_err()
        );
        assert!(
            ModuleIdentifier::service("report-writer_2")
                .in_department("report")
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_identifier_serde_roundtrip_omits_missing_department() {
        let id = ModuleIdentifier::service("api");
        let json = serde_json::to_value(&id).unwrap();
        assert!(json.get("department").is_none());
        assert_eq!(json["kind"], "service");
    }
}
