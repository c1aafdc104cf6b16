//! Human-approval gates with timeouts.
//!
//! A control point resolves exactly once: by a valid decision, by its
//! timeout, or by cancellation of its pipeline, whichever comes first. Every
//! path finalizes inside the same critical section on the control-point table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{
    MessageBroker, MessageContent, MessageType, ModuleIdentifier, ProcessingMessage,
    SubscriptionId, handler_fn,
};
use crate::config::ControlPointConfig;
use crate::errors::{BrokerError, ControlPointError};

/// Lifecycle of a control point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlPointStatus {
    Pending,
    Decided,
    TimedOut,
    Cancelled,
}

impl ControlPointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlPointStatus::Pending => "pending",
            ControlPointStatus::Decided => "decided",
            ControlPointStatus::TimedOut => "timed_out",
            ControlPointStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, ControlPointStatus::Pending)
    }
}

impl std::fmt::Display for ControlPointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A check applied to decision details before a decision is accepted.
///
/// `field` is a dot-separated path into the details object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ValidationRule {
    Required {
        field: String,
    },
    OneOf {
        field: String,
        values: Vec<Value>,
    },
    Range {
        field: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    /// `field` must hold a JSON object whenever `decision` is chosen.
    ObjectFor {
        decision: String,
        field: String,
    },
}

fn lookup<'a>(details: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(details, |value, key| value.get(key))
        .filter(|v| !v.is_null())
}

impl ValidationRule {
    pub fn required(field: impl Into<String>) -> Self {
        Self::Required {
            field: field.into(),
        }
    }

    pub fn object_for(decision: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ObjectFor {
            decision: decision.into(),
            field: field.into(),
        }
    }

    /// Check the rule against a decision and its details, returning the
    /// reason on failure.
    pub fn check(&self, decision: &str, details: &Value) -> Result<(), String> {
        match self {
            ValidationRule::Required { field } => lookup(details, field)
                .map(|_| ())
                .ok_or_else(|| format!("missing required field '{}'", field)),
            ValidationRule::OneOf { field, values } => {
                let value = lookup(details, field)
                    .ok_or_else(|| format!("missing required field '{}'", field))?;
                if values.contains(value) {
                    Ok(())
                } else {
                    Err(format!("field '{}' must be one of {:?}", field, values))
                }
            }
            ValidationRule::Range { field, min, max } => {
                let number = lookup(details, field)
                    .and_then(Value::as_f64)
                    .ok_or_else(|| format!("field '{}' must be a number", field))?;
                if min.is_some_and(|m| number < m) || max.is_some_and(|m| number > m) {
                    Err(format!(
                        "field '{}' = {} is outside the allowed range",
                        field, number
                    ))
                } else {
                    Ok(())
                }
            }
            ValidationRule::ObjectFor {
                decision: gated,
                field,
            } => {
                if decision != gated || lookup(details, field).is_some_and(Value::is_object) {
                    Ok(())
                } else {
                    Err(format!("'{}' requires an object under '{}'", gated, field))
                }
            }
        }
    }
}

/// An accepted decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub option: String,
    #[serde(default)]
    pub details: Value,
    pub decided_at: DateTime<Utc>,
}

/// A pending or resolved approval gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPoint {
    pub id: Uuid,
    pub pipeline_id: String,
    pub stage: String,
    pub options: Vec<String>,
    #[serde(default)]
    pub preview: Value,
    #[serde(default)]
    pub data: Value,
    pub created_at: DateTime<Utc>,
    pub timeout_ms: u64,
    pub status: ControlPointStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub validation_rules: Vec<ValidationRule>,
    #[serde(default)]
    pub required_artifacts: Vec<String>,
}

impl ControlPoint {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Parameters for [`ControlPointManager::create_control_point`].
#[derive(Debug, Clone)]
pub struct ControlPointRequest {
    pub pipeline_id: String,
    pub stage: String,
    pub options: Vec<String>,
    pub data: Value,
    pub preview: Option<Value>,
    pub timeout: Option<Duration>,
    pub validation_rules: Vec<ValidationRule>,
    pub required_artifacts: Vec<String>,
    pub correlation_id: Option<Uuid>,
}

impl ControlPointRequest {
    pub fn new<S: Into<String>>(
        pipeline_id: impl Into<String>,
        stage: impl Into<String>,
        options: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            stage: stage.into(),
            options: options.into_iter().map(Into::into).collect(),
            data: Value::Null,
            preview: None,
            timeout: None,
            validation_rules: Vec::new(),
            required_artifacts: Vec::new(),
            correlation_id: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Preview shown to the decider; defaults to the data itself.
    pub fn with_preview(mut self, preview: Value) -> Self {
        self.preview = Some(preview);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_rule(mut self, rule: ValidationRule) -> Self {
        self.validation_rules.push(rule);
        self
    }

    pub fn with_required_artifact(mut self, name: impl Into<String>) -> Self {
        self.required_artifacts.push(name.into());
        self
    }

    /// Continue an existing message chain.
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// How a control point was resolved, as seen by waiters.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Decided(Decision),
    TimedOut,
    Cancelled,
}

struct Entry {
    point: ControlPoint,
    correlation_id: Uuid,
    timer: Option<AbortHandle>,
    resolved: watch::Sender<Option<Resolution>>,
}

struct Inner {
    broker: MessageBroker,
    identity: ModuleIdentifier,
    config: ControlPointConfig,
    table: Mutex<HashMap<Uuid, Entry>>,
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Entry>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns the process-wide control-point table.
#[derive(Clone)]
pub struct ControlPointManager {
    inner: Arc<Inner>,
}

impl ControlPointManager {
    pub fn new(broker: MessageBroker, config: ControlPointConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                broker,
                identity: ModuleIdentifier::service("control_point_manager"),
                config,
                table: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn identity(&self) -> &ModuleIdentifier {
        &self.inner.identity
    }

    /// Release the control points of cancelled pipelines.
    pub fn register(&self) -> Result<SubscriptionId, BrokerError> {
        let manager = self.clone();
        self.inner.broker.subscribe_durable(
            self.inner.identity.clone(),
            &["pipeline.cancelled.#"],
            handler_fn(move |message| {
                let manager = manager.clone();
                async move {
                    if let (MessageType::PipelineCancelled, Some(pipeline_id)) =
                        (message.message_type, message.pipeline_id())
                    {
                        manager.cancel_for_pipeline(pipeline_id);
                    }
                    Ok(())
                }
            }),
        )
    }

    /// Open a control point, announce it with `control_point.reached` and arm
    /// its timeout.
    pub fn create_control_point(
        &self,
        request: ControlPointRequest,
    ) -> Result<Uuid, ControlPointError> {
        if request.options.is_empty() {
            return Err(ControlPointError::InvalidRequest(
                "a control point needs at least one option".into(),
            ));
        }
        if request.options.iter().any(|o| o.trim().is_empty()) {
            return Err(ControlPointError::InvalidRequest(
                "control point options must not be blank".into(),
            ));
        }

        let id = Uuid::new_v4();
        let timeout = request
            .timeout
            .unwrap_or_else(|| self.inner.config.default_timeout());
        let preview = request.preview.unwrap_or_else(|| request.data.clone());
        let point = ControlPoint {
            id,
            pipeline_id: request.pipeline_id,
            stage: request.stage,
            options: request.options,
            preview,
            data: request.data,
            created_at: Utc::now(),
            timeout_ms: timeout.as_millis() as u64,
            status: ControlPointStatus::Pending,
            decision: None,
            resolved_at: None,
            validation_rules: request.validation_rules,
            required_artifacts: request.required_artifacts,
        };
        let correlation_id = request.correlation_id.unwrap_or_else(Uuid::new_v4);

        let mut reached = ProcessingMessage::new(
            MessageType::ControlPointReached,
            self.inner.identity.clone(),
            MessageContent::ControlPointReached {
                control_point_id: id,
                pipeline_id: point.pipeline_id.clone(),
                stage: point.stage.clone(),
                options: point.options.clone(),
                timeout_seconds: timeout.as_secs_f64(),
                preview: point.preview.clone(),
            },
        );
        reached.metadata.correlation_id = correlation_id;

        let (resolved, _) = watch::channel(None);
        let pipeline_id = point.pipeline_id.clone();
        let stage = point.stage.clone();
        self.inner.lock().insert(
            id,
            Entry {
                point,
                correlation_id,
                timer: None,
                resolved,
            },
        );

        if let Err(e) = self.inner.broker.publish(reached) {
            self.inner.lock().remove(&id);
            return Err(e.into());
        }

        let timer = tokio::spawn(expire_after(Arc::downgrade(&self.inner), id, timeout));
        let mut table = self.inner.lock();
        match table.get_mut(&id) {
            Some(entry) if !entry.point.status.is_resolved() => {
                entry.timer = Some(timer.abort_handle());
            }
            _ => timer.abort(),
        }
        drop(table);

        info!(
            control_point_id = %id,
            pipeline_id = %pipeline_id,
            stage = %stage,
            timeout_ms = timeout.as_millis() as u64,
            "control point reached"
        );
        Ok(id)
    }

    /// Record a decision. Fails unless the control point is pending, the
    /// option is allowed, every rule passes and every required artifact is
    /// present under `details.artifacts`.
    pub fn submit_decision(
        &self,
        id: Uuid,
        decision: &str,
        details: Value,
    ) -> Result<ControlPoint, ControlPointError> {
        let (snapshot, correlation_id) = {
            let mut table = self.inner.lock();
            let entry = table.get_mut(&id).ok_or(ControlPointError::NotFound(id))?;
            if entry.point.status.is_resolved() {
                return Err(ControlPointError::AlreadyResolved(id));
            }
            let invalid = |reason: String| ControlPointError::InvalidDecision {
                id,
                decision: decision.to_string(),
                reason,
            };
            if !entry.point.options.iter().any(|o| o == decision) {
                return Err(invalid(format!(
                    "not one of the allowed options {:?}",
                    entry.point.options
                )));
            }
            for rule in &entry.point.validation_rules {
                rule.check(decision, &details).map_err(invalid)?;
            }
            for artifact in &entry.point.required_artifacts {
                let present = details
                    .get("artifacts")
                    .and_then(|a| a.get(artifact))
                    .is_some_and(|v| !v.is_null());
                if !present {
                    return Err(invalid(format!("missing required artifact '{}'", artifact)));
                }
            }

            let decided = Decision {
                option: decision.to_string(),
                details,
                decided_at: Utc::now(),
            };
            entry.point.status = ControlPointStatus::Decided;
            entry.point.decision = Some(decided.clone());
            entry.point.resolved_at = Some(decided.decided_at);
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            entry.resolved.send_replace(Some(Resolution::Decided(decided)));
            (entry.point.clone(), entry.correlation_id)
        };

        info!(
            control_point_id = %id,
            pipeline_id = %snapshot.pipeline_id,
            decision,
            "control point decided"
        );
        let details = snapshot
            .decision
            .as_ref()
            .map(|d| d.details.clone())
            .unwrap_or_default();
        let mut applied = ProcessingMessage::new(
            MessageType::ControlPointDecisionApplied,
            self.inner.identity.clone(),
            MessageContent::ControlPointDecision {
                control_point_id: id,
                pipeline_id: snapshot.pipeline_id.clone(),
                stage: snapshot.stage.clone(),
                decision: decision.to_string(),
                details,
            },
        );
        applied.metadata.correlation_id = correlation_id;
        if let Err(e) = self.inner.broker.publish(applied) {
            warn!(control_point_id = %id, error = %e, "could not announce decision");
        }
        Ok(snapshot)
    }

    /// Resolve a pending control point as timed out ahead of its timer.
    pub fn force_timeout(&self, id: Uuid) -> Result<ControlPoint, ControlPointError> {
        let mut table = self.inner.lock();
        let entry = table.get_mut(&id).ok_or(ControlPointError::NotFound(id))?;
        if entry.point.status.is_resolved() {
            return Err(ControlPointError::AlreadyResolved(id));
        }
        drop(table);
        self.inner
            .expire(id)
            .ok_or(ControlPointError::AlreadyResolved(id))
    }

    /// Suspend until the control point resolves. A timeout resolves to
    /// `ControlPointError::Timeout`.
    pub async fn wait_for_decision(&self, id: Uuid) -> Result<Decision, ControlPointError> {
        let mut rx = {
            let table = self.inner.lock();
            table
                .get(&id)
                .ok_or(ControlPointError::NotFound(id))?
                .resolved
                .subscribe()
        };
        let resolution = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ControlPointError::NotFound(id))?
            .clone();
        match resolution {
            Some(Resolution::Decided(decision)) => Ok(decision),
            Some(Resolution::Cancelled) => Err(ControlPointError::Cancelled(id)),
            Some(Resolution::TimedOut) | None => Err(ControlPointError::Timeout(id)),
        }
    }

    /// Resolve every pending control point of a pipeline as cancelled.
    /// Timers are aborted and waiters released with
    /// `ControlPointError::Cancelled`; no timeout is announced. Returns the
    /// ids that were cancelled.
    pub fn cancel_for_pipeline(&self, pipeline_id: &str) -> Vec<Uuid> {
        let cancelled: Vec<Uuid> = self
            .pending_for_pipeline(pipeline_id)
            .into_iter()
            .filter_map(|point| {
                self.inner
                    .close(point.id, ControlPointStatus::Cancelled, Resolution::Cancelled)
                    .map(|_| point.id)
            })
            .collect();
        if !cancelled.is_empty() {
            info!(pipeline_id, count = cancelled.len(), "control points cancelled with their pipeline");
        }
        cancelled
    }

    pub fn get(&self, id: Uuid) -> Option<ControlPoint> {
        self.inner.lock().get(&id).map(|e| e.point.clone())
    }

    pub fn pending_for_pipeline(&self, pipeline_id: &str) -> Vec<ControlPoint> {
        let mut pending: Vec<ControlPoint> = self
            .inner
            .lock()
            .values()
            .filter(|e| e.point.pipeline_id == pipeline_id && !e.point.status.is_resolved())
            .map(|e| e.point.clone())
            .collect();
        pending.sort_by_key(|p| p.created_at);
        pending
    }

    /// Drop resolved control points older than `older_than`. Returns the count.
    pub fn purge_resolved(&self, older_than: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d));
        let Some(cutoff) = cutoff else {
            return 0;
        };
        let mut table = self.inner.lock();
        let before = table.len();
        table.retain(|_, e| e.point.resolved_at.is_none_or(|at| at >= cutoff));
        before - table.len()
    }

    /// Periodically purge resolved control points past the retention window.
    pub fn spawn_purger(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        let retention = self.inner.config.resolved_retention();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = manager.purge_resolved(retention);
                        if purged > 0 {
                            debug!(purged, "purged resolved control points");
                        }
                    }
                }
            }
        })
    }
}

impl Inner {
    /// Finalize a still-pending control point without a decision, aborting
    /// its timer and releasing waiters with `resolution`.
    fn close(
        &self,
        id: Uuid,
        status: ControlPointStatus,
        resolution: Resolution,
    ) -> Option<(ControlPoint, Uuid)> {
        let mut table = self.lock();
        let entry = table.get_mut(&id)?;
        if entry.point.status.is_resolved() {
            return None;
        }
        entry.point.status = status;
        entry.point.resolved_at = Some(Utc::now());
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }
        entry.resolved.send_replace(Some(resolution));
        Some((entry.point.clone(), entry.correlation_id))
    }

    /// Finalize as timed out if still pending and announce it.
    fn expire(&self, id: Uuid) -> Option<ControlPoint> {
        let (snapshot, correlation_id) =
            self.close(id, ControlPointStatus::TimedOut, Resolution::TimedOut)?;

        warn!(
            control_point_id = %id,
            pipeline_id = %snapshot.pipeline_id,
            stage = %snapshot.stage,
            "control point timed out"
        );
        let mut timeout = ProcessingMessage::new(
            MessageType::ControlPointTimeout,
            self.identity.clone(),
            MessageContent::ControlPointTimeout {
                control_point_id: id,
                pipeline_id: snapshot.pipeline_id.clone(),
                stage: snapshot.stage.clone(),
            },
        );
        timeout.metadata.correlation_id = correlation_id;
        if let Err(e) = self.broker.publish(timeout) {
            debug!(control_point_id = %id, error = %e, "could not announce timeout");
        }
        Some(snapshot)
    }
}

async fn expire_after(inner: Weak<Inner>, id: Uuid, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    if let Some(inner) = inner.upgrade() {
        inner.expire(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn setup() -> (
        ControlPointManager,
        mpsc::UnboundedReceiver<ProcessingMessage>,
    ) {
        let broker = MessageBroker::new(BrokerConfig::default());
        let (_, rx) = broker
            .subscribe_channel(ModuleIdentifier::service("observer"), &["control_point.#"])
            .unwrap();
        (
            ControlPointManager::new(broker, ControlPointConfig::default()),
            rx,
        )
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ProcessingMessage>) -> ProcessingMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("closed")
    }

    #[tokio::test]
    async fn test_create_publishes_reached() {
        let (cps, mut rx) = setup();
        let id = cps
            .create_control_point(
                ControlPointRequest::new("p1", "decision", ["approve", "reject"])
                    .with_data(json!({"score": 0.9}))
                    .with_timeout(Duration::from_secs(30)),
            )
            .unwrap();

        let msg = next(&mut rx).await;
        assert_eq!(msg.message_type, MessageType::ControlPointReached);
        match msg.content {
            MessageContent::ControlPointReached {
                control_point_id,
                options,
                timeout_seconds,
                preview,
                ..
            } => {
                assert_eq!(control_point_id, id);
                assert_eq!(options, vec!["approve", "reject"]);
                assert_eq!(timeout_seconds, 30.0);
                assert_eq!(preview, json!({"score": 0.9}));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(cps.pending_for_pipeline("p1").len(), 1);
    }

    #[tokio::test]
    async fn test_empty_options_rejected() {
        let (cps, _rx) = setup();
        let err = cps
            .create_control_point(ControlPointRequest::new("p1", "x", Vec::<String>::new()))
            .unwrap_err();
        assert!(matches!(err, ControlPointError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_decision_must_be_an_allowed_option() {
        let (cps, _rx) = setup();
        let id = cps
            .create_control_point(ControlPointRequest::new("p1", "x", ["approve", "reject"]))
            .unwrap();
        let err = cps.submit_decision(id, "maybe", json!({})).unwrap_err();
        assert!(matches!(err, ControlPointError::InvalidDecision { .. }));
        assert_eq!(cps.get(id).unwrap().status, ControlPointStatus::Pending);
    }

    #[tokio::test]
    async fn test_rules_and_artifacts_are_enforced() {
        let (cps, _rx) = setup();
        let id = cps
            .create_control_point(
                ControlPointRequest::new("p1", "x", ["approve"])
                    .with_rule(ValidationRule::required("reviewer"))
                    .with_rule(ValidationRule::Range {
                        field: "confidence".into(),
                        min: Some(0.0),
                        max: Some(1.0),
                    })
                    .with_required_artifact("signoff"),
            )
            .unwrap();

        let err = cps
            .submit_decision(id, "approve", json!({"confidence": 0.5}))
            .unwrap_err();
        assert!(err.to_string().contains("reviewer"));

        let err = cps
            .submit_decision(id, "approve", json!({"reviewer": "ana", "confidence": 3}))
            .unwrap_err();
        assert!(err.to_string().contains("range"));

        let err = cps
            .submit_decision(id, "approve", json!({"reviewer": "ana", "confidence": 0.5}))
            .unwrap_err();
        assert!(err.to_string().contains("signoff"));

        let point = cps
            .submit_decision(
                id,
                "approve",
                json!({"reviewer": "ana", "confidence": 0.5, "artifacts": {"signoff": "doc.pdf"}}),
            )
            .unwrap();
        assert_eq!(point.status, ControlPointStatus::Decided);
    }

    #[tokio::test]
    async fn test_decision_releases_waiter_and_publishes() {
        let (cps, mut rx) = setup();
        let id = cps
            .create_control_point(ControlPointRequest::new("p1", "x", ["approve", "reject"]))
            .unwrap();
        next(&mut rx).await;

        let waiter = {
            let cps = cps.clone();
            tokio::spawn(async move { cps.wait_for_decision(id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cps.submit_decision(id, "reject", json!({"reason": "bad data"}))
            .unwrap();

        let decision = waiter.await.unwrap().unwrap();
        assert_eq!(decision.option, "reject");
        let msg = next(&mut rx).await;
        assert_eq!(msg.message_type, MessageType::ControlPointDecisionApplied);

        let err = cps.submit_decision(id, "approve", json!({})).unwrap_err();
        assert!(matches!(err, ControlPointError::AlreadyResolved(_)));
    }

    #[tokio::test]
    async fn test_timeout_resolves_once_and_blocks_later_decisions() {
        let (cps, mut rx) = setup();
        let id = cps
            .create_control_point(
                ControlPointRequest::new("p1", "x", ["approve"])
                    .with_timeout(Duration::from_millis(50)),
            )
            .unwrap();
        next(&mut rx).await;

        let err = cps.wait_for_decision(id).await.unwrap_err();
        assert!(matches!(err, ControlPointError::Timeout(_)));
        let msg = next(&mut rx).await;
        assert_eq!(msg.message_type, MessageType::ControlPointTimeout);
        assert_eq!(cps.get(id).unwrap().status, ControlPointStatus::TimedOut);

        assert!(matches!(
            cps.submit_decision(id, "approve", json!({})),
            Err(ControlPointError::AlreadyResolved(_))
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err(), "timeout must be announced once");
    }

    #[tokio::test]
    async fn test_force_timeout_and_purge() {
        let (cps, _rx) = setup();
        let id = cps
            .create_control_point(ControlPointRequest::new("p1", "x", ["approve"]))
            .unwrap();
        let point = cps.force_timeout(id).unwrap();
        assert_eq!(point.status, ControlPointStatus::TimedOut);
        assert!(matches!(
            cps.force_timeout(id),
            Err(ControlPointError::AlreadyResolved(_))
        ));
        assert!(matches!(
            cps.force_timeout(Uuid::new_v4()),
            Err(ControlPointError::NotFound(_))
        ));

        assert_eq!(cps.purge_resolved(Duration::from_secs(60)), 0);
        assert_eq!(cps.purge_resolved(Duration::ZERO), 1);
        assert!(cps.get(id).is_none());
    }

    #[tokio::test]
    async fn test_sub_second_timeout_is_reported_fractionally() {
        let (cps, mut rx) = setup();
        cps.create_control_point(
            ControlPointRequest::new("p1", "x", ["approve"]).with_timeout(Duration::from_millis(250)),
        )
        .unwrap();
        match next(&mut rx).await.content {
            MessageContent::ControlPointReached { timeout_seconds, .. } => {
                assert_eq!(timeout_seconds, 0.25)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pipeline_cancellation_releases_pending_points() {
        let broker = MessageBroker::new(BrokerConfig::default());
        let cps = ControlPointManager::new(broker.clone(), ControlPointConfig::default());
        cps.register().unwrap();
        let (_, mut rx) = broker
            .subscribe_channel(ModuleIdentifier::service("observer"), &["control_point.timeout.#"])
            .unwrap();
        let id = cps
            .create_control_point(
                ControlPointRequest::new("p1", "x", ["approve"])
                    .with_timeout(Duration::from_millis(200)),
            )
            .unwrap();
        let other = cps
            .create_control_point(ControlPointRequest::new("p2", "x", ["approve"]))
            .unwrap();
        let waiter = {
            let cps = cps.clone();
            tokio::spawn(async move { cps.wait_for_decision(id).await })
        };

        broker
            .publish(
                ProcessingMessage::new(
                    MessageType::PipelineCancelled,
                    ModuleIdentifier::service("pipeline_orchestrator"),
                    MessageContent::Cancelled {
                        pipeline_id: "p1".into(),
                        reason: None,
                    },
                )
                .as_broadcast(),
            )
            .unwrap();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, ControlPointError::Cancelled(_)));
        assert_eq!(cps.get(id).unwrap().status, ControlPointStatus::Cancelled);
        assert!(cps.pending_for_pipeline("p1").is_empty());
        assert_eq!(cps.pending_for_pipeline("p2")[0].id, other);
        assert!(matches!(
            cps.submit_decision(id, "approve", json!({})),
            Err(ControlPointError::AlreadyResolved(_))
        ));

        // the aborted timer never fires
        tokio::time::sleep(Duration::from_millis(300)).await;
        while let Ok(msg) = rx.try_recv() {
            assert_ne!(msg.pipeline_id(), Some("p1"), "cancelled point announced a timeout");
        }
    }

    #[test]
    fn test_validation_rules() {
        let details = json!({"level": "high", "nested": {"score": 7}});
        assert!(ValidationRule::required("nested.score").check("approve", &details).is_ok());
        assert!(ValidationRule::required("missing").check("approve", &details).is_err());
        let one_of = ValidationRule::OneOf {
            field: "level".into(),
            values: vec![json!("low"), json!("high")],
        };
        assert!(one_of.check("approve", &details).is_ok());
        assert!(one_of.check("approve", &json!({"level": "mid"})).is_err());
        let range = ValidationRule::Range {
            field: "nested.score".into(),
            min: None,
            max: Some(5.0),
        };
        assert!(range.check("approve", &details).is_err());

        let patch = ValidationRule::object_for("modify", "modifications");
        assert!(patch.check("approve", &json!({})).is_ok());
        assert!(patch.check("modify", &json!({"modifications": {"a": 1}})).is_ok());
        assert!(patch.check("modify", &json!({})).is_err());
        assert!(patch.check("modify", &json!({"modifications": [1]})).is_err());
    }
}
