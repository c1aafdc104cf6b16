//! Temporary holding area for intermediate results.
//!
//! Staged data expires after a TTL. Records that need approval open a
//! control point with `approve`, `reject` and `modify` options and react to
//! its resolution through the broker. Records still awaiting a decision fail
//! when their pipeline is cancelled.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{
    MessageBroker, MessageContent, MessageType, ModuleIdentifier, ProcessingMessage,
    SubscriptionId, handler_fn,
};
use crate::config::StagingConfig;
use crate::control_point::{ControlPointManager, ControlPointRequest, ValidationRule};
use crate::errors::{BrokerError, ControlPointError, StagingError};

pub const APPROVE: &str = "approve";
pub const REJECT: &str = "reject";
pub const MODIFY: &str = "modify";

/// Key in control-point data naming the staged record it gates.
const STAGED_DATA_KEY: &str = "staged_data_id";
/// Key in `modify` details holding the JSON merge patch.
const MODIFICATIONS_KEY: &str = "modifications";
const ELLIPSIS: &str = "…";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagingStatus {
    Pending,
    AwaitingDecision,
    Completed,
    Failed,
}

impl StagingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StagingStatus::Pending => "pending",
            StagingStatus::AwaitingDecision => "awaiting_decision",
            StagingStatus::Completed => "completed",
            StagingStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StagingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One step in a staged record's life.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingEvent {
    pub at: DateTime<Utc>,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedData {
    pub stage_id: Uuid,
    pub pipeline_id: String,
    pub key: String,
    pub payload: Value,
    /// Serialized payload, capped at the configured preview size
    pub preview: String,
    #[serde(default)]
    pub metadata: Value,
    pub status: StagingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub control_points: Vec<Uuid>,
    #[serde(default)]
    pub history: Vec<StagingEvent>,
}

impl StagedData {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    fn record(&mut self, action: &str, detail: Option<String>) {
        self.history.push(StagingEvent {
            at: Utc::now(),
            action: action.to_string(),
            detail,
        });
    }
}

/// Serialize `value` and cap it at `max_bytes`, cutting on a character
/// boundary and marking the cut with an ellipsis.
pub fn make_preview(value: &Value, max_bytes: usize) -> String {
    let full = value.to_string();
    if full.len() <= max_bytes {
        return full;
    }
    let mut end = max_bytes.saturating_sub(ELLIPSIS.len());
    while end > 0 && !full.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &full[..end], ELLIPSIS)
}

/// Apply an RFC 7396 JSON merge patch.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

fn expiry(ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl.max(Duration::from_millis(1)))
        .unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_add_signed(ttl)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

struct Inner {
    broker: MessageBroker,
    control_points: ControlPointManager,
    identity: ModuleIdentifier,
    config: StagingConfig,
    records: Mutex<HashMap<Uuid, StagedData>>,
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, StagedData>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns the process-wide staged-data table.
#[derive(Clone)]
pub struct StagingManager {
    inner: Arc<Inner>,
}

impl StagingManager {
    pub fn new(
        broker: MessageBroker,
        control_points: ControlPointManager,
        config: StagingConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                broker,
                control_points,
                identity: ModuleIdentifier::service("staging_manager"),
                config,
                records: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Listen for resolutions of the control points this manager opens and
    /// for pipeline cancellations.
    pub fn register(&self) -> Result<SubscriptionId, BrokerError> {
        let manager = self.clone();
        self.inner.broker.subscribe_durable(
            self.inner.identity.clone(),
            &[
                "control_point.decision_applied.#",
                "control_point.timeout.#",
                "pipeline.cancelled.#",
            ],
            handler_fn(move |message| {
                let manager = manager.clone();
                async move { manager.on_control_point_message(&message).map_err(Into::into) }
            }),
        )
    }

    /// Stage data with the configured TTL.
    pub fn stage(
        &self,
        pipeline_id: &str,
        key: &str,
        data: Value,
        metadata: Value,
        requires_approval: bool,
    ) -> Result<Uuid, StagingError> {
        self.stage_with_ttl(
            pipeline_id,
            key,
            data,
            metadata,
            requires_approval,
            self.inner.config.ttl(),
        )
    }

    pub fn stage_with_ttl(
        &self,
        pipeline_id: &str,
        key: &str,
        data: Value,
        metadata: Value,
        requires_approval: bool,
        ttl: Duration,
    ) -> Result<Uuid, StagingError> {
        let stage_id = Uuid::new_v4();
        let now = Utc::now();
        let mut record = StagedData {
            stage_id,
            pipeline_id: pipeline_id.to_string(),
            key: key.to_string(),
            preview: make_preview(&data, self.inner.config.preview_max_bytes),
            payload: data,
            metadata,
            status: if requires_approval {
                StagingStatus::AwaitingDecision
            } else {
                StagingStatus::Completed
            },
            reason: None,
            created_at: now,
            expires_at: expiry(ttl),
            control_points: Vec::new(),
            history: Vec::new(),
        };
        record.record("staged", None);
        let preview = record.preview.clone();
        self.inner.lock().insert(stage_id, record);

        if requires_approval {
            match self.open_control_point(stage_id, pipeline_id, key, &preview) {
                Ok(cp_id) => {
                    if let Some(record) = self.inner.lock().get_mut(&stage_id) {
                        record.control_points.push(cp_id);
                    }
                }
                Err(e) => {
                    self.inner.lock().remove(&stage_id);
                    return Err(e.into());
                }
            }
        }

        debug!(
            stage_id = %stage_id,
            pipeline_id,
            key,
            requires_approval,
            "staged data"
        );
        Ok(stage_id)
    }

    fn open_control_point(
        &self,
        stage_id: Uuid,
        pipeline_id: &str,
        key: &str,
        preview: &str,
    ) -> Result<Uuid, ControlPointError> {
        self.inner.control_points.create_control_point(
            ControlPointRequest::new(pipeline_id, key, [APPROVE, REJECT, MODIFY])
                .with_data(json!({ "staged_data_id": stage_id, "key": key }))
                .with_preview(Value::String(preview.to_string()))
                .with_rule(ValidationRule::object_for(MODIFY, MODIFICATIONS_KEY)),
        )
    }

    /// Fetch a live record. Unknown and expired records are both `NotFound`.
    pub fn retrieve(&self, stage_id: Uuid) -> Result<StagedData, StagingError> {
        self.inner
            .lock()
            .get(&stage_id)
            .filter(|r| !r.is_expired())
            .cloned()
            .ok_or(StagingError::NotFound(stage_id))
    }

    /// Most recent live, non-failed record for a pipeline.
    pub fn latest_for_pipeline(&self, pipeline_id: &str) -> Option<StagedData> {
        self.inner
            .lock()
            .values()
            .filter(|r| {
                r.pipeline_id == pipeline_id && r.status != StagingStatus::Failed && !r.is_expired()
            })
            .max_by_key(|r| r.created_at)
            .cloned()
    }

    /// Most recent completed record stored under `key` for a pipeline.
    pub fn latest_completed(&self, pipeline_id: &str, key: &str) -> Option<StagedData> {
        self.inner
            .lock()
            .values()
            .filter(|r| {
                r.pipeline_id == pipeline_id
                    && r.key == key
                    && r.status == StagingStatus::Completed
                    && !r.is_expired()
            })
            .max_by_key(|r| r.created_at)
            .cloned()
    }

    /// Every live record for a pipeline, oldest first.
    pub fn for_pipeline(&self, pipeline_id: &str) -> Vec<StagedData> {
        let mut records: Vec<StagedData> = self
            .inner
            .lock()
            .values()
            .filter(|r| r.pipeline_id == pipeline_id && !r.is_expired())
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    fn on_control_point_message(&self, message: &ProcessingMessage) -> Result<(), StagingError> {
        match &message.content {
            MessageContent::ControlPointDecision {
                control_point_id,
                decision,
                details,
                ..
            } => self.apply_decision(message, *control_point_id, decision, details),
            MessageContent::ControlPointTimeout {
                control_point_id, ..
            } => self.apply_timeout(message, *control_point_id),
            MessageContent::Cancelled { pipeline_id, .. } => {
                self.release_pipeline(pipeline_id);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// The staged record gated by a control point, if this manager opened it.
    fn owned_record(&self, control_point_id: Uuid) -> Option<Uuid> {
        let point = self.inner.control_points.get(control_point_id)?;
        point
            .data
            .get(STAGED_DATA_KEY)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }

    fn apply_decision(
        &self,
        origin: &ProcessingMessage,
        control_point_id: Uuid,
        decision: &str,
        details: &Value,
    ) -> Result<(), StagingError> {
        let Some(stage_id) = self.owned_record(control_point_id) else {
            return Ok(());
        };

        let outcome = {
            let mut records = self.inner.lock();
            let Some(record) = records.get_mut(&stage_id) else {
                debug!(stage_id = %stage_id, "decision for a purged staged record");
                return Ok(());
            };
            if record.status != StagingStatus::AwaitingDecision {
                return Ok(());
            }
            match decision {
                APPROVE => {
                    record.status = StagingStatus::Completed;
                    record.record("approved", None);
                    Some((MessageType::StagingApproved, record.clone()))
                }
                REJECT => {
                    let reason = details
                        .get("reason")
                        .and_then(Value::as_str)
                        .unwrap_or("rejected")
                        .to_string();
                    record.status = StagingStatus::Failed;
                    record.reason = Some(reason.clone());
                    record.record("rejected", Some(reason));
                    Some((MessageType::StagingRejected, record.clone()))
                }
                MODIFY => {
                    // The control point only accepts an object patch; anything
                    // else would replace the whole payload.
                    let Some(modifications) = details.get(MODIFICATIONS_KEY).filter(|m| m.is_object())
                    else {
                        warn!(stage_id = %stage_id, "modify decision without an object patch");
                        return Ok(());
                    };
                    let modifications = modifications.clone();
                    merge_patch(&mut record.payload, &modifications);
                    record.preview =
                        make_preview(&record.payload, self.inner.config.preview_max_bytes);
                    record.expires_at = expiry(self.inner.config.ttl());
                    record.record("modified", Some(modifications.to_string()));
                    None
                }
                other => {
                    warn!(stage_id = %stage_id, decision = other, "unrecognized staging decision");
                    None
                }
            }
        };

        match outcome {
            Some((message_type, record)) => self.announce(Some(origin), message_type, &record),
            None if decision == MODIFY => self.reverify(origin, stage_id),
            None => Ok(()),
        }
    }

    /// Open a fresh control point for a modified record.
    fn reverify(&self, origin: &ProcessingMessage, stage_id: Uuid) -> Result<(), StagingError> {
        let Some((pipeline_id, key, preview)) = self
            .inner
            .lock()
            .get(&stage_id)
            .map(|r| (r.pipeline_id.clone(), r.key.clone(), r.preview.clone()))
        else {
            return Ok(());
        };
        match self.open_control_point(stage_id, &pipeline_id, &key, &preview) {
            Ok(cp_id) => {
                if let Some(record) = self.inner.lock().get_mut(&stage_id) {
                    record.control_points.push(cp_id);
                }
                info!(stage_id = %stage_id, control_point_id = %cp_id, "re-staged for verification");
                Ok(())
            }
            Err(e) => {
                let failed = self.inner.lock().get_mut(&stage_id).map(|record| {
                    record.status = StagingStatus::Failed;
                    record.reason = Some(format!("re-verification failed: {}", e));
                    record.record("failed", record.reason.clone());
                    record.clone()
                });
                if let Some(record) = failed {
                    self.announce(Some(origin), MessageType::StagingRejected, &record)?;
                }
                Err(e.into())
            }
        }
    }

    fn apply_timeout(
        &self,
        origin: &ProcessingMessage,
        control_point_id: Uuid,
    ) -> Result<(), StagingError> {
        let Some(stage_id) = self.owned_record(control_point_id) else {
            return Ok(());
        };
        let failed = {
            let mut records = self.inner.lock();
            match records.get_mut(&stage_id) {
                Some(record) if record.status == StagingStatus::AwaitingDecision => {
                    record.status = StagingStatus::Failed;
                    record.reason = Some("control point timed out".to_string());
                    record.record("timed_out", None);
                    Some(record.clone())
                }
                _ => None,
            }
        };
        match failed {
            Some(record) => self.announce(Some(origin), MessageType::StagingRejected, &record),
            None => Ok(()),
        }
    }

    /// Fail every record of a cancelled pipeline that is still awaiting a
    /// decision. The pipeline is already terminal, so nothing is announced.
    /// Returns the number of records released.
    pub fn release_pipeline(&self, pipeline_id: &str) -> usize {
        let mut released = 0;
        for record in self.inner.lock().values_mut() {
            if record.pipeline_id == pipeline_id && record.status == StagingStatus::AwaitingDecision {
                record.status = StagingStatus::Failed;
                record.reason = Some("cancelled".to_string());
                record.record("cancelled", None);
                released += 1;
            }
        }
        if released > 0 {
            info!(pipeline_id, released, "staged data released after cancellation");
        }
        released
    }

    fn announce(
        &self,
        origin: Option<&ProcessingMessage>,
        message_type: MessageType,
        record: &StagedData,
    ) -> Result<(), StagingError> {
        let content = MessageContent::Staging {
            pipeline_id: record.pipeline_id.clone(),
            stage_id: record.stage_id,
            key: record.key.clone(),
            reason: record.reason.clone(),
        };
        let message = match origin {
            Some(origin) => origin.derive(message_type, self.inner.identity.clone(), content),
            None => ProcessingMessage::new(message_type, self.inner.identity.clone(), content),
        };
        info!(
            pipeline_id = %record.pipeline_id,
            stage_id = %record.stage_id,
            key = %record.key,
            outcome = %message_type,
            "staging decision applied"
        );
        self.inner.broker.publish(message)?;
        Ok(())
    }

    /// Remove expired records. Open control points are forced to time out
    /// and records still awaiting a decision are announced as rejected.
    pub fn sweep(&self) -> usize {
        let expired: Vec<StagedData> = {
            let mut records = self.inner.lock();
            let ids: Vec<Uuid> = records
                .values()
                .filter(|r| r.is_expired())
                .map(|r| r.stage_id)
                .collect();
            ids.iter().filter_map(|id| records.remove(id)).collect()
        };

        for mut record in expired.iter().cloned() {
            if record.status != StagingStatus::AwaitingDecision {
                continue;
            }
            if let Some(cp_id) = record.control_points.last() {
                match self.inner.control_points.force_timeout(*cp_id) {
                    Ok(_) | Err(ControlPointError::AlreadyResolved(_)) => {}
                    Err(e) => debug!(control_point_id = %cp_id, error = %e, "force timeout failed"),
                }
            }
            record.status = StagingStatus::Failed;
            record.reason = Some("staged data expired".to_string());
            if let Err(e) = self.announce(None, MessageType::StagingRejected, &record) {
                warn!(stage_id = %record.stage_id, error = %e, "could not announce expiry");
            }
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "swept expired staged data");
        }
        expired.len()
    }

    /// Run [`sweep`](Self::sweep) on the configured interval until cancelled.
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        let interval = self.inner.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.sweep();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerConfig, ControlPointConfig};
    use crate::control_point::ControlPointStatus;
    use tokio::sync::mpsc;

    struct Harness {
        staging: StagingManager,
        cps: ControlPointManager,
        events: mpsc::UnboundedReceiver<ProcessingMessage>,
    }

    fn harness(config: StagingConfig) -> Harness {
        let broker = MessageBroker::new(BrokerConfig::default());
        let cps = ControlPointManager::new(broker.clone(), ControlPointConfig::default());
        let staging = StagingManager::new(broker.clone(), cps.clone(), config);
        staging.register().unwrap();
        let (_, events) = broker
            .subscribe_channel(ModuleIdentifier::service("observer"), &["staging.#"])
            .unwrap();
        Harness {
            staging,
            cps,
            events,
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ProcessingMessage>) -> ProcessingMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("closed")
    }

    fn pending_cp(h: &Harness, pipeline_id: &str) -> Uuid {
        let pending = h.cps.pending_for_pipeline(pipeline_id);
        assert_eq!(pending.len(), 1);
        pending[0].id
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let value = json!({"text": "ééééééééééééééééééééééééé"});
        let preview = make_preview(&value, 20);
        assert!(preview.len() <= 20);
        assert!(preview.ends_with(ELLIPSIS));

        let small = json!({"a": 1});
        assert_eq!(make_preview(&small, 1024), small.to_string());
    }

    #[test]
    fn test_merge_patch() {
        let mut doc = json!({"a": 1, "b": {"c": 2, "d": 3}});
        merge_patch(&mut doc, &json!({"a": null, "b": {"c": 5}, "e": [1]}));
        assert_eq!(doc, json!({"b": {"c": 5, "d": 3}, "e": [1]}));
    }

    #[tokio::test]
    async fn test_stage_without_approval_completes_immediately() {
        let h = harness(StagingConfig::default());
        let id = h
            .staging
            .stage("p1", "ingestion", json!({"records": [1]}), Value::Null, false)
            .unwrap();
        let record = h.staging.retrieve(id).unwrap();
        assert_eq!(record.status, StagingStatus::Completed);
        assert!(record.expires_at > record.created_at);
        assert!(h.cps.pending_for_pipeline("p1").is_empty());
        assert_eq!(
            h.staging.latest_completed("p1", "ingestion").unwrap().stage_id,
            id
        );
    }

    #[tokio::test]
    async fn test_approve_completes_and_announces() {
        let mut h = harness(StagingConfig::default());
        let id = h
            .staging
            .stage("p1", "decision", json!({"choice": "a"}), Value::Null, true)
            .unwrap();
        assert_eq!(
            h.staging.retrieve(id).unwrap().status,
            StagingStatus::AwaitingDecision
        );

        let cp = pending_cp(&h, "p1");
        h.cps.submit_decision(cp, APPROVE, json!({})).unwrap();

        let msg = next(&mut h.events).await;
        assert_eq!(msg.message_type, MessageType::StagingApproved);
        assert_eq!(h.staging.retrieve(id).unwrap().status, StagingStatus::Completed);
    }

    #[tokio::test]
    async fn test_reject_records_reason() {
        let mut h = harness(StagingConfig::default());
        let id = h
            .staging
            .stage("p1", "decision", json!({}), Value::Null, true)
            .unwrap();
        let cp = pending_cp(&h, "p1");
        h.cps
            .submit_decision(cp, REJECT, json!({"reason": "numbers look wrong"}))
            .unwrap();

        let msg = next(&mut h.events).await;
        assert_eq!(msg.message_type, MessageType::StagingRejected);
        match msg.content {
            MessageContent::Staging { reason, .. } => {
                assert_eq!(reason.as_deref(), Some("numbers look wrong"))
            }
            other => panic!("unexpected {:?}", other),
        }
        let record = h.staging.retrieve(id).unwrap();
        assert_eq!(record.status, StagingStatus::Failed);
        assert!(h.staging.latest_for_pipeline("p1").is_none());
    }

    #[tokio::test]
    async fn test_modify_patches_payload_and_reopens_control_point() {
        let mut h = harness(StagingConfig::default());
        let id = h
            .staging
            .stage("p1", "decision", json!({"choice": "a", "n": 1}), Value::Null, true)
            .unwrap();
        let first = pending_cp(&h, "p1");
        h.cps
            .submit_decision(first, MODIFY, json!({"modifications": {"choice": "b"}}))
            .unwrap();

        let mut record = h.staging.retrieve(id).unwrap();
        for _ in 0..100 {
            if record.control_points.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            record = h.staging.retrieve(id).unwrap();
        }
        let second = *record
            .control_points
            .last()
            .expect("a new control point should open");
        assert_ne!(second, first);
        assert_eq!(pending_cp(&h, "p1"), second);

        assert_eq!(record.payload, json!({"choice": "b", "n": 1}));
        assert_eq!(record.status, StagingStatus::AwaitingDecision);
        assert_eq!(record.control_points, vec![first, second]);
        assert!(record.history.iter().any(|e| e.action == "modified"));

        h.cps.submit_decision(second, APPROVE, json!({})).unwrap();
        let msg = next(&mut h.events).await;
        assert_eq!(msg.message_type, MessageType::StagingApproved);
    }

    #[tokio::test]
    async fn test_modify_without_object_patch_is_refused() {
        let h = harness(StagingConfig::default());
        let id = h
            .staging
            .stage("p1", "decision", json!({"choice": "a", "n": 1}), Value::Null, true)
            .unwrap();
        let cp = pending_cp(&h, "p1");

        for details in [json!({}), json!({"modifications": "choice=b"})] {
            let err = h.cps.submit_decision(cp, MODIFY, details).unwrap_err();
            assert!(matches!(err, ControlPointError::InvalidDecision { .. }));
        }
        assert_eq!(h.cps.get(cp).unwrap().status, ControlPointStatus::Pending);

        let record = h.staging.retrieve(id).unwrap();
        assert_eq!(record.payload, json!({"choice": "a", "n": 1}));
        assert_eq!(record.status, StagingStatus::AwaitingDecision);
        assert_eq!(record.control_points, vec![cp]);
    }

    #[tokio::test]
    async fn test_pipeline_cancellation_fails_awaiting_records() {
        let h = harness(StagingConfig::default());
        let gated = h
            .staging
            .stage("p1", "quality", json!({}), Value::Null, true)
            .unwrap();
        let plain = h
            .staging
            .stage("p1", "ingestion", json!({}), Value::Null, false)
            .unwrap();
        let elsewhere = h
            .staging
            .stage("p2", "quality", json!({}), Value::Null, true)
            .unwrap();

        h.staging
            .inner
            .broker
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

        let mut record = h.staging.retrieve(gated).unwrap();
        for _ in 0..100 {
            if record.status == StagingStatus::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            record = h.staging.retrieve(gated).unwrap();
        }
        assert_eq!(record.status, StagingStatus::Failed);
        assert_eq!(record.reason.as_deref(), Some("cancelled"));
        assert_eq!(h.staging.retrieve(plain).unwrap().status, StagingStatus::Completed);
        assert_eq!(
            h.staging.retrieve(elsewhere).unwrap().status,
            StagingStatus::AwaitingDecision
        );
        assert_eq!(h.staging.release_pipeline("p1"), 0);
    }

    #[tokio::test]
    async fn test_control_point_timeout_fails_record() {
        let mut h = harness(StagingConfig::default());
        let id = h
            .staging
            .stage("p1", "decision", json!({}), Value::Null, true)
            .unwrap();
        let cp = pending_cp(&h, "p1");
        h.cps.force_timeout(cp).unwrap();

        let msg = next(&mut h.events).await;
        assert_eq!(msg.message_type, MessageType::StagingRejected);
        let record = h.staging.retrieve(id).unwrap();
        assert_eq!(record.reason.as_deref(), Some("control point timed out"));
    }

    #[tokio::test]
    async fn test_expired_data_is_unreachable_and_swept() {
        let mut h = harness(StagingConfig::default());
        let plain = h
            .staging
            .stage_with_ttl("p1", "a", json!(1), Value::Null, false, Duration::from_millis(30))
            .unwrap();
        let gated = h
            .staging
            .stage_with_ttl("p1", "b", json!(2), Value::Null, true, Duration::from_millis(30))
            .unwrap();
        let cp = pending_cp(&h, "p1");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(matches!(
            h.staging.retrieve(plain),
            Err(StagingError::NotFound(_))
        ));
        assert_eq!(h.staging.sweep(), 2);
        assert!(matches!(
            h.staging.retrieve(gated),
            Err(StagingError::NotFound(_))
        ));
        assert_eq!(h.cps.get(cp).unwrap().status, ControlPointStatus::TimedOut);

        let msg = next(&mut h.events).await;
        assert_eq!(msg.message_type, MessageType::StagingRejected);
        assert_eq!(h.staging.sweep(), 0);
    }
}
