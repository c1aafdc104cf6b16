//! Pipeline orchestrator: tracks every pipeline, routes completed stages on
//! to the next ones and starts domain stages over the broker.

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::routing::{INGESTION_STAGE, RoutingGraph, TERMINAL_STAGE, stage_domain};
use super::state::{AwaitingApproval, PipelineState, PipelineStatus};
use crate::broker::{
    DispatchTable, DomainEvent, MessageBroker, MessageContent, MessageType, ModuleIdentifier,
    ProcessingMessage, SubscriptionId,
};
use crate::config::PipelineConfig;
use crate::errors::{BrokerError, OrchestratorError};
use crate::retry::retry_with_policy;
use crate::staging::{StagingManager, StagingStatus};

/// Key under which the ingested input is handed to domain stages.
pub const SOURCE_KEY: &str = "source";

/// Stage results as carried by `pipeline.stage_complete`.
pub type StageResults = BTreeMap<String, Value>;

struct Inner {
    broker: MessageBroker,
    staging: StagingManager,
    graph: RoutingGraph,
    config: PipelineConfig,
    identity: ModuleIdentifier,
    pipelines: Mutex<HashMap<String, PipelineState>>,
}

#[derive(Clone)]
pub struct PipelineOrchestrator {
    inner: Arc<Inner>,
}

impl PipelineOrchestrator {
    pub fn new(
        broker: MessageBroker,
        staging: StagingManager,
        graph: RoutingGraph,
        config: PipelineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                broker,
                staging,
                graph,
                config,
                identity: ModuleIdentifier::service("pipeline_orchestrator"),
                pipelines: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn identity(&self) -> &ModuleIdentifier {
        &self.inner.identity
    }

    pub fn graph(&self) -> &RoutingGraph {
        &self.inner.graph
    }

    /// Subscribe to stage reports and staging outcomes.
    pub fn register(&self) -> Result<SubscriptionId, BrokerError> {
        let table = DispatchTable::new()
            .on(MessageType::PipelineStatusUpdate, on_status_update)
            .on(MessageType::PipelineStageComplete, on_stage_complete)
            .on(MessageType::PipelineStageFailed, on_stage_failed)
            .on(MessageType::StagingApproved, on_staging_approved)
            .on(MessageType::StagingRejected, on_staging_rejected);
        self.inner.broker.subscribe_durable(
            self.inner.identity.clone(),
            &[
                "pipeline.status_update.#",
                "pipeline.stage_complete.#",
                "pipeline.stage_failed.#",
                "staging.approved.#",
                "staging.rejected.#",
            ],
            table.into_handler(Arc::clone(&self.inner)),
        )
    }

    /// Start a new pipeline over `source_data` and return its id.
    pub async fn submit(&self, source_data: Value, metadata: Value) -> Result<String, OrchestratorError> {
        let pipeline_id = Uuid::new_v4().to_string();
        self.submit_as(&pipeline_id, source_data, metadata).await?;
        Ok(pipeline_id)
    }

    /// Start a pipeline under a caller-chosen id.
    #[instrument(skip(self, source_data, metadata))]
    pub async fn submit_as(
        &self,
        pipeline_id: &str,
        source_data: Value,
        metadata: Value,
    ) -> Result<(), OrchestratorError> {
        let inner = &self.inner;
        let correlation_id = {
            let mut pipelines = inner.lock();
            if let Some(existing) = pipelines.get(pipeline_id) {
                return Err(OrchestratorError::InvalidTransition {
                    pipeline_id: pipeline_id.to_string(),
                    status: existing.status.to_string(),
                });
            }
            let state = PipelineState::new(pipeline_id, metadata.clone(), inner.graph.default_path_len());
            let correlation_id = state.correlation_id;
            pipelines.insert(pipeline_id.to_string(), state);
            correlation_id
        };

        let stage_id = match inner
            .staging
            .stage(pipeline_id, INGESTION_STAGE, source_data, metadata, false)
        {
            Ok(id) => id,
            Err(e) => {
                inner.fail(pipeline_id, INGESTION_STAGE, &e.to_string());
                return Err(e.into());
            }
        };
        info!(pipeline_id, stage_id = %stage_id, "pipeline submitted");

        inner
            .publish(
                pipeline_id,
                inner.message(
                    MessageType::PipelineIngestionStart,
                    correlation_id,
                    MessageContent::IngestionStart {
                        pipeline_id: pipeline_id.to_string(),
                        stage_id,
                    },
                ),
            )
            .await?;

        inner.update(pipeline_id, |state| {
            state.complete_stage(INGESTION_STAGE);
        });
        inner.route(pipeline_id, INGESTION_STAGE, &[]).await?;
        Ok(())
    }

    /// Route a pipeline onward from `current_stage`. See [`Inner::route`].
    pub async fn route(
        &self,
        pipeline_id: &str,
        current_stage: &str,
        detected_issues: &[String],
    ) -> Result<Vec<String>, OrchestratorError> {
        self.inner
            .route(pipeline_id, current_stage, detected_issues)
            .await
    }

    /// Cancel a pipeline and tell every component holding a context for it.
    pub fn cancel(&self, pipeline_id: &str, reason: Option<String>) -> Result<(), OrchestratorError> {
        let correlation_id = {
            let mut pipelines = self.inner.lock();
            let state = pipelines
                .get_mut(pipeline_id)
                .ok_or_else(|| OrchestratorError::PipelineNotFound(pipeline_id.to_string()))?;
            if !state.finish(PipelineStatus::Cancelled) {
                return Err(OrchestratorError::InvalidTransition {
                    pipeline_id: pipeline_id.to_string(),
                    status: state.status.to_string(),
                });
            }
            state.correlation_id
        };
        info!(pipeline_id, ?reason, "pipeline cancelled");
        let message = self
            .inner
            .message(
                MessageType::PipelineCancelled,
                correlation_id,
                MessageContent::Cancelled {
                    pipeline_id: pipeline_id.to_string(),
                    reason,
                },
            )
            .as_broadcast();
        self.inner.broker.publish(message)?;
        Ok(())
    }

    pub fn get_status(&self, pipeline_id: &str) -> Option<PipelineState> {
        self.inner.lock().get(pipeline_id).cloned()
    }

    pub fn list(&self) -> Vec<PipelineState> {
        let mut all: Vec<PipelineState> = self.inner.lock().values().cloned().collect();
        all.sort_by_key(|s| s.started_at);
        all
    }

    /// Drop terminal pipelines that ended more than `retention` ago.
    pub fn reclaim(&self, retention: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|d| chrono::Utc::now().checked_sub_signed(d))
        else {
            return 0;
        };
        let mut pipelines = self.inner.lock();
        let before = pipelines.len();
        pipelines.retain(|_, s| !s.is_terminal() || s.ended_at.is_none_or(|at| at >= cutoff));
        before - pipelines.len()
    }

    /// Periodically reclaim terminal pipelines past the configured retention.
    pub fn spawn_reclaimer(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let orchestrator = self.clone();
        let retention = self.inner.config.retention();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let reclaimed = orchestrator.reclaim(retention);
                        if reclaimed > 0 {
                            debug!(reclaimed, "reclaimed finished pipelines");
                        }
                    }
                }
            }
        })
    }
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PipelineState>> {
        self.pipelines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` to a live pipeline's state. Returns `None` for unknown
    /// pipelines.
    fn update<R>(&self, pipeline_id: &str, f: impl FnOnce(&mut PipelineState) -> R) -> Option<R> {
        self.lock().get_mut(pipeline_id).map(f)
    }

    fn correlation_id(&self, pipeline_id: &str) -> Uuid {
        self.lock()
            .get(pipeline_id)
            .map(|s| s.correlation_id)
            .unwrap_or_else(Uuid::new_v4)
    }

    fn message(
        &self,
        message_type: MessageType,
        correlation_id: Uuid,
        content: MessageContent,
    ) -> ProcessingMessage {
        ProcessingMessage::new(message_type, self.identity.clone(), content)
            .with_correlation_id(correlation_id)
    }

    /// Publish with the configured retry policy. A publish that still fails
    /// is recorded on the pipeline and reported as `pipeline.error`.
    async fn publish(
        &self,
        pipeline_id: &str,
        message: ProcessingMessage,
    ) -> Result<usize, OrchestratorError> {
        let operation = message.message_type.to_string();
        let result = retry_with_policy(&self.config.retry, &operation, || {
            let message = message.clone();
            async move { self.broker.publish(message).map_err(OrchestratorError::from) }
        })
        .await;

        if let Err(e) = &result {
            error!(pipeline_id, operation = %operation, error = %e, "publish failed after retries");
            let stage = self
                .update(pipeline_id, |state| {
                    let stage = state.current_stage.clone();
                    state.record_error(&stage, e.to_string());
                    stage
                })
                .unwrap_or_default();
            let report = self.message(
                MessageType::PipelineError,
                message.metadata.correlation_id,
                MessageContent::PipelineError {
                    pipeline_id: pipeline_id.to_string(),
                    error: format!("{} during stage '{}'", e, stage),
                },
            );
            if let Err(report_error) = self.broker.publish(report) {
                warn!(pipeline_id, error = %report_error, "could not report publish failure");
            }
        }
        result
    }

    /// Look up the next stages and start each of them. Reaching the
    /// terminal stage completes the pipeline; no matching edge leaves it
    /// stalled and returns `OrchestratorError::Routing`.
    async fn route(
        &self,
        pipeline_id: &str,
        current_stage: &str,
        issues: &[String],
    ) -> Result<Vec<String>, OrchestratorError> {
        let correlation_id = {
            let pipelines = self.lock();
            let state = pipelines
                .get(pipeline_id)
                .ok_or_else(|| OrchestratorError::PipelineNotFound(pipeline_id.to_string()))?;
            if state.is_terminal() {
                return Err(OrchestratorError::InvalidTransition {
                    pipeline_id: pipeline_id.to_string(),
                    status: state.status.to_string(),
                });
            }
            state.correlation_id
        };

        let targets = self.graph.resolve(current_stage, issues);
        if targets.is_empty() {
            warn!(pipeline_id, stage = current_stage, ?issues, "no route; pipeline stalled");
            self.update(pipeline_id, |state| {
                state.record_error(current_stage, format!("no route from '{}'", current_stage));
            });
            return Err(OrchestratorError::Routing {
                pipeline_id: pipeline_id.to_string(),
                stage: current_stage.to_string(),
                issues: issues.to_vec(),
            });
        }

        for target in &targets {
            self.publish(
                pipeline_id,
                self.message(
                    MessageType::PipelineStageTransition,
                    correlation_id,
                    MessageContent::StageTransition {
                        pipeline_id: pipeline_id.to_string(),
                        from: current_stage.to_string(),
                        to: target.clone(),
                    },
                ),
            )
            .await?;
            self.update(pipeline_id, |state| state.transition_to(target));
            info!(pipeline_id, from = current_stage, to = %target, "stage transition");

            if target == TERMINAL_STAGE {
                self.complete(pipeline_id, correlation_id).await?;
            } else if let Some(domain) = stage_domain(target) {
                let start = self.message(
                    MessageType::domain(domain, DomainEvent::Start),
                    correlation_id,
                    MessageContent::Start {
                        pipeline_id: pipeline_id.to_string(),
                        generation_id: None,
                        data: self.stage_input(pipeline_id),
                        context: json!({
                            "stage": target,
                            "from": current_stage,
                            "issues": issues,
                        }),
                    },
                );
                self.publish(pipeline_id, start).await?;
            }
        }
        Ok(targets)
    }

    /// Input handed to a domain stage: the ingested source plus the latest
    /// completed results of every earlier stage, keyed by stage.
    fn stage_input(&self, pipeline_id: &str) -> Value {
        let mut input = Map::new();
        for record in self.staging.for_pipeline(pipeline_id) {
            if record.status != StagingStatus::Completed {
                continue;
            }
            let key = if record.key == INGESTION_STAGE {
                SOURCE_KEY.to_string()
            } else {
                record.key.clone()
            };
            input.insert(key, record.payload);
        }
        Value::Object(input)
    }

    async fn complete(&self, pipeline_id: &str, correlation_id: Uuid) -> Result<(), OrchestratorError> {
        let finished = self
            .update(pipeline_id, |state| state.finish(PipelineStatus::Completed))
            .unwrap_or(false);
        if !finished {
            return Ok(());
        }
        info!(pipeline_id, "pipeline completed");
        self.publish(
            pipeline_id,
            self.message(
                MessageType::PipelineFinished,
                correlation_id,
                MessageContent::PipelineFinished {
                    pipeline_id: pipeline_id.to_string(),
                    status: PipelineStatus::Completed.to_string(),
                },
            ),
        )
        .await?;
        Ok(())
    }

    /// Mark a pipeline failed and announce it.
    fn fail(&self, pipeline_id: &str, stage: &str, error: &str) {
        let finished = self.update(pipeline_id, |state| {
            state.record_error(stage, error);
            state.finish(PipelineStatus::Failed).then_some(state.correlation_id)
        });
        let Some(Some(correlation_id)) = finished else {
            return;
        };
        warn!(pipeline_id, stage, error, "pipeline failed");
        let message = self.message(
            MessageType::PipelineFinished,
            correlation_id,
            MessageContent::PipelineFinished {
                pipeline_id: pipeline_id.to_string(),
                status: PipelineStatus::Failed.to_string(),
            },
        );
        if let Err(e) = self.broker.publish(message) {
            debug!(pipeline_id, error = %e, "could not announce failure");
        }
    }

    fn is_live(&self, pipeline_id: &str) -> bool {
        self.lock()
            .get(pipeline_id)
            .is_some_and(|s| !s.is_terminal())
    }

    async fn handle_status_update(&self, message: ProcessingMessage) -> Result<(), OrchestratorError> {
        if let MessageContent::PipelineStatus {
            pipeline_id,
            stage,
            progress,
            ..
        } = &message.content
        {
            self.update(pipeline_id, |state| state.record_stage_progress(stage, *progress));
        }
        Ok(())
    }

    async fn handle_stage_complete(&self, message: ProcessingMessage) -> Result<(), OrchestratorError> {
        let MessageContent::StageComplete {
            pipeline_id,
            stage,
            results,
            issues,
        } = message.content
        else {
            return Ok(());
        };
        if !self.is_live(&pipeline_id) {
            debug!(pipeline_id, stage, "stage completed for a finished pipeline");
            return Ok(());
        }

        let requires_approval = self.config.requires_approval(&stage);
        let payload = Value::Object(results.into_iter().collect::<Map<String, Value>>());
        let stage_id = match self.staging.stage(
            &pipeline_id,
            &stage,
            payload,
            json!({ "issues": issues }),
            requires_approval,
        ) {
            Ok(id) => id,
            Err(e) => {
                self.fail(&pipeline_id, &stage, &format!("could not stage results: {}", e));
                return Err(e.into());
            }
        };

        if requires_approval {
            info!(pipeline_id, stage, stage_id = %stage_id, "stage results awaiting approval");
            self.update(&pipeline_id, |state| {
                state.pause(AwaitingApproval {
                    stage_id,
                    stage: stage.clone(),
                    issues: issues.clone(),
                })
            });
            return Ok(());
        }

        self.update(&pipeline_id, |state| state.complete_stage(&stage));
        self.route(&pipeline_id, &stage, &issues).await?;
        Ok(())
    }

    async fn handle_stage_failed(&self, message: ProcessingMessage) -> Result<(), OrchestratorError> {
        if let MessageContent::StageFailed {
            pipeline_id,
            stage,
            error,
            phase,
        } = &message.content
        {
            let detail = match phase {
                Some(phase) => format!("{} (phase {})", error, phase),
                None => error.clone(),
            };
            self.fail(pipeline_id, stage, &detail);
        }
        Ok(())
    }

    /// The awaited approval for `stage_id`, taken off the pipeline.
    fn take_awaiting(&self, pipeline_id: &str, stage_id: Uuid) -> Option<AwaitingApproval> {
        self.update(pipeline_id, |state| {
            let matches = state
                .awaiting
                .as_ref()
                .is_some_and(|a| a.stage_id == stage_id);
            if matches && !state.is_terminal() {
                state.resume()
            } else {
                None
            }
        })
        .flatten()
    }

    async fn handle_staging_approved(&self, message: ProcessingMessage) -> Result<(), OrchestratorError> {
        let MessageContent::Staging {
            pipeline_id,
            stage_id,
            ..
        } = &message.content
        else {
            return Ok(());
        };
        let Some(awaited) = self.take_awaiting(pipeline_id, *stage_id) else {
            return Ok(());
        };
        info!(pipeline_id, stage = %awaited.stage, "stage results approved");
        self.update(pipeline_id, |state| state.complete_stage(&awaited.stage));
        self.route(pipeline_id, &awaited.stage, &awaited.issues).await?;
        Ok(())
    }

    async fn handle_staging_rejected(&self, message: ProcessingMessage) -> Result<(), OrchestratorError> {
        let MessageContent::Staging {
            pipeline_id,
            stage_id,
            reason,
            ..
        } = &message.content
        else {
            return Ok(());
        };
        let Some(awaited) = self.take_awaiting(pipeline_id, *stage_id) else {
            return Ok(());
        };
        let reason = reason.as_deref().unwrap_or("rejected");
        self.fail(
            pipeline_id,
            &awaited.stage,
            &format!("stage results rejected: {}", reason),
        );
        Ok(())
    }
}

fn on_status_update(inner: Arc<Inner>, message: ProcessingMessage) -> BoxFuture<'static, anyhow::Result<()>> {
    async move { Ok(inner.handle_status_update(message).await?) }.boxed()
}

fn on_stage_complete(inner: Arc<Inner>, message: ProcessingMessage) -> BoxFuture<'static, anyhow::Result<()>> {
    async move { Ok(inner.handle_stage_complete(message).await?) }.boxed()
}

fn on_stage_failed(inner: Arc<Inner>, message: ProcessingMessage) -> BoxFuture<'static, anyhow::Result<()>> {
    async move { Ok(inner.handle_stage_failed(message).await?) }.boxed()
}

fn on_staging_approved(inner: Arc<Inner>, message: ProcessingMessage) -> BoxFuture<'static, anyhow::Result<()>> {
    async move { Ok(inner.handle_staging_approved(message).await?) }.boxed()
}

fn on_staging_rejected(inner: Arc<Inner>, message: ProcessingMessage) -> BoxFuture<'static, anyhow::Result<()>> {
    async move { Ok(inner.handle_staging_rejected(message).await?) }.boxed()
}
