//! Caller-facing front of a domain: generation bookkeeping, persistence and
//! stage reporting towards the orchestrator.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::handler::handler_identity;
use super::{ChannelHandler, DomainPhase, PhaseProgram, ROUTING_ISSUES_KEY};
use crate::broker::{
    DispatchTable, Domain, DomainEvent, MessageBroker, MessageContent, MessageType,
    ModuleIdentifier, ModuleKind, ProcessingMessage, StepStatus, SubscriptionId,
};
use crate::config::HandlerConfig;
use crate::errors::{BrokerError, RepositoryError};
use crate::repository::{Repository, call_with_timeout};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl GenerationState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Snapshot of one generation run.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationStatus {
    pub generation_id: Uuid,
    pub pipeline_id: String,
    pub domain: Domain,
    pub state: GenerationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    pub completed_phases: Vec<String>,
    pub phases: Vec<String>,
    pub progress: u8,
    /// Runs started for this generation, including retries
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<BTreeMap<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

struct Generation {
    status: GenerationStatus,
    data: Value,
    context: Value,
    correlation_id: Uuid,
}

struct ManagerInner {
    broker: MessageBroker,
    domain: Domain,
    phases: Vec<String>,
    identity: ModuleIdentifier,
    handler: ModuleIdentifier,
    repository: Arc<dyn Repository>,
    config: HandlerConfig,
    io_timeout: Duration,
    generations: Mutex<HashMap<Uuid, Generation>>,
}

/// Starts generations of a domain program and carries their outcome to the
/// repository and the pipeline orchestrator.
pub struct DomainManager<G> {
    inner: Arc<ManagerInner>,
    _program: PhantomData<fn() -> G>,
}

impl<G> Clone for DomainManager<G> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _program: PhantomData,
        }
    }
}

impl<G: PhaseProgram> DomainManager<G> {
    pub fn new(
        broker: MessageBroker,
        handler: &ChannelHandler<G>,
        repository: Arc<dyn Repository>,
        config: HandlerConfig,
        io_timeout: Duration,
    ) -> Self {
        let domain = handler.domain();
        let phases = handler
            .program()
            .phases()
            .iter()
            .map(|p| p.as_str().to_string())
            .collect();
        Self {
            inner: Arc::new(ManagerInner {
                broker,
                domain,
                phases,
                identity: ModuleIdentifier::new(format!("{}_manager", domain), ModuleKind::Manager)
                    .in_department(domain.as_str()),
                handler: handler.identity().clone(),
                repository,
                config,
                io_timeout,
                generations: Mutex::new(HashMap::new()),
            }),
            _program: PhantomData,
        }
    }
}

impl<G> DomainManager<G> {
    pub fn identity(&self) -> &ModuleIdentifier {
        &self.inner.identity
    }

    pub fn domain(&self) -> Domain {
        self.inner.domain
    }

    /// Subscribe to starts from collaborators and to the handler's reports.
    pub fn register(&self) -> Result<SubscriptionId, BrokerError> {
        let domain = self.inner.domain;
        let table = DispatchTable::new()
            .on(MessageType::domain(domain, DomainEvent::Start), on_start)
            .on(MessageType::domain(domain, DomainEvent::StatusUpdate), on_status_update)
            .on(MessageType::domain(domain, DomainEvent::Complete), on_complete)
            .on(MessageType::domain(domain, DomainEvent::Error), on_error)
            .on(MessageType::PipelineCancelled, on_cancelled);
        let patterns: Vec<String> = [
            DomainEvent::Start,
            DomainEvent::StatusUpdate,
            DomainEvent::Complete,
            DomainEvent::Error,
        ]
        .iter()
        .map(|event| format!("{}.{}.#", domain, event.as_str()))
        .collect();
        let patterns: Vec<&str> = patterns.iter().map(String::as_str).collect();
        self.inner.broker.subscribe_durable(
            self.inner.identity.clone(),
            &patterns,
            table.into_handler(Arc::clone(&self.inner)),
        )
    }

    /// Start a generation and return its id without waiting for it.
    pub fn initiate(&self, pipeline_id: &str, data: Value, context: Value) -> Result<Uuid, BrokerError> {
        self.inner
            .begin(pipeline_id, None, data, context, Uuid::new_v4())
    }

    pub fn get_status(&self, generation_id: Uuid) -> Option<GenerationStatus> {
        self.inner
            .lock()
            .get(&generation_id)
            .map(|g| g.status.clone())
    }

    /// Most recent generation for a pipeline.
    pub fn status_for_pipeline(&self, pipeline_id: &str) -> Option<GenerationStatus> {
        self.inner
            .lock()
            .values()
            .filter(|g| g.status.pipeline_id == pipeline_id)
            .max_by_key(|g| g.status.started_at)
            .map(|g| g.status.clone())
    }

    /// Drop finished generations last touched more than `older_than` ago.
    pub fn purge_finished(&self, older_than: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d))
        else {
            return 0;
        };
        let mut generations = self.inner.lock();
        let before = generations.len();
        generations.retain(|_, g| !g.status.state.is_terminal() || g.status.updated_at >= cutoff);
        before - generations.len()
    }
}

/// Distinct routing issues reported by any phase.
fn collect_issues(results: &BTreeMap<String, Value>) -> Vec<String> {
    let mut issues: Vec<String> = Vec::new();
    for value in results.values() {
        let Some(reported) = value.get(ROUTING_ISSUES_KEY).and_then(Value::as_array) else {
            continue;
        };
        for issue in reported.iter().filter_map(Value::as_str) {
            if !issues.iter().any(|i| i == issue) {
                issues.push(issue.to_string());
            }
        }
    }
    issues
}

impl ManagerInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Generation>> {
        self.generations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, message: ProcessingMessage) {
        if let Err(e) = self.broker.publish(message) {
            warn!(domain = %self.domain, error = %e, "manager could not publish");
        }
    }

    /// Record a generation and forward its start to the handler.
    #[instrument(skip(self, origin, data, context), fields(domain = %self.domain))]
    fn begin(
        &self,
        pipeline_id: &str,
        origin: Option<&ProcessingMessage>,
        data: Value,
        context: Value,
        generation_id: Uuid,
    ) -> Result<Uuid, BrokerError> {
        let content = MessageContent::Start {
            pipeline_id: pipeline_id.to_string(),
            generation_id: Some(generation_id),
            data: data.clone(),
            context: context.clone(),
        };
        let message_type = MessageType::domain(self.domain, DomainEvent::Start);
        let forward = match origin {
            Some(origin) => origin.derive(message_type, self.identity.clone(), content),
            None => ProcessingMessage::new(message_type, self.identity.clone(), content),
        }
        .to(self.handler.clone());

        let now = Utc::now();
        self.lock().insert(
            generation_id,
            Generation {
                status: GenerationStatus {
                    generation_id,
                    pipeline_id: pipeline_id.to_string(),
                    domain: self.domain,
                    state: GenerationState::Running,
                    current_phase: None,
                    completed_phases: Vec::new(),
                    phases: self.phases.clone(),
                    progress: 0,
                    attempts: 1,
                    results: None,
                    error: None,
                    started_at: now,
                    updated_at: now,
                },
                data,
                context,
                correlation_id: forward.metadata.correlation_id,
            },
        );

        if let Err(e) = self.broker.publish(forward) {
            self.lock().remove(&generation_id);
            return Err(e);
        }
        info!(pipeline_id, generation_id = %generation_id, "generation initiated");
        Ok(generation_id)
    }

    async fn persist<F>(&self, operation: &'static str, call: F)
    where
        F: FnOnce(&dyn Repository) -> Result<(), RepositoryError> + Send + 'static,
    {
        if let Err(e) = call_with_timeout(&self.repository, operation, self.io_timeout, call).await {
            warn!(domain = %self.domain, operation, error = %e, "repository call failed");
        }
    }

    fn handle_start(&self, message: &ProcessingMessage) {
        if message.source == self.identity {
            return;
        }
        let MessageContent::Start {
            pipeline_id,
            generation_id,
            data,
            context,
        } = &message.content
        else {
            return;
        };
        let generation_id = generation_id.unwrap_or_else(Uuid::new_v4);
        if let Err(e) = self.begin(pipeline_id, Some(message), data.clone(), context.clone(), generation_id) {
            warn!(pipeline_id = %pipeline_id, domain = %self.domain, error = %e, "could not forward start");
        }
    }

    async fn handle_status_update(&self, message: &ProcessingMessage) {
        let MessageContent::StatusUpdate {
            pipeline_id,
            generation_id: Some(generation_id),
            phase,
            status,
            progress,
        } = &message.content
        else {
            return;
        };
        let known = self
            .lock()
            .get_mut(generation_id)
            .filter(|g| !g.status.state.is_terminal())
            .map(|g| {
                let s = &mut g.status;
                s.current_phase = Some(phase.clone());
                if *status == StepStatus::Completed && !s.completed_phases.contains(phase) {
                    s.completed_phases.push(phase.clone());
                }
                s.progress = s.progress.max(*progress);
                s.updated_at = Utc::now();
            })
            .is_some();
        if !known {
            debug!(generation_id = %generation_id, "status update for unknown generation");
            return;
        }

        let condensed = format!("{}.{}", phase, status.as_str());
        self.publish(message.derive(
            MessageType::PipelineStatusUpdate,
            self.identity.clone(),
            MessageContent::PipelineStatus {
                pipeline_id: pipeline_id.clone(),
                stage: self.domain.as_str().to_string(),
                status: condensed.clone(),
                progress: *progress,
            },
        ));
        let (pipeline_id, progress) = (pipeline_id.clone(), *progress);
        let status = format!("{}.{}", self.domain, condensed);
        self.persist("update_status", move |repo| {
            repo.update_status(&pipeline_id, &status, progress)
        })
        .await;
    }

    async fn handle_complete(&self, message: &ProcessingMessage) {
        let MessageContent::Complete {
            pipeline_id,
            generation_id: Some(generation_id),
            results,
        } = &message.content
        else {
            return;
        };
        let finished = self
            .lock()
            .get_mut(generation_id)
            .filter(|g| !g.status.state.is_terminal())
            .map(|g| {
                g.status.state = GenerationState::Completed;
                g.status.current_phase = None;
                g.status.progress = 100;
                g.status.results = Some(results.clone());
                g.status.updated_at = Utc::now();
            })
            .is_some();
        if !finished {
            debug!(generation_id = %generation_id, "completion for unknown or finished generation");
            return;
        }
        info!(pipeline_id = %pipeline_id, domain = %self.domain, generation_id = %generation_id, "generation completed");

        let (repo_pipeline, domain) = (pipeline_id.clone(), self.domain.as_str());
        let payload = serde_json::to_value(results).unwrap_or(Value::Null);
        self.persist("save_results", move |repo| {
            repo.save_results(&repo_pipeline, domain, &payload)
        })
        .await;

        self.publish(message.derive(
            MessageType::PipelineStageComplete,
            self.identity.clone(),
            MessageContent::StageComplete {
                pipeline_id: pipeline_id.clone(),
                stage: self.domain.as_str().to_string(),
                results: results.clone(),
                issues: collect_issues(results),
            },
        ));
    }

    async fn handle_error(&self, message: &ProcessingMessage) {
        let MessageContent::Error {
            pipeline_id,
            generation_id,
            error,
            phase,
            escalated,
            retryable,
            ..
        } = &message.content
        else {
            return;
        };

        // Escalations may arrive without a generation; pin them to the latest
        // running one for the pipeline.
        let generation_id = generation_id.or_else(|| {
            self.lock()
                .values()
                .filter(|g| g.status.pipeline_id == *pipeline_id && !g.status.state.is_terminal())
                .max_by_key(|g| g.status.started_at)
                .map(|g| g.status.generation_id)
        });

        let retry = generation_id.and_then(|id| {
            let mut generations = self.lock();
            let generation = generations.get_mut(&id)?;
            if generation.status.state.is_terminal() {
                return None;
            }
            let can_retry =
                !*escalated && *retryable && generation.status.attempts <= self.config.max_retries;
            generation.status.updated_at = Utc::now();
            if can_retry {
                generation.status.attempts += 1;
                generation.status.current_phase = None;
                generation.status.completed_phases.clear();
                generation.status.progress = 0;
                Some(Some((
                    generation.data.clone(),
                    generation.context.clone(),
                    generation.correlation_id,
                    generation.status.attempts,
                )))
            } else {
                generation.status.state = GenerationState::Failed;
                generation.status.error = Some(error.clone());
                Some(None)
            }
        });

        match retry {
            None => {
                debug!(pipeline_id = %pipeline_id, domain = %self.domain, "error for unknown or finished generation");
            }
            Some(Some((data, context, correlation_id, attempt))) => {
                warn!(
                    pipeline_id = %pipeline_id,
                    domain = %self.domain,
                    attempt,
                    error = %error,
                    "retrying failed generation"
                );
                let restart = ProcessingMessage::new(
                    MessageType::domain(self.domain, DomainEvent::Start),
                    self.identity.clone(),
                    MessageContent::Start {
                        pipeline_id: pipeline_id.clone(),
                        generation_id,
                        data,
                        context,
                    },
                )
                .with_correlation_id(correlation_id)
                .to(self.handler.clone());
                self.publish(restart);
            }
            Some(None) => {
                warn!(pipeline_id = %pipeline_id, domain = %self.domain, error = %error, "stage failed");
                let (repo_pipeline, repo_error, stage) =
                    (pipeline_id.clone(), error.clone(), self.domain.as_str());
                self.persist("log_error", move |repo| {
                    repo.log_error(&repo_pipeline, &repo_error, stage)
                })
                .await;
                self.publish(message.derive(
                    MessageType::PipelineStageFailed,
                    self.identity.clone(),
                    MessageContent::StageFailed {
                        pipeline_id: pipeline_id.clone(),
                        stage: self.domain.as_str().to_string(),
                        error: error.clone(),
                        phase: phase.clone(),
                    },
                ));
            }
        }
    }

    fn handle_cancelled(&self, message: &ProcessingMessage) {
        let Some(pipeline_id) = message.pipeline_id() else {
            return;
        };
        for generation in self.lock().values_mut() {
            if generation.status.pipeline_id == pipeline_id && !generation.status.state.is_terminal() {
                generation.status.state = GenerationState::Cancelled;
                generation.status.updated_at = Utc::now();
            }
        }
    }
}

fn on_start(inner: Arc<ManagerInner>, message: ProcessingMessage) -> BoxFuture<'static, anyhow::Result<()>> {
    async move {
        inner.handle_start(&message);
        Ok(())
    }
    .boxed()
}

fn on_status_update(inner: Arc<ManagerInner>, message: ProcessingMessage) -> BoxFuture<'static, anyhow::Result<()>> {
    async move {
        inner.handle_status_update(&message).await;
        Ok(())
    }
    .boxed()
}

fn on_complete(inner: Arc<ManagerInner>, message: ProcessingMessage) -> BoxFuture<'static, anyhow::Result<()>> {
    async move {
        inner.handle_complete(&message).await;
        Ok(())
    }
    .boxed()
}

fn on_error(inner: Arc<ManagerInner>, message: ProcessingMessage) -> BoxFuture<'static, anyhow::Result<()>> {
    async move {
        inner.handle_error(&message).await;
        Ok(())
    }
    .boxed()
}

fn on_cancelled(inner: Arc<ManagerInner>, message: ProcessingMessage) -> BoxFuture<'static, anyhow::Result<()>> {
    async move {
        inner.handle_cancelled(&message);
        Ok(())
    }
    .boxed()
}
