//! Broker-facing executor for one domain program.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{DomainContext, DomainPhase, PhaseProgram, PhaseProgress, PhaseRunner};
use crate::broker::{
    DispatchTable, Domain, DomainEvent, MessageBroker, MessageContent, MessageType,
    ModuleIdentifier, ModuleKind, ProcessingMessage, SubscriptionId,
};
use crate::config::HandlerConfig;
use crate::errors::{BrokerError, PhaseError};
use crate::retry::Retryable;

struct ActiveRun {
    generation_id: Uuid,
    cancel: CancellationToken,
}

struct HandlerInner<G: PhaseProgram> {
    broker: MessageBroker,
    runner: PhaseRunner<G>,
    domain: Domain,
    identity: ModuleIdentifier,
    config: HandlerConfig,
    runs: Mutex<HashMap<String, ActiveRun>>,
    recoveries: Mutex<HashMap<String, u32>>,
}

/// Runs a [`PhaseProgram`] for every `start` addressed to it and reports
/// progress, results and failures back on the broker.
pub struct ChannelHandler<G: PhaseProgram> {
    inner: Arc<HandlerInner<G>>,
}

impl<G: PhaseProgram> Clone for ChannelHandler<G> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Address of the handler for `domain`.
pub(super) fn handler_identity(domain: Domain) -> ModuleIdentifier {
    ModuleIdentifier::new(format!("{}_handler", domain), ModuleKind::Handler).in_department(domain.as_str())
}

impl<G: PhaseProgram> ChannelHandler<G> {
    pub fn new(broker: MessageBroker, program: Arc<G>, config: HandlerConfig) -> Self {
        let domain = program.domain();
        Self {
            inner: Arc::new(HandlerInner {
                broker,
                runner: PhaseRunner::new(program),
                domain,
                identity: handler_identity(domain),
                config,
                runs: Mutex::new(HashMap::new()),
                recoveries: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn identity(&self) -> &ModuleIdentifier {
        &self.inner.identity
    }

    pub fn domain(&self) -> Domain {
        self.inner.domain
    }

    pub fn program(&self) -> &G {
        self.inner.runner.program()
    }

    /// Subscribe to starts addressed to this handler and to externally
    /// reported errors for the domain.
    pub fn register(&self) -> Result<SubscriptionId, BrokerError> {
        let domain = self.inner.domain;
        let table = DispatchTable::new()
            .on(MessageType::domain(domain, DomainEvent::Start), on_start::<G>)
            .on(
                MessageType::domain(domain, DomainEvent::ErrorReport),
                on_error_report::<G>,
            )
            .on(MessageType::PipelineCancelled, on_cancelled::<G>);
        let own_key = self.inner.identity.direct_key();
        let error_reports = format!("{}.error_report.#", domain);
        self.inner.broker.subscribe_durable(
            self.inner.identity.clone(),
            &[own_key.as_str(), error_reports.as_str()],
            table.into_handler(Arc::clone(&self.inner)),
        )
    }

    pub fn is_running(&self, pipeline_id: &str) -> bool {
        self.inner.runs().contains_key(pipeline_id)
    }

    pub fn active_runs(&self) -> usize {
        self.inner.runs().len()
    }

    /// Abort the run for a pipeline. Returns whether one was active.
    pub fn cancel(&self, pipeline_id: &str) -> bool {
        self.inner.cancel(pipeline_id)
    }
}

impl<G: PhaseProgram> HandlerInner<G> {
    fn runs(&self) -> MutexGuard<'_, HashMap<String, ActiveRun>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel(&self, pipeline_id: &str) -> bool {
        self.recoveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(pipeline_id);
        match self.runs().remove(pipeline_id) {
            Some(run) => {
                run.cancel.cancel();
                info!(pipeline_id, domain = %self.domain, generation_id = %run.generation_id, "run cancelled");
                true
            }
            None => false,
        }
    }

    fn publish(&self, message: ProcessingMessage) {
        if let Err(e) = self.broker.publish(message) {
            warn!(domain = %self.domain, error = %e, "handler could not publish");
        }
    }

    fn start(self: &Arc<Self>, message: ProcessingMessage) {
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
        let cancel = CancellationToken::new();
        let previous = self.runs().insert(
            pipeline_id.clone(),
            ActiveRun {
                generation_id,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            warn!(
                pipeline_id = %pipeline_id,
                domain = %self.domain,
                replaced = %previous.generation_id,
                "replacing an active run"
            );
            previous.cancel.cancel();
        }

        let ctx = DomainContext::new(
            pipeline_id.clone(),
            generation_id,
            message.metadata.correlation_id,
            data.clone(),
            context.clone(),
        );
        info!(pipeline_id = %pipeline_id, domain = %self.domain, generation_id = %generation_id, "run started");
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.execute(message, ctx, cancel).await });
    }

    async fn execute(
        &self,
        origin: ProcessingMessage,
        mut ctx: DomainContext<G::Phase>,
        cancel: CancellationToken,
    ) {
        let pipeline_id = ctx.pipeline_id.clone();
        let generation_id = ctx.generation_id;
        let outcome = self
            .runner
            .run(&mut ctx, &cancel, |progress: PhaseProgress<G::Phase>| {
                self.publish(origin.derive(
                    MessageType::domain(self.domain, DomainEvent::StatusUpdate),
                    self.identity.clone(),
                    MessageContent::StatusUpdate {
                        pipeline_id: pipeline_id.clone(),
                        generation_id: Some(generation_id),
                        phase: progress.phase.as_str().to_string(),
                        status: progress.status,
                        progress: progress.progress,
                    },
                ));
            })
            .await;

        {
            let mut runs = self.runs();
            if runs
                .get(&pipeline_id)
                .is_some_and(|r| r.generation_id == generation_id)
            {
                runs.remove(&pipeline_id);
            }
        }

        match outcome {
            Ok(results) => {
                self.recoveries
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&pipeline_id);
                info!(pipeline_id = %pipeline_id, domain = %self.domain, "run completed");
                self.publish(origin.derive(
                    MessageType::domain(self.domain, DomainEvent::Complete),
                    self.identity.clone(),
                    MessageContent::Complete {
                        pipeline_id,
                        generation_id: Some(generation_id),
                        results,
                    },
                ));
            }
            Err(PhaseError::Cancelled { phase }) => {
                debug!(pipeline_id = %pipeline_id, domain = %self.domain, phase, "run dropped after cancellation");
            }
            Err(e) => {
                self.publish(origin.derive(
                    MessageType::domain(self.domain, DomainEvent::Error),
                    self.identity.clone(),
                    MessageContent::Error {
                        pipeline_id,
                        generation_id: Some(generation_id),
                        error: e.to_string(),
                        stage: self.domain.as_str().to_string(),
                        phase: Some(e.phase().to_string()),
                        escalated: false,
                        retryable: e.is_retryable(),
                    },
                ));
            }
        }
    }

    /// Answer an externally reported error with a recovery notice to its
    /// origin, escalating once the attempts are used up.
    fn recover(&self, message: &ProcessingMessage) {
        let MessageContent::ErrorReport { pipeline_id, error } = &message.content else {
            return;
        };
        let max_attempts = self.config.max_recovery_attempts;
        let attempt = {
            let mut recoveries = self.recoveries.lock().unwrap_or_else(PoisonError::into_inner);
            let attempt = recoveries.entry(pipeline_id.clone()).or_insert(0);
            *attempt += 1;
            let current = *attempt;
            if current > max_attempts {
                recoveries.remove(pipeline_id);
            }
            current
        };

        if attempt <= max_attempts {
            info!(pipeline_id = %pipeline_id, domain = %self.domain, attempt, max_attempts, "recovery attempt");
            self.publish(
                message
                    .derive(
                        MessageType::domain(self.domain, DomainEvent::Recovery),
                        self.identity.clone(),
                        MessageContent::Recovery {
                            pipeline_id: pipeline_id.clone(),
                            attempt,
                            max_attempts,
                            error: error.clone(),
                        },
                    )
                    .to(message.source.clone()),
            );
            return;
        }

        warn!(pipeline_id = %pipeline_id, domain = %self.domain, error = %error, "recovery exhausted, escalating");
        let generation_id = self.runs().remove(pipeline_id).map(|run| {
            run.cancel.cancel();
            run.generation_id
        });
        self.publish(message.derive(
            MessageType::domain(self.domain, DomainEvent::Error),
            self.identity.clone(),
            MessageContent::Error {
                pipeline_id: pipeline_id.clone(),
                generation_id,
                error: error.clone(),
                stage: self.domain.as_str().to_string(),
                phase: None,
                escalated: true,
                retryable: false,
            },
        ));
    }
}

fn on_start<G: PhaseProgram>(
    inner: Arc<HandlerInner<G>>,
    message: ProcessingMessage,
) -> BoxFuture<'static, anyhow::Result<()>> {
    async move {
        inner.start(message);
        Ok(())
    }
    .boxed()
}

fn on_error_report<G: PhaseProgram>(
    inner: Arc<HandlerInner<G>>,
    message: ProcessingMessage,
) -> BoxFuture<'static, anyhow::Result<()>> {
    async move {
        inner.recover(&message);
        Ok(())
    }
    .boxed()
}

fn on_cancelled<G: PhaseProgram>(
    inner: Arc<HandlerInner<G>>,
    message: ProcessingMessage,
) -> BoxFuture<'static, anyhow::Result<()>> {
    async move {
        if let Some(pipeline_id) = message.pipeline_id() {
            inner.cancel(pipeline_id);
        }
        Ok(())
    }
    .boxed()
}
