//! The conduit runtime: owns and wires every component.
//!
//! There is no process-wide singleton. A [`Runtime`] is built from a
//! [`ConduitToml`], `start()`ed to register its subscriptions and background
//! tasks, and `stop()`ped to tear them down again.

use anyhow::{Context, Result};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::broker::{MessageBroker, SubscriptionId};
use crate::config::{ConduitToml, HandlerConfig};
use crate::control_point::{ControlPoint, ControlPointManager};
use crate::domains::{
    DecisionProgram, InsightProgram, QualityProgram, RecommendationProgram, ReportProgram,
};
use crate::errors::{BrokerError, ControlPointError};
use crate::phase::{ChannelHandler, DomainManager, PhaseProgram};
use crate::pipeline::{PipelineOrchestrator, RoutingGraph};
use crate::repository::{self, Repository};
use crate::staging::StagingManager;

/// A domain's handler and the manager driving it.
pub struct DomainStage<G: PhaseProgram> {
    pub handler: ChannelHandler<G>,
    pub manager: DomainManager<G>,
}

impl<G: PhaseProgram> DomainStage<G> {
    fn new(
        broker: &MessageBroker,
        program: G,
        repository: Arc<dyn Repository>,
        config: &HandlerConfig,
        io_timeout: Duration,
    ) -> Self {
        let handler = ChannelHandler::new(broker.clone(), Arc::new(program), config.clone());
        let manager = DomainManager::new(
            broker.clone(),
            &handler,
            repository,
            config.clone(),
            io_timeout,
        );
        Self { handler, manager }
    }

    fn register(&self) -> Result<Vec<SubscriptionId>, BrokerError> {
        Ok(vec![self.handler.register()?, self.manager.register()?])
    }
}

pub struct Runtime {
    config: ConduitToml,
    broker: MessageBroker,
    control_points: ControlPointManager,
    staging: StagingManager,
    orchestrator: PipelineOrchestrator,
    repository: Arc<dyn Repository>,
    pub quality: DomainStage<QualityProgram>,
    pub insight: DomainStage<InsightProgram>,
    pub decision: DomainStage<DecisionProgram>,
    pub recommendation: DomainStage<RecommendationProgram>,
    pub report: DomainStage<ReportProgram>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    pub fn new(config: ConduitToml, repository: Arc<dyn Repository>) -> Self {
        let broker = MessageBroker::new(config.broker.clone());
        let control_points = ControlPointManager::new(broker.clone(), config.control_points.clone());
        let staging = StagingManager::new(
            broker.clone(),
            control_points.clone(),
            config.staging.clone(),
        );
        let orchestrator = PipelineOrchestrator::new(
            broker.clone(),
            staging.clone(),
            RoutingGraph::with_overrides(&config.pipeline.routes),
            config.pipeline.clone(),
        );

        let handlers = &config.handlers;
        let io_timeout = config.repository.io_timeout();
        let decision_program = if handlers.decision_requires_approval {
            DecisionProgram::with_approval(control_points.clone(), handlers.decision_timeout())
        } else {
            DecisionProgram::new()
        };

        let quality = DomainStage::new(
            &broker,
            QualityProgram,
            Arc::clone(&repository),
            handlers,
            io_timeout,
        );
        let insight = DomainStage::new(
            &broker,
            InsightProgram::new(handlers.insight_min_confidence),
            Arc::clone(&repository),
            handlers,
            io_timeout,
        );
        let decision = DomainStage::new(
            &broker,
            decision_program,
            Arc::clone(&repository),
            handlers,
            io_timeout,
        );
        let recommendation = DomainStage::new(
            &broker,
            RecommendationProgram::new(handlers.recommendation_top_k),
            Arc::clone(&repository),
            handlers,
            io_timeout,
        );
        let report = DomainStage::new(
            &broker,
            ReportProgram,
            Arc::clone(&repository),
            handlers,
            io_timeout,
        );

        Self {
            config,
            broker,
            control_points,
            staging,
            orchestrator,
            repository,
            quality,
            insight,
            decision,
            recommendation,
            report,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Build a runtime whose repository comes from `[repository]`, with
    /// relative directories resolved against `base_dir`.
    pub fn from_config(config: ConduitToml, base_dir: &Path) -> Result<Self> {
        let repository = repository::from_config(&config.repository, base_dir)
            .context("Failed to open repository")?;
        Ok(Self::new(config, repository))
    }

    /// Register every subscription and spawn the maintenance tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), BrokerError> {
        let mut subscriptions = vec![
            self.control_points.register()?,
            self.staging.register()?,
            self.orchestrator.register()?,
        ];
        subscriptions.extend(self.quality.register()?);
        subscriptions.extend(self.insight.register()?);
        subscriptions.extend(self.decision.register()?);
        subscriptions.extend(self.recommendation.register()?);
        subscriptions.extend(self.report.register()?);

        let interval = self.config.broker.cleanup_interval();
        let retention = self.config.pipeline.retention();
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.push(self.broker.spawn_maintenance(self.cancel.clone()));
        tasks.push(self.staging.spawn_sweeper(self.cancel.clone()));
        tasks.push(
            self.control_points
                .spawn_purger(interval, self.cancel.clone()),
        );
        tasks.push(
            self.orchestrator
                .spawn_reclaimer(interval, self.cancel.clone()),
        );
        tasks.push(self.spawn_generation_purger(interval, retention));

        info!(
            subscriptions = subscriptions.len(),
            tasks = tasks.len(),
            "conduit runtime started"
        );
        Ok(())
    }

    fn spawn_generation_purger(&self, interval: Duration, retention: Duration) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        let quality = self.quality.manager.clone();
        let insight = self.insight.manager.clone();
        let decision = self.decision.manager.clone();
        let recommendation = self.recommendation.manager.clone();
        let report = self.report.manager.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = quality.purge_finished(retention)
                            + insight.purge_finished(retention)
                            + decision.purge_finished(retention)
                            + recommendation.purge_finished(retention)
                            + report.purge_finished(retention);
                        if purged > 0 {
                            debug!(purged, "purged finished generations");
                        }
                    }
                }
            }
        })
    }

    /// Cancel the background tasks and stop the broker.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
        self.broker.stop();
        info!("conduit runtime stopped");
    }

    pub fn config(&self) -> &ConduitToml {
        &self.config
    }

    pub fn broker(&self) -> &MessageBroker {
        &self.broker
    }

    pub fn control_points(&self) -> &ControlPointManager {
        &self.control_points
    }

    pub fn staging(&self) -> &StagingManager {
        &self.staging
    }

    pub fn orchestrator(&self) -> &PipelineOrchestrator {
        &self.orchestrator
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    /// Resolve a control point on behalf of an operator.
    pub fn decide(
        &self,
        control_point_id: Uuid,
        decision: &str,
        details: Value,
    ) -> Result<ControlPoint, ControlPointError> {
        self.control_points
            .submit_decision(control_point_id, decision, details)
    }
}
