//! End-to-end flows over the library: domain stages, control points,
//! routing and whole pipelines.

use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use conduit::broker::{
    MessageBroker, MessageContent, MessageType, ModuleIdentifier, ProcessingMessage, StepStatus,
};
use conduit::config::{BrokerConfig, ConduitToml, ControlPointConfig, HandlerConfig};
use conduit::control_point::{ControlPointManager, ControlPointRequest, ControlPointStatus};
use conduit::domains::{QualityHandler, QualityManager, QualityProgram};
use conduit::errors::ControlPointError;
use conduit::pipeline::{PipelineStatus, RoutingGraph};
use conduit::repository::InMemoryRepository;
use conduit::service::Runtime;
use conduit::staging::StagingStatus;

async fn next_of(
    rx: &mut mpsc::UnboundedReceiver<ProcessingMessage>,
    message_type: MessageType,
) -> ProcessingMessage {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("timed out")
            .expect("closed");
        if msg.message_type == message_type {
            return msg;
        }
    }
}

async fn wait_for_status(runtime: &Runtime, pipeline_id: &str, status: PipelineStatus) {
    for _ in 0..300 {
        if runtime
            .orchestrator()
            .get_status(pipeline_id)
            .is_some_and(|s| s.status == status)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pipeline {} never reached {}", pipeline_id, status);
}

async fn wait_for_terminal(runtime: &Runtime, pipeline_id: &str) -> PipelineStatus {
    for _ in 0..300 {
        if let Some(state) = runtime.orchestrator().get_status(pipeline_id) {
            if state.is_terminal() {
                return state.status;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pipeline {} did not finish", pipeline_id);
}

// =============================================================================
// Domain stage
// =============================================================================

mod quality_stage {
    use super::*;
    use conduit::broker::{Domain, DomainEvent};

    #[tokio::test]
    async fn test_quality_start_reports_every_phase_then_completes() {
        let broker = MessageBroker::new(BrokerConfig::default());
        let config = HandlerConfig::default();
        let handler = QualityHandler::new(broker.clone(), Arc::new(QualityProgram), config.clone());
        handler.register().unwrap();
        let manager = QualityManager::new(
            broker.clone(),
            &handler,
            Arc::new(InMemoryRepository::new()),
            config,
            Duration::from_secs(1),
        );
        manager.register().unwrap();
        let (_, mut events) = broker
            .subscribe_channel(ModuleIdentifier::service("observer"), &["quality.#"])
            .unwrap();

        let generation_id = manager
            .initiate_quality_check(
                "p1",
                json!({"records": [{"id": 1, "name": "a"}, {"id": 2, "name": "b"}]}),
                Value::Null,
            )
            .unwrap();

        let status_type = MessageType::domain(Domain::Quality, DomainEvent::StatusUpdate);
        let mut seen = Vec::new();
        for _ in 0..6 {
            let msg = next_of(&mut events, status_type).await;
            if let MessageContent::StatusUpdate { phase, status, .. } = msg.content {
                seen.push((phase, status));
            }
        }
        assert_eq!(
            seen,
            vec![
                ("detection".to_string(), StepStatus::Started),
                ("detection".to_string(), StepStatus::Completed),
                ("analysis".to_string(), StepStatus::Started),
                ("analysis".to_string(), StepStatus::Completed),
                ("resolution".to_string(), StepStatus::Started),
                ("resolution".to_string(), StepStatus::Completed),
            ]
        );

        let complete = next_of(
            &mut events,
            MessageType::domain(Domain::Quality, DomainEvent::Complete),
        )
        .await;
        match complete.content {
            MessageContent::Complete { results, .. } => {
                let keys: Vec<&str> = results.keys().map(String::as_str).collect();
                assert_eq!(
                    keys,
                    vec!["analysis_results", "detection_results", "resolution_results"]
                );
            }
            other => panic!("unexpected {:?}", other),
        }

        for _ in 0..100 {
            if manager
                .get_quality_status(generation_id)
                .is_some_and(|s| s.progress == 100)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("generation never reached 100%");
    }
}

// =============================================================================
// Control points
// =============================================================================

mod control_points {
    use super::*;

    #[tokio::test]
    async fn test_unanswered_control_point_times_out_once() {
        let broker = MessageBroker::new(BrokerConfig::default());
        let cps = ControlPointManager::new(broker.clone(), ControlPointConfig::default());
        let (_, mut events) = broker
            .subscribe_channel(ModuleIdentifier::service("observer"), &["control_point.#"])
            .unwrap();

        let id = cps
            .create_control_point(
                ControlPointRequest::new(
                    "p1",
                    "decision",
                    vec!["approve".to_string(), "reject".to_string()],
                )
                .with_timeout(Duration::from_secs(1)),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;

        let mut timeouts = 0;
        while let Ok(msg) = events.try_recv() {
            if msg.message_type == MessageType::ControlPointTimeout {
                timeouts += 1;
            }
        }
        assert_eq!(timeouts, 1);
        assert_eq!(cps.get(id).unwrap().status, ControlPointStatus::TimedOut);
        assert!(matches!(
            cps.submit_decision(id, "approve", json!({})),
            Err(ControlPointError::AlreadyResolved(_))
        ));
    }
}

// =============================================================================
// Routing
// =============================================================================

mod routing {
    use super::*;

    #[test]
    fn test_default_and_issue_edges() {
        let graph = RoutingGraph::new()
            .with_edge("a", None, &["b"])
            .with_edge("a", Some("x"), &["c"]);
        assert_eq!(graph.resolve("a", &[]), vec!["b"]);
        assert_eq!(graph.resolve("a", &["x".to_string()]), vec!["c"]);
        assert_eq!(graph.resolve("a", &["y".to_string()]), vec!["b"]);
        assert!(graph.resolve("b", &[]).is_empty());
    }
}

// =============================================================================
// Whole pipelines
// =============================================================================

mod pipelines {
    use super::*;

    fn sales() -> Value {
        json!({"records": [
            {"month": "jan", "sales": 100, "cost": 70},
            {"month": "feb", "sales": 120, "cost": 72},
            {"month": "mar", "sales": 150, "cost": 75},
            {"month": "apr", "sales": 170, "cost": 80},
        ]})
    }

    #[tokio::test]
    async fn test_pipeline_visits_every_stage() {
        let runtime = Runtime::new(ConduitToml::default(), Arc::new(InMemoryRepository::new()));
        runtime.start().unwrap();

        let pipeline_id = runtime
            .orchestrator()
            .submit(sales(), Value::Null)
            .await
            .unwrap();
        assert_eq!(
            wait_for_terminal(&runtime, &pipeline_id).await,
            PipelineStatus::Completed
        );

        let state = runtime.orchestrator().get_status(&pipeline_id).unwrap();
        assert_eq!(
            state.completed_stages,
            vec!["ingestion", "quality", "insight", "decision", "recommendation", "report"]
        );
        assert!(state.errors.is_empty());

        let report = runtime
            .staging()
            .latest_completed(&pipeline_id, "report")
            .unwrap();
        let markdown = report.payload["rendering_results"]["markdown"]
            .as_str()
            .unwrap();
        assert!(markdown.contains("## Recommendations"));
        assert!(markdown.contains("4 records ingested"));
        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_critical_quality_goes_straight_to_report() {
        let runtime = Runtime::new(ConduitToml::default(), Arc::new(InMemoryRepository::new()));
        runtime.start().unwrap();

        let pipeline_id = runtime
            .orchestrator()
            .submit(
                json!({"records": [{"a": null}, {"a": null}, {"a": 1}]}),
                Value::Null,
            )
            .await
            .unwrap();
        assert_eq!(
            wait_for_terminal(&runtime, &pipeline_id).await,
            PipelineStatus::Completed
        );

        let state = runtime.orchestrator().get_status(&pipeline_id).unwrap();
        assert_eq!(state.completed_stages, vec!["ingestion", "quality", "report"]);
        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_approval_stage_waits_for_decision() {
        let mut config = ConduitToml::default();
        config.pipeline.approval_stages = vec!["quality".to_string()];
        let runtime = Runtime::new(config, Arc::new(InMemoryRepository::new()));
        runtime.start().unwrap();
        let (_, mut events) = runtime
            .broker()
            .subscribe_channel(ModuleIdentifier::service("observer"), &["control_point.#"])
            .unwrap();

        let pipeline_id = runtime
            .orchestrator()
            .submit(sales(), Value::Null)
            .await
            .unwrap();

        let reached = next_of(&mut events, MessageType::ControlPointReached).await;
        let MessageContent::ControlPointReached {
            control_point_id,
            stage,
            options,
            ..
        } = reached.content
        else {
            panic!("unexpected {:?}", reached.content);
        };
        assert_eq!(stage, "quality");
        assert!(options.contains(&"approve".to_string()));
        wait_for_status(&runtime, &pipeline_id, PipelineStatus::Paused).await;

        runtime
            .decide(control_point_id, "approve", json!({}))
            .unwrap();
        assert_eq!(
            wait_for_terminal(&runtime, &pipeline_id).await,
            PipelineStatus::Completed
        );
        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_stops_pipeline() {
        let mut config = ConduitToml::default();
        config.pipeline.approval_stages = vec!["quality".to_string()];
        let runtime = Runtime::new(config, Arc::new(InMemoryRepository::new()));
        runtime.start().unwrap();

        let pipeline_id = runtime
            .orchestrator()
            .submit(sales(), Value::Null)
            .await
            .unwrap();
        wait_for_status(&runtime, &pipeline_id, PipelineStatus::Paused).await;

        runtime
            .orchestrator()
            .cancel(&pipeline_id, Some("operator".to_string()))
            .unwrap();
        assert_eq!(
            wait_for_terminal(&runtime, &pipeline_id).await,
            PipelineStatus::Cancelled
        );
        assert!(runtime.orchestrator().cancel(&pipeline_id, None).is_err());

        // the open approval gate and its staged record are released with the pipeline
        let mut released = false;
        for _ in 0..100 {
            let awaiting = runtime
                .staging()
                .for_pipeline(&pipeline_id)
                .iter()
                .any(|r| r.status == StagingStatus::AwaitingDecision);
            if !awaiting && runtime.control_points().pending_for_pipeline(&pipeline_id).is_empty() {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(released, "cancelled pipeline still holds an approval gate");
        let gated = runtime
            .staging()
            .for_pipeline(&pipeline_id)
            .into_iter()
            .find(|r| r.key == "quality")
            .unwrap();
        assert_eq!(gated.status, StagingStatus::Failed);
        assert_eq!(gated.reason.as_deref(), Some("cancelled"));
        runtime.stop().await;
    }
}
