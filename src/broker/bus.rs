//! In-process publish/subscribe bus.
//!
//! Each subscription owns an unbounded queue drained by one worker task, so a
//! subscriber sees messages in publish order while fan-out across
//! subscribers stays concurrent. A failing or panicking handler only affects
//! its own delivery.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::identifier::ModuleIdentifier;
use super::message::{MessageContent, MessageType, ProcessingMessage};
use super::pattern;
use crate::config::BrokerConfig;
use crate::errors::BrokerError;

pub type SubscriptionId = Uuid;

/// Receives messages delivered to a subscription.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: ProcessingMessage) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(ProcessingMessage) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, message: ProcessingMessage) -> anyhow::Result<()> {
        (self.0)(message).await
    }
}

/// Wrap an async closure as a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(ProcessingMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Forwards every delivery into a channel.
struct ChannelForwarder(mpsc::UnboundedSender<ProcessingMessage>);

#[async_trait]
impl MessageHandler for ChannelForwarder {
    async fn handle(&self, message: ProcessingMessage) -> anyhow::Result<()> {
        self.0
            .send(message)
            .map_err(|_| anyhow::anyhow!("subscriber channel closed"))
    }
}

/// Counters exposed by [`MessageBroker::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub published: u64,
    pub delivered: u64,
    pub processed: u64,
    pub failed: u64,
    pub active_subscriptions: usize,
}

/// Snapshot of one subscription.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub identifier: ModuleIdentifier,
    pub patterns: Vec<String>,
    pub durable: bool,
    pub active: bool,
    pub message_count: u64,
    pub created_at: DateTime<Utc>,
}

/// One message recorded in the correlation history.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub message_id: Uuid,
    pub message_type: MessageType,
    pub routing_key: String,
    pub recipients: usize,
    pub recorded_at: DateTime<Utc>,
}

struct Activity {
    message_count: AtomicU64,
    last_activity: Mutex<Instant>,
}

impl Activity {
    fn new() -> Self {
        Self {
            message_count: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        self.message_count.fetch_add(1, Ordering::Relaxed);
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

struct Subscription {
    identifier: ModuleIdentifier,
    patterns: Vec<String>,
    durable: bool,
    active: Arc<AtomicBool>,
    activity: Arc<Activity>,
    created_at: DateTime<Utc>,
    queue: mpsc::UnboundedSender<ProcessingMessage>,
    worker: JoinHandle<()>,
}

struct BrokerInner {
    identity: ModuleIdentifier,
    config: BrokerConfig,
    running: AtomicBool,
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    history: Mutex<HashMap<Uuid, VecDeque<HistoryEntry>>>,
    published: AtomicU64,
    delivered: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
}

/// Pattern-routed message bus. Cloning yields another handle to the same bus.
#[derive(Clone)]
pub struct MessageBroker {
    inner: Arc<BrokerInner>,
}

impl MessageBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                identity: ModuleIdentifier::service("message_broker"),
                config,
                running: AtomicBool::new(true),
                subscriptions: RwLock::new(HashMap::new()),
                history: Mutex::new(HashMap::new()),
                published: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                processed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Register `handler` for every message whose routing key matches one of
    /// `patterns`. Idle subscriptions are purged by maintenance.
    pub fn subscribe(
        &self,
        identifier: ModuleIdentifier,
        patterns: &[&str],
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionId, BrokerError> {
        self.register(identifier, patterns, handler, false)
    }

    /// Like [`subscribe`](Self::subscribe) but never purged for inactivity.
    pub fn subscribe_durable(
        &self,
        identifier: ModuleIdentifier,
        patterns: &[&str],
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionId, BrokerError> {
        self.register(identifier, patterns, handler, true)
    }

    /// Subscribe and receive matching messages on a channel.
    pub fn subscribe_channel(
        &self,
        identifier: ModuleIdentifier,
        patterns: &[&str],
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<ProcessingMessage>), BrokerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.register(identifier, patterns, Arc::new(ChannelForwarder(tx)), false)?;
        Ok((id, rx))
    }

    fn register(
        &self,
        identifier: ModuleIdentifier,
        patterns: &[&str],
        handler: Arc<dyn MessageHandler>,
        durable: bool,
    ) -> Result<SubscriptionId, BrokerError> {
        if !self.is_running() {
            return Err(BrokerError::NotRunning);
        }
        identifier.validate()?;
        if patterns.is_empty() {
            return Err(BrokerError::Subscription(format!(
                "{} subscribed with an empty pattern set",
                identifier
            )));
        }
        for p in patterns {
            pattern::validate_pattern(p)?;
        }

        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));
        let activity = Arc::new(Activity::new());
        let worker = tokio::spawn(delivery_worker(
            Arc::downgrade(&self.inner),
            identifier.clone(),
            handler,
            Arc::clone(&active),
            Arc::clone(&activity),
            rx,
        ));

        let subscription = Subscription {
            identifier: identifier.clone(),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            durable,
            active,
            activity,
            created_at: Utc::now(),
            queue: tx,
            worker,
        };
        self.inner.write_subscriptions().insert(id, subscription);
        debug!(subscription_id = %id, subscriber = %identifier, ?patterns, durable, "subscribed");
        Ok(id)
    }

    /// Deactivate and remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.inner.write_subscriptions().remove(&id);
        match removed {
            Some(sub) => {
                sub.active.store(false, Ordering::SeqCst);
                debug!(subscription_id = %id, subscriber = %sub.identifier, "unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Queue `message` on every matching subscription and return the number
    /// of recipients. Fails only once the broker is stopped.
    pub fn publish(&self, message: ProcessingMessage) -> Result<usize, BrokerError> {
        if !self.is_running() {
            return Err(BrokerError::NotRunning);
        }
        let routing_key = message.routing_key();
        let mut recipients = 0;
        {
            let subscriptions = self.inner.read_subscriptions();
            for sub in subscriptions.values() {
                if !sub.active.load(Ordering::SeqCst) {
                    continue;
                }
                let selected = if message.metadata.broadcast {
                    match &message.source.department {
                        Some(dept) => sub.identifier.department.as_deref() == Some(dept.as_str()),
                        None => true,
                    }
                } else {
                    sub.patterns
                        .iter()
                        .any(|p| pattern::matches(&routing_key, p))
                };
                if selected && sub.queue.send(message.clone()).is_ok() {
                    recipients += 1;
                }
            }
        }

        self.inner.published.fetch_add(1, Ordering::Relaxed);
        self.inner
            .delivered
            .fetch_add(recipients as u64, Ordering::Relaxed);
        self.inner.record_history(&message, &routing_key, recipients);
        debug!(
            message_id = %message.id,
            message_type = %message.message_type,
            routing_key = %routing_key,
            recipients,
            "published"
        );
        Ok(recipients)
    }

    /// Messages recorded for a correlation id, oldest first.
    pub fn history(&self, correlation_id: Uuid) -> Vec<HistoryEntry> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&correlation_id)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            published: self.inner.published.load(Ordering::Relaxed),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            processed: self.inner.processed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            active_subscriptions: self.inner.read_subscriptions().len(),
        }
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.inner
            .read_subscriptions()
            .iter()
            .map(|(id, sub)| SubscriptionInfo {
                id: *id,
                identifier: sub.identifier.clone(),
                patterns: sub.patterns.clone(),
                durable: sub.durable,
                active: sub.active.load(Ordering::SeqCst),
                message_count: sub.activity.message_count.load(Ordering::Relaxed),
                created_at: sub.created_at,
            })
            .collect()
    }

    /// Drop history older than the message TTL and non-durable subscriptions
    /// idle past the subscription TTL. Returns `(history, subscriptions)` removed.
    pub fn purge_expired(&self) -> (usize, usize) {
        let message_ttl = chrono::Duration::from_std(self.inner.config.message_ttl())
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now().checked_sub_signed(message_ttl);
        let mut history_removed = 0;
        if let Some(cutoff) = cutoff {
            let mut history = self
                .inner
                .history
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for entries in history.values_mut() {
                let before = entries.len();
                entries.retain(|e| e.recorded_at >= cutoff);
                history_removed += before - entries.len();
            }
            history.retain(|_, entries| !entries.is_empty());
        }

        let idle_ttl = self.inner.config.subscription_ttl();
        let mut subscriptions = self.inner.write_subscriptions();
        let stale: Vec<SubscriptionId> = subscriptions
            .iter()
            .filter(|(_, sub)| !sub.durable && sub.activity.idle_for() > idle_ttl)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            if let Some(sub) = subscriptions.remove(id) {
                sub.active.store(false, Ordering::SeqCst);
                info!(subscription_id = %id, subscriber = %sub.identifier, "purged idle subscription");
            }
        }
        (history_removed, stale.len())
    }

    /// Run [`purge_expired`](Self::purge_expired) every cleanup interval
    /// until `cancel` fires.
    pub fn spawn_maintenance(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let broker = self.clone();
        let interval = self.inner.config.cleanup_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let (history, subscriptions) = broker.purge_expired();
                        if history > 0 || subscriptions > 0 {
                            debug!(history, subscriptions, "broker maintenance purged entries");
                        }
                    }
                }
            }
        })
    }

    /// Stop accepting publishes and tear down every subscription worker.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<Subscription> = self
            .inner
            .write_subscriptions()
            .drain()
            .map(|(_, sub)| sub)
            .collect();
        for sub in drained {
            sub.active.store(false, Ordering::SeqCst);
            sub.worker.abort();
        }
        info!("message broker stopped");
    }
}

impl BrokerInner {
    fn read_subscriptions(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<SubscriptionId, Subscription>> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_subscriptions(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<SubscriptionId, Subscription>> {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn record_history(&self, message: &ProcessingMessage, routing_key: &str, recipients: usize) {
        let limit = self.config.history_limit.max(1);
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let entries = history.entry(message.metadata.correlation_id).or_default();
        entries.push_back(HistoryEntry {
            message_id: message.id,
            message_type: message.message_type,
            routing_key: routing_key.to_string(),
            recipients,
            recorded_at: Utc::now(),
        });
        while entries.len() > limit {
            entries.pop_front();
        }
    }
}

async fn delivery_worker(
    broker: Weak<BrokerInner>,
    subscriber: ModuleIdentifier,
    handler: Arc<dyn MessageHandler>,
    active: Arc<AtomicBool>,
    activity: Arc<Activity>,
    mut queue: mpsc::UnboundedReceiver<ProcessingMessage>,
) {
    while let Some(message) = queue.recv().await {
        if !active.load(Ordering::SeqCst) {
            break;
        }
        activity.touch();
        let outcome = AssertUnwindSafe(handler.handle(message.clone()))
            .catch_unwind()
            .await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(panic) => Some(panic_message(panic.as_ref())),
        };

        let Some(inner) = broker.upgrade() else {
            break;
        };
        match failure {
            None => {
                inner.processed.fetch_add(1, Ordering::Relaxed);
            }
            Some(error) => {
                inner.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    subscriber = %subscriber,
                    message_id = %message.id,
                    message_type = %message.message_type,
                    error = %error,
                    "delivery failed"
                );
                report_delivery_failure(&inner, &subscriber, &message, error);
            }
        }
    }
}

fn report_delivery_failure(
    inner: &Arc<BrokerInner>,
    subscriber: &ModuleIdentifier,
    original: &ProcessingMessage,
    error: String,
) {
    if original.message_type == MessageType::DeliveryFailed {
        return;
    }
    let notice = original
        .derive(
            MessageType::DeliveryFailed,
            inner.identity.clone(),
            MessageContent::DeliveryFailed {
                original_message_id: original.id,
                original_type: original.message_type.to_string(),
                subscriber: subscriber.routing_key(),
                error,
            },
        )
        .to(subscriber.clone());
    let broker = MessageBroker {
        inner: Arc::clone(inner),
    };
    if let Err(e) = broker.publish(notice) {
        debug!(error = %e, "could not publish delivery failure notice");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::identifier::ModuleKind;
    use crate::broker::message::{Domain, DomainEvent};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn broker() -> MessageBroker {
        MessageBroker::new(BrokerConfig::default())
    }

    fn api() -> ModuleIdentifier {
        ModuleIdentifier::service("api")
    }

    fn start(pipeline_id: &str) -> ProcessingMessage {
        ProcessingMessage::new(
            MessageType::domain(Domain::Quality, DomainEvent::Start),
            api(),
            MessageContent::Start {
                pipeline_id: pipeline_id.into(),
                generation_id: None,
                data: json!({}),
                context: json!({}),
            },
        )
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<ProcessingMessage>) -> ProcessingMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_subscribe_rejects_empty_and_malformed_patterns() {
        let b = broker();
        let err = b.subscribe_channel(ModuleIdentifier::service("x"), &[]).unwrap_err();
        assert!(matches!(err, BrokerError::Subscription(_)));
        let err = b
            .subscribe_channel(ModuleIdentifier::service("x"), &["a..b"])
            .unwrap_err();
        assert!(matches!(err, BrokerError::Subscription(_)));
        let err = b
            .subscribe_channel(ModuleIdentifier::service("bad.name"), &["#"])
            .unwrap_err();
        assert!(matches!(err, BrokerError::Subscription(_)));
    }

    #[tokio::test]
    async fn test_publish_routes_by_pattern_and_counts_recipients() {
        let b = broker();
        let (_, mut quality) = b
            .subscribe_channel(ModuleIdentifier::service("q"), &["quality.start.#"])
            .unwrap();
        let (_, _insight) = b
            .subscribe_channel(ModuleIdentifier::service("i"), &["insight.start.#"])
            .unwrap();

        let n = b.publish(start("p1")).unwrap();
        assert_eq!(n, 1);
        let got = recv(&mut quality).await;
        assert_eq!(got.pipeline_id(), Some("p1"));
    }

    #[tokio::test]
    async fn test_per_subscriber_order_matches_publish_order() {
        let b = broker();
        let (_, mut rx) = b
            .subscribe_channel(ModuleIdentifier::service("q"), &["quality.#"])
            .unwrap();
        for i in 0..50 {
            b.publish(start(&format!("p{}", i))).unwrap();
        }
        for i in 0..50 {
            let got = recv(&mut rx).await;
            assert_eq!(got.pipeline_id(), Some(format!("p{}", i).as_str()));
        }
    }

    #[tokio::test]
    async fn test_failing_and_panicking_handlers_do_not_block_others() {
        let b = broker();
        let ok_count = Arc::new(AtomicUsize::new(0));

        b.subscribe(
            ModuleIdentifier::service("failing"),
            &["quality.start.#"],
            handler_fn(|_| async { anyhow::bail!("boom") }),
        )
        .unwrap();
        b.subscribe(
            ModuleIdentifier::service("panicking"),
            &["quality.start.#"],
            handler_fn(|_| async { panic!("handler exploded") }),
        )
        .unwrap();
        let counter = Arc::clone(&ok_count);
        b.subscribe(
            ModuleIdentifier::service("healthy"),
            &["quality.start.#"],
            handler_fn(move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .unwrap();

        assert_eq!(b.publish(start("p1")).unwrap(), 3);
        assert_eq!(b.publish(start("p2")).unwrap(), 3);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ok_count.load(Ordering::SeqCst), 2);
        let stats = b.stats();
        assert_eq!(stats.failed, 4);
        assert!(stats.processed >= 2);
    }

    #[tokio::test]
    async fn test_delivery_failure_is_reported_to_failing_subscriber() {
        let b = broker();
        let failing = ModuleIdentifier::new("flaky", ModuleKind::Processor).in_department("quality");
        b.subscribe(
            failing.clone(),
            &["quality.start.#"],
            handler_fn(|_| async { anyhow::bail!("cannot handle") }),
        )
        .unwrap();
        let failing_key = failing.direct_key();
        let (_, mut notices) = b
            .subscribe_channel(ModuleIdentifier::service("watcher"), &[failing_key.as_str()])
            .unwrap();

        let original = start("p1");
        let original_id = original.id;
        b.publish(original).unwrap();

        let notice = recv(&mut notices).await;
        assert_eq!(notice.message_type, MessageType::DeliveryFailed);
        assert_eq!(notice.target.as_ref(), Some(&failing));
        match notice.content {
            MessageContent::DeliveryFailed {
                original_message_id,
                error,
                ..
            } => {
                assert_eq!(original_message_id, original_id);
                assert!(error.contains("cannot handle"));
            }
            other => panic!("unexpected content {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_department_only() {
        let b = broker();
        let (_, mut same) = b
            .subscribe_channel(
                ModuleIdentifier::new("a", ModuleKind::Handler).in_department("quality"),
                &["nothing.matches"],
            )
            .unwrap();
        let (_, mut other) = b
            .subscribe_channel(
                ModuleIdentifier::new("b", ModuleKind::Handler).in_department("insight"),
                &["nothing.matches"],
            )
            .unwrap();

        let source = ModuleIdentifier::new("m", ModuleKind::Manager).in_department("quality");
        let msg = ProcessingMessage::new(
            MessageType::PipelineCancelled,
            source,
            MessageContent::Cancelled {
                pipeline_id: "p1".into(),
                reason: None,
            },
        )
        .as_broadcast();
        assert_eq!(b.publish(msg).unwrap(), 1);
        recv(&mut same).await;
        assert!(other.try_recv().is_err());

        let global = ProcessingMessage::new(
            MessageType::PipelineCancelled,
            ModuleIdentifier::service("orchestrator"),
            MessageContent::Cancelled {
                pipeline_id: "p1".into(),
                reason: None,
            },
        )
        .as_broadcast();
        assert_eq!(b.publish(global).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_history_is_bounded_per_correlation() {
        let b = MessageBroker::new(BrokerConfig {
            history_limit: 3,
            ..BrokerConfig::default()
        });
        let first = start("p1");
        let correlation = first.metadata.correlation_id;
        b.publish(first.clone()).unwrap();
        for _ in 0..5 {
            let next = first.derive(
                MessageType::domain(Domain::Quality, DomainEvent::StatusUpdate),
                api(),
                first.content.clone(),
            );
            b.publish(next).unwrap();
        }
        let history = b.history(correlation);
        assert_eq!(history.len(), 3);
        assert!(b.history(Uuid::new_v4()).is_empty());
    }

    #[tokio::test]
    async fn test_purge_removes_idle_non_durable_subscriptions_only() {
        let b = MessageBroker::new(BrokerConfig {
            subscription_ttl_secs: 0,
            ..BrokerConfig::default()
        });
        b.subscribe_channel(ModuleIdentifier::service("transient"), &["#"])
            .unwrap();
        b.subscribe_durable(
            ModuleIdentifier::service("core"),
            &["#"],
            handler_fn(|_| async { Ok(()) }),
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (_, removed) = b.purge_expired();
        assert_eq!(removed, 1);
        let remaining = b.subscriptions();
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].durable);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_stop() {
        let b = broker();
        let (id, _rx) = b
            .subscribe_channel(ModuleIdentifier::service("x"), &["#"])
            .unwrap();
        assert!(b.unsubscribe(id));
        assert!(!b.unsubscribe(id));
        assert_eq!(b.publish(start("p1")).unwrap(), 0);

        b.stop();
        let err = b.publish(start("p1")).unwrap_err();
        assert!(matches!(err, BrokerError::NotRunning));
        assert!(crate::retry::Retryable::is_retryable(&err));
    }
}
