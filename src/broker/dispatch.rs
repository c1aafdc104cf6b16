//! Explicit message-type → handler tables.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::bus::MessageHandler;
use super::message::{MessageType, ProcessingMessage};

pub type DispatchFn<T> = fn(Arc<T>, ProcessingMessage) -> BoxFuture<'static, anyhow::Result<()>>;

/// Maps each handled message type to the function that processes it.
pub struct DispatchTable<T> {
    routes: HashMap<MessageType, DispatchFn<T>>,
}

impl<T> Default for DispatchTable<T> {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }
}

impl<T: Send + Sync + 'static> DispatchTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, message_type: MessageType, handler: DispatchFn<T>) -> Self {
        self.routes.insert(message_type, handler);
        self
    }

    pub fn handles(&self, message_type: &MessageType) -> bool {
        self.routes.contains_key(message_type)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Run the handler registered for the message type; unhandled types are
    /// ignored.
    pub async fn dispatch(&self, target: Arc<T>, message: ProcessingMessage) -> anyhow::Result<()> {
        match self.routes.get(&message.message_type) {
            Some(handler) => handler(target, message).await,
            None => {
                debug!(message_type = %message.message_type, "no dispatch entry");
                Ok(())
            }
        }
    }

    /// Bind the table to its target as a broker handler.
    pub fn into_handler(self, target: Arc<T>) -> Arc<dyn MessageHandler> {
        Arc::new(Dispatcher {
            table: self,
            target,
        })
    }
}

struct Dispatcher<T> {
    table: DispatchTable<T>,
    target: Arc<T>,
}

#[async_trait]
impl<T: Send + Sync + 'static> MessageHandler for Dispatcher<T> {
    async fn handle(&self, message: ProcessingMessage) -> anyhow::Result<()> {
        self.table.dispatch(Arc::clone(&self.target), message).await
    }
}
