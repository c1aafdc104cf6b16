//! Pattern-based publish/subscribe messaging.

mod bus;
pub mod dispatch;
pub mod identifier;
pub mod message;
pub mod pattern;

pub use bus::{
    BrokerStats, HistoryEntry, MessageBroker, MessageHandler, SubscriptionId, SubscriptionInfo,
    handler_fn,
};
pub use dispatch::{DispatchFn, DispatchTable};
pub use identifier::{ModuleIdentifier, ModuleKind};
pub use message::{
    Domain, DomainEvent, MESSAGE_VERSION, MessageContent, MessageMetadata, MessageType,
    ProcessingMessage, StepStatus,
};
