// Loom Event Bus
// Addressed messaging: publish/subscribe, point-to-point and request/reply

pub mod buffer;
pub mod bus;
pub mod codec;
pub mod config;
pub mod correlation;
pub mod failure;
pub mod handler;
pub mod message;
pub mod registry;
pub mod telemetry;
pub mod timer;
pub mod transport;

// Export core types
pub use bus::{BusStats, EventBus, EventBusBuilder};
pub use codec::{Body, DecodeError, EncodeError, Envelope, TypeTag};
pub use config::BusConfig;
pub use failure::{Failure, FailureCode};
pub use handler::{handler_fn, Handler, ReplyChannel, ReplyHandler, ReplyOutcome};
pub use message::Message;
pub use registry::HandlerId;
pub use timer::{Timer, TimerHandle, TokioTimer};
pub use transport::{Delivery, Transport};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Message has no reply address")]
    NoReplyAddress,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
pub type Result<T> = std::result::Result<T, BusError>;
