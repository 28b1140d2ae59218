//! Cross-instance chat fan-out.
//!
//! Any instance publishes a [`ChatEnvelope`](shared::models::ChatEnvelope) to
//! one shared channel; every instance's [`Subscriber`] receives it and hands it
//! to its process-local [`RoomHub`], which delivers to the sessions attached to
//! that room. The transport leg is the only integration point between
//! instances and sits behind [`ChatTransport`].

pub mod memory_transport;
pub mod publisher;
pub mod redis_transport;
pub mod room_hub;
pub mod subscriber;

use std::{pin::Pin, time::Duration};

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

pub use memory_transport::MemoryTransport;
pub use publisher::Publisher;
pub use redis_transport::RedisTransport;
pub use room_hub::{DispatchError, RoomBroadcast, RoomHub};
pub use subscriber::{DispatchOutcome, Subscriber};

/// Raw payloads as they arrive on the shared channel. Ends when the
/// subscription is lost.
pub type PayloadStream = Pin<Box<dyn Stream<Item = String> + Send>>;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("bus call timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to encode chat envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("bus transport unavailable")]
    Unavailable,
}

/// Publish/subscribe leg shared by every instance.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Sends one payload to the shared channel and returns how many listeners
    /// the transport reports as having received it.
    async fn publish(&self, payload: String) -> Result<usize, BusError>;

    /// Opens a fresh subscription to the shared channel.
    async fn subscribe(&self) -> Result<PayloadStream, BusError>;
}
