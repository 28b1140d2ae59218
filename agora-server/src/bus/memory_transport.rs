use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

use super::{BusError, ChatTransport, PayloadStream};

const DEFAULT_CAPACITY: usize = 1024;

/// In-process stand-in for the shared channel. Clones share one channel, so a
/// set of clones behaves like a cluster of instances attached to one broker.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    sender: Arc<Mutex<broadcast::Sender<String>>>,
    offline: Arc<AtomicBool>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl MemoryTransport {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(Mutex::new(sender)),
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Ends every open subscription, like a dropped broker connection.
    pub fn disconnect(&self) {
        let (replacement, _) = broadcast::channel(DEFAULT_CAPACITY);
        *self.sender.lock().unwrap_or_else(PoisonError::into_inner) = replacement;
    }

    /// While offline, publish and subscribe fail.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .receiver_count()
    }

    fn check_online(&self) -> Result<(), BusError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(BusError::Unavailable)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChatTransport for MemoryTransport {
    async fn publish(&self, payload: String) -> Result<usize, BusError> {
        self.check_online()?;
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        // No listeners is not a failure for a fire-and-forget channel.
        Ok(sender.send(payload).unwrap_or(0))
    }

    async fn subscribe(&self) -> Result<PayloadStream, BusError> {
        self.check_online()?;
        let receiver = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribe();
        let stream = BroadcastStream::new(receiver).filter_map(|item| async move {
            match item {
                Ok(payload) => Some(payload),
                Err(err) => {
                    warn!(error = %err, "chat subscription lagged");
                    None
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_sees_each_payload() {
        let transport = MemoryTransport::default();
        let mut first = transport.subscribe().await.unwrap();
        let mut second = transport.clone().subscribe().await.unwrap();

        assert_eq!(transport.publish("a".into()).await.unwrap(), 2);
        assert_eq!(first.next().await.as_deref(), Some("a"));
        assert_eq!(second.next().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn publishing_without_listeners_reports_zero() {
        let transport = MemoryTransport::default();
        assert_eq!(transport.publish("a".into()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn disconnect_ends_open_streams() {
        let transport = MemoryTransport::default();
        let mut stream = transport.subscribe().await.unwrap();
        transport.disconnect();
        assert_eq!(stream.next().await, None);
        assert_eq!(transport.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn offline_transport_refuses_calls() {
        let transport = MemoryTransport::default();
        transport.set_offline(true);
        assert!(matches!(
            transport.publish("a".into()).await,
            Err(BusError::Unavailable)
        ));
        assert!(transport.subscribe().await.is_err());
    }
}
