use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::{Client, aio::ConnectionManager};
use tokio::time::timeout;
use tracing::{info, warn};

use super::{BusError, ChatTransport, PayloadStream};

/// Redis PUBLISH/SUBSCRIBE on one fixed channel.
///
/// Publishing shares a managed connection; every subscription opens its own
/// pub/sub connection, as Redis requires.
#[derive(Clone)]
pub struct RedisTransport {
    client: Client,
    publisher: ConnectionManager,
    channel: String,
    call_timeout: Duration,
}

impl std::fmt::Debug for RedisTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTransport")
            .field("channel", &self.channel)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisTransport {
    /// # Errors
    /// Returns [`BusError`] if the publishing connection cannot be opened in time.
    pub async fn connect(
        client: Client,
        channel: impl Into<String>,
        call_timeout: Duration,
    ) -> Result<Self, BusError> {
        let publisher = timeout(call_timeout, ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| BusError::Timeout(call_timeout))??;
        Ok(Self {
            client,
            publisher,
            channel: channel.into(),
            call_timeout,
        })
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl ChatTransport for RedisTransport {
    async fn publish(&self, payload: String) -> Result<usize, BusError> {
        let mut connection = self.publisher.clone();
        let mut cmd = redis::cmd("PUBLISH");
        cmd.arg(&self.channel).arg(payload);
        let receivers: i64 = timeout(self.call_timeout, cmd.query_async(&mut connection))
            .await
            .map_err(|_| BusError::Timeout(self.call_timeout))??;
        Ok(usize::try_from(receivers).unwrap_or(0))
    }

    async fn subscribe(&self) -> Result<PayloadStream, BusError> {
        let mut pubsub = timeout(self.call_timeout, self.client.get_async_pubsub())
            .await
            .map_err(|_| BusError::Timeout(self.call_timeout))??;
        timeout(self.call_timeout, pubsub.subscribe(&self.channel))
            .await
            .map_err(|_| BusError::Timeout(self.call_timeout))??;
        info!(channel = %self.channel, "subscribed to chat channel");

        let channel = self.channel.clone();
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let payload = msg.get_payload::<String>();
            let channel = channel.clone();
            async move {
                match payload {
                    Ok(payload) => Some(payload),
                    Err(err) => {
                        warn!(channel = %channel, error = %err, "dropping non-text chat payload");
                        None
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
