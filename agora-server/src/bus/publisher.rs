use std::{fmt, sync::Arc};

use shared::models::ChatEnvelope;
use tracing::{debug, instrument};

use super::{BusError, ChatTransport};

/// Serialises envelopes onto the shared channel. Does not wait for, or know
/// about, any subscriber.
#[derive(Clone)]
pub struct Publisher {
    transport: Arc<dyn ChatTransport>,
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher").finish_non_exhaustive()
    }
}

impl Publisher {
    #[must_use]
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        Self { transport }
    }

    /// # Errors
    /// Returns [`BusError`] if the envelope cannot be encoded or the transport
    /// rejects it.
    #[instrument(
        name = "bus.publish",
        skip(self, envelope),
        fields(room_id = envelope.room_id, kind = envelope.kind.as_str()),
        err
    )]
    pub async fn publish(&self, envelope: &ChatEnvelope) -> Result<usize, BusError> {
        let payload = serde_json::to_string(envelope)?;
        let receivers = self.transport.publish(payload).await?;
        metrics::counter!("chat_bus_published_total", "type" => envelope.kind.as_str())
            .increment(1);
        debug!(receivers, "published chat envelope");
        Ok(receivers)
    }
}
