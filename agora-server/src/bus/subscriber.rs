use std::{fmt, sync::Arc, time::Duration};

use futures::StreamExt;
use shared::models::ChatEnvelope;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ChatTransport, RoomBroadcast};

/// Initial backoff delay for resubscribing.
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for resubscribing.
const MAX_BACKOFF_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handed to the local hub; carries the number of sessions reached.
    Delivered(usize),
    /// Dropped after logging; the listener carries on.
    Rejected,
}

/// Receives payloads from the shared channel and re-dispatches them to the
/// local room hub.
#[derive(Clone)]
pub struct Subscriber {
    hub: Arc<dyn RoomBroadcast>,
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber").finish_non_exhaustive()
    }
}

impl Subscriber {
    #[must_use]
    pub fn new(hub: Arc<dyn RoomBroadcast>) -> Self {
        Self { hub }
    }

    /// Decodes one raw payload and broadcasts it to the room's local sessions.
    /// Never fails: a bad payload or a failed dispatch is logged and counted.
    pub fn on_message(&self, raw: &str) -> DispatchOutcome {
        let envelope = match serde_json::from_str::<ChatEnvelope>(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, payload = %raw, "dropping malformed chat payload");
                metrics::counter!("chat_bus_rejected_total", "reason" => "decode").increment(1);
                return DispatchOutcome::Rejected;
            }
        };

        let room_id = envelope.room_id;
        let kind = envelope.kind.as_str();
        match self.hub.broadcast(envelope) {
            Ok(sessions) => {
                metrics::counter!("chat_bus_delivered_total", "type" => kind).increment(1);
                debug!(room_id, kind, sessions, "dispatched chat envelope");
                DispatchOutcome::Delivered(sessions)
            }
            Err(err) => {
                warn!(room_id, kind, error = %err, "local chat dispatch failed");
                metrics::counter!("chat_bus_rejected_total", "reason" => "dispatch").increment(1);
                DispatchOutcome::Rejected
            }
        }
    }

    /// Listener loop. Resubscribes with exponential backoff whenever the
    /// subscription fails or ends, and returns once `cancel` fires.
    pub async fn run(&self, transport: Arc<dyn ChatTransport>, cancel: CancellationToken) {
        let mut backoff_secs = INITIAL_BACKOFF_SECS;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match transport.subscribe().await {
                Ok(mut stream) => {
                    info!("chat bus listener attached");
                    backoff_secs = INITIAL_BACKOFF_SECS;
                    loop {
                        tokio::select! {
                            () = cancel.cancelled() => {
                                info!("chat bus listener cancelled");
                                return;
                            }
                            next = stream.next() => match next {
                                Some(raw) => {
                                    self.on_message(&raw);
                                }
                                None => {
                                    warn!("chat bus subscription ended, resubscribing after {backoff_secs}s");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, backoff_secs, "chat bus subscribe failed");
                }
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    info!("chat bus listener cancelled during backoff");
                    return;
                }
                () = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
            }
            backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
        }
    }
}
