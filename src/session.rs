//! Client session: turns raw channel reads into session events and drives
//! the per-connection state machine.
//!
//! ```text
//! AwaitingConnect --connect--> Connected --disconnect / timeout / EOF--> Disconnected
//!        |                                                                  ^
//!        +---------------------- disconnect / timeout / EOF ----------------+
//! ```

use crate::channel::{Channel, ChannelError};
use crate::codec::{ProtocolEvent, WireCodec, CONNECTED_RESPONSE};
use crate::liveness::{Liveness, LivenessTracker};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, trace, warn, Span};

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client sent a disconnect frame.
    ClientRequested,
    /// The client stayed silent longer than its timeout.
    LivenessTimeout,
    /// The client closed its side of the socket.
    PeerClosed,
}

/// Per-connection protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingConnect,
    Connected,
    Disconnected(DisconnectReason),
}

/// Outcome of one `decode_next` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Nothing for the pipeline (idle read, heartbeat, dropped frame).
    NoEvent,
    /// The client completed the connect handshake.
    Connected,
    /// The session is over.
    Disconnected(DisconnectReason),
    /// An application message.
    Message(String),
}

struct SessionInner {
    state: SessionState,
    liveness: LivenessTracker,
}

/// One client's connection: channel, liveness tracker and codec.
///
/// Shared between the read stage (`decode_next`) and the write stage
/// (`send_response`); the channel serialises each direction on its own.
pub struct Session {
    channel: Channel,
    codec: WireCodec,
    inner: Mutex<SessionInner>,
    span: Span,
}

impl Session {
    pub fn new(channel: Channel, liveness: LivenessTracker, span: Span) -> Self {
        Self {
            channel,
            codec: WireCodec,
            inner: Mutex::new(SessionInner {
                state: SessionState::AwaitingConnect,
                liveness,
            }),
            span,
        }
    }

    fn inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read and interpret the next frame.
    ///
    /// Channel errors are fatal to the session and returned to the caller.
    pub async fn decode_next(&self) -> Result<SessionEvent, ChannelError> {
        if let SessionState::Disconnected(reason) = self.state() {
            return Ok(SessionEvent::Disconnected(reason));
        }

        let frame = self.channel.receive().await?;
        let now = Instant::now();

        if frame.is_empty() {
            if self.channel.peer_closed() {
                return Ok(self.disconnect(DisconnectReason::PeerClosed));
            }
            let liveness = self.inner().liveness.classify_empty_read(now);
            return Ok(match liveness {
                Liveness::AliveIdle => SessionEvent::NoEvent,
                Liveness::Dead => self.disconnect(DisconnectReason::LivenessTimeout),
            });
        }

        let event = match self.codec.decode_event(&frame) {
            Ok(event) => event,
            Err(e) => {
                warn!(parent: &self.span, error = %e, len = frame.len(), "Dropping undecodable frame");
                return Ok(SessionEvent::NoEvent);
            }
        };

        match event {
            ProtocolEvent::Connect { heartbeat_interval } => {
                let first = {
                    let mut inner = self.inner();
                    inner.liveness.on_activity(now);
                    inner.state == SessionState::AwaitingConnect
                        && inner.liveness.negotiate(heartbeat_interval)
                };
                if !first {
                    warn!(parent: &self.span, "Ignoring repeated connect frame");
                    return Ok(SessionEvent::NoEvent);
                }

                self.send_response(CONNECTED_RESPONSE).await?;
                self.inner().state = SessionState::Connected;
                info!(
                    parent: &self.span,
                    heartbeat_interval = ?heartbeat_interval,
                    timeout = ?self.timeout(),
                    "Client connected"
                );
                Ok(SessionEvent::Connected)
            }
            ProtocolEvent::Disconnect => Ok(self.disconnect(DisconnectReason::ClientRequested)),
            ProtocolEvent::Heartbeat => {
                self.inner().liveness.on_activity(now);
                trace!(parent: &self.span, "Heartbeat");
                Ok(SessionEvent::NoEvent)
            }
            ProtocolEvent::Message { payload } => {
                self.inner().liveness.on_activity(now);
                trace!(parent: &self.span, len = payload.len(), "Message received");
                Ok(SessionEvent::Message(payload))
            }
        }
    }

    /// Encode and send one response payload to the client.
    pub async fn send_response(&self, payload: &str) -> Result<(), ChannelError> {
        self.channel.send(self.codec.encode(payload)).await?;
        debug!(parent: &self.span, len = payload.len(), "Sent response");
        Ok(())
    }

    fn disconnect(&self, reason: DisconnectReason) -> SessionEvent {
        self.inner().state = SessionState::Disconnected(reason);
        info!(parent: &self.span, ?reason, "Client disconnected");
        SessionEvent::Disconnected(reason)
    }

    /// Close the underlying channel. Idempotent.
    pub async fn close(&self) {
        self.channel.close().await;
    }

    pub fn state(&self) -> SessionState {
        self.inner().state
    }

    pub fn timeout(&self) -> Duration {
        self.inner().liveness.timeout()
    }

    pub fn last_heartbeat_at(&self) -> Option<Instant> {
        self.inner().liveness.last_heartbeat_at()
    }
}
