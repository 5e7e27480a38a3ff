//! Client side of the relay protocol.
//!
//! Performs the connect handshake and then lets the caller send heartbeats
//! and messages and read responses. Heartbeats are not automatic: a caller
//! that goes quiet for longer than the negotiated timeout is dropped by the
//! server.

use crate::codec::{DecodeError, ProtocolEvent, WireCodec, CONNECTED_RESPONSE};
use crate::framing::{FrameCodec, Framing};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::io;
use std::time::Duration;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;
use tracing::debug;

/// Client connection settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Interval declared to the server in the connect frame.
    pub heartbeat_interval: Duration,
    /// Must match the server's framing.
    pub framing: Framing,
    pub buffer_size: usize,
    /// How long to wait for the connect acknowledgement.
    pub ack_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            framing: Framing::default(),
            buffer_size: 4096,
            ack_timeout: Duration::from_secs(5),
        }
    }
}

/// Errors produced by the client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] DecodeError),

    #[error("timed out waiting for the server")]
    Timeout,

    #[error("server closed the connection")]
    Closed,

    #[error("unexpected connect response: {0:?}")]
    Rejected(String),
}

/// A connected client.
pub struct Client {
    framed: Framed<TcpStream, FrameCodec>,
    codec: WireCodec,
}

impl Client {
    /// Connect and complete the handshake.
    pub async fn connect(addr: impl ToSocketAddrs, config: ClientConfig) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        let mut client = Client {
            framed: Framed::new(stream, FrameCodec::new(config.framing, config.buffer_size)),
            codec: WireCodec,
        };

        client
            .send_event(&ProtocolEvent::Connect {
                heartbeat_interval: config.heartbeat_interval,
            })
            .await?;

        match client.recv(config.ack_timeout).await? {
            Some(response) if response == CONNECTED_RESPONSE => {
                debug!(interval = ?config.heartbeat_interval, "Connected to server");
                Ok(client)
            }
            Some(other) => Err(ClientError::Rejected(other)),
            None => Err(ClientError::Timeout),
        }
    }

    /// Send an application message.
    pub async fn send_message(&mut self, payload: &str) -> Result<(), ClientError> {
        self.send_event(&ProtocolEvent::Message {
            payload: payload.to_owned(),
        })
        .await
    }

    /// Prove liveness to the server.
    pub async fn heartbeat(&mut self) -> Result<(), ClientError> {
        self.send_event(&ProtocolEvent::Heartbeat).await
    }

    /// Send an arbitrary frame, bypassing the event encoder.
    pub async fn send_raw(&mut self, frame: Bytes) -> Result<(), ClientError> {
        self.framed.send(frame).await?;
        Ok(())
    }

    /// Wait up to `timeout` for one response.
    ///
    /// Returns `Ok(None)` if nothing arrived in time.
    pub async fn recv(&mut self, timeout: Duration) -> Result<Option<String>, ClientError> {
        match tokio::time::timeout(timeout, self.framed.next()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(ClientError::Closed),
            Ok(Some(Err(e))) => Err(e.into()),
            Ok(Some(Ok(frame))) => Ok(Some(self.codec.decode(&frame)?)),
        }
    }

    /// Say goodbye and close the socket.
    pub async fn disconnect(mut self) -> Result<(), ClientError> {
        self.send_event(&ProtocolEvent::Disconnect).await?;
        self.framed.close().await?;
        Ok(())
    }

    async fn send_event(&mut self, event: &ProtocolEvent) -> Result<(), ClientError> {
        let frame = self.codec.encode_event(event)?;
        self.framed.send(frame).await?;
        Ok(())
    }
}
