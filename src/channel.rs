//! Connection channel: one accepted socket, framed, with one lock per
//! direction.
//!
//! The read half and the write half are locked independently, so one task
//! may sit in `receive` while another completes a `send`. Neither direction
//! ever has more than one operation in flight.

use crate::framing::{FrameCodec, Framing};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace};

/// Type-erased read half (a TCP half in production, in-memory in tests).
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
/// Type-erased write half.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Errors that end the session owning the channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel closed")]
    Closed,
}

/// Socket-level settings shared by every channel a server creates.
#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    pub framing: Framing,
    /// Largest frame accepted.
    pub buffer_size: usize,
    /// How long `receive` waits before reporting an empty read.
    pub read_granularity: Duration,
}

/// A framed, half-duplex-safe connection to one peer.
pub struct Channel {
    peer: SocketAddr,
    reader: Mutex<FramedRead<BoxReader, FrameCodec>>,
    writer: Mutex<FramedWrite<BoxWriter, FrameCodec>>,
    read_granularity: Duration,
    peer_closed: AtomicBool,
    closed: AtomicBool,
}

impl Channel {
    pub fn new(
        reader: BoxReader,
        writer: BoxWriter,
        peer: SocketAddr,
        options: ChannelOptions,
    ) -> Self {
        let codec = || FrameCodec::new(options.framing, options.buffer_size);

        Self {
            peer,
            reader: Mutex::new(FramedRead::with_capacity(
                reader,
                codec(),
                options.buffer_size,
            )),
            writer: Mutex::new(FramedWrite::new(writer, codec())),
            read_granularity: options.read_granularity,
            peer_closed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Wrap an accepted TCP stream.
    pub fn from_tcp(stream: TcpStream, peer: SocketAddr, options: ChannelOptions) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }
        let (reader, writer) = stream.into_split();
        Self::new(Box::new(reader), Box::new(writer), peer, options)
    }

    /// Wait up to the read granularity for one frame.
    ///
    /// Returns an empty frame if nothing arrived in time or the peer closed
    /// its side; `peer_closed` tells the two apart. EOF is flagged here rather
    /// than left to the liveness tracker, so a closed peer ends the session at
    /// once instead of after its heartbeat timeout.
    pub async fn receive(&self) -> Result<Bytes, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        if self.peer_closed() {
            return Ok(Bytes::new());
        }

        let mut reader = self.reader.lock().await;
        match tokio::time::timeout(self.read_granularity, reader.next()).await {
            Err(_) => Ok(Bytes::new()),
            Ok(None) => {
                trace!(peer = %self.peer, "Peer closed its side");
                self.peer_closed.store(true, Ordering::Release);
                Ok(Bytes::new())
            }
            Ok(Some(Ok(frame))) => Ok(frame),
            Ok(Some(Err(e))) => Err(e.into()),
        }
    }

    /// Write one frame and flush it.
    pub async fn send(&self, frame: Bytes) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        let mut writer = self.writer.lock().await;
        writer.send(frame).await?;
        Ok(())
    }

    /// Flush and shut down the write side. Safe to call any number of times.
    ///
    /// The socket itself is released when the channel is dropped.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.close().await {
            // The peer may already be gone; nothing left to report to it.
            debug!(peer = %self.peer, error = %e, "Error while closing channel");
        }
        trace!(peer = %self.peer, "Channel closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn peer_closed(&self) -> bool {
        self.peer_closed.load(Ordering::Acquire)
    }
}
