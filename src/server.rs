//! TCP server for the relay.
//!
//! Accepts one client at a time: the accepted socket becomes a session, a
//! pipeline runs until the session ends, and only then is the next
//! connection taken from the listen backlog.

use crate::channel::{Channel, ChannelOptions};
use crate::config::Config;
use crate::liveness::LivenessTracker;
use crate::pipeline::{Pipeline, QueueSizes, Termination};
use crate::processor::{Echo, Processor};
use crate::session::Session;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Span};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Whether a client is currently being served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Active { peer: SocketAddr },
}

/// Start-up and listener errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid listen address '{0}'")]
    Address(String),

    #[error("failed to bind {0}: {1}")]
    Bind(SocketAddr, #[source] io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Server instance
pub struct Server {
    config: Config,
    processor: Arc<dyn Processor>,
    shutdown: CancellationToken,
    state: watch::Sender<ServerState>,
    span: Span,
}

impl Server {
    /// Create a server that echoes messages back. Log events are recorded
    /// under `span`.
    pub fn new(config: Config, span: Span) -> Self {
        let (state, _) = watch::channel(ServerState::Idle);

        Server {
            config,
            processor: Arc::new(Echo),
            shutdown: CancellationToken::new(),
            state,
            span,
        }
    }

    /// Replace the message processor.
    pub fn with_processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processor = processor;
        self
    }

    /// Bind the listening socket with the configured backlog.
    pub fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = self
            .config
            .listen
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ServerError::Address(self.config.listen.clone()))?;

        let listener =
            create_listener(addr, self.config.backlog).map_err(|e| ServerError::Bind(addr, e))?;
        Ok(TcpListener::from_std(listener)?)
    }

    /// Bind and serve until shut down.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    /// Serve clients from an already bound listener until shut down.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        info!(
            parent: &self.span,
            address = %listener.local_addr()?,
            backlog = self.config.backlog,
            framing = ?self.config.framing,
            "Server listening"
        );

        loop {
            info!(parent: &self.span, "Waiting for a client to connect");

            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    self.serve_client(stream, peer).await;
                }
                Err(e) => {
                    error!(parent: &self.span, error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        info!(parent: &self.span, "Server stopped");
        Ok(())
    }

    /// Run one client's session to completion.
    async fn serve_client(&self, stream: TcpStream, peer: SocketAddr) -> Termination {
        let span = info_span!(parent: &self.span, "client", %peer);
        info!(parent: &span, "Connected to client");
        self.state.send_replace(ServerState::Active { peer });

        let channel = Channel::from_tcp(stream, peer, self.channel_options());
        let liveness = LivenessTracker::new(
            self.config.default_heartbeat_interval,
            self.config.heartbeat_multiplier,
        );
        let session = Arc::new(Session::new(channel, liveness, span.clone()));

        let pipeline = Pipeline::start(
            Arc::clone(&session),
            Arc::clone(&self.processor),
            QueueSizes {
                read: self.config.read_queue_size,
                write: self.config.write_queue_size,
            },
            self.shutdown.child_token(),
            span.clone(),
        );
        let stats = pipeline.stats();

        // All stages have exited once `wait` returns, so nothing is left
        // blocked on the socket when it is closed.
        let termination = pipeline.wait().await;
        session.close().await;

        match &termination {
            Termination::Failed(reason) => {
                warn!(parent: &span, %reason, "Client session failed");
            }
            other => {
                info!(
                    parent: &span,
                    termination = ?other,
                    received = stats.received(),
                    dropped = stats.dropped(),
                    sent = stats.sent(),
                    "Client session ended"
                );
            }
        }

        self.state.send_replace(ServerState::Idle);
        termination
    }

    fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            framing: self.config.framing,
            buffer_size: self.config.buffer_size,
            read_granularity: self.config.read_granularity,
        }
    }

    /// Watch the server move between idle and active.
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Stop accepting and end the active session, if any.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

/// Create a non-blocking TCP listener with the given accept backlog.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
