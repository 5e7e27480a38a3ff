//! heartbeat-relay: a single-client persistent TCP server
//!
//! A client connects, declares a heartbeat interval and then exchanges
//! messages with the server over one long-lived connection. Each message
//! passes through a staged pipeline:
//!
//! - read: decode frames from the socket and track liveness
//! - process: transform message payloads
//! - write: send responses back in order
//!
//! A client that stops sending for longer than its negotiated timeout is
//! dropped and the server goes back to accepting.

pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod framing;
pub mod liveness;
pub mod pipeline;
pub mod processor;
pub mod server;
pub mod session;

pub use client::{Client, ClientConfig, ClientError};
pub use config::{Config, ConfigError};
pub use framing::Framing;
pub use pipeline::{Pipeline, Termination};
pub use processor::{Echo, Processor};
pub use server::{Server, ServerError, ServerState};
pub use session::{DisconnectReason, Session, SessionEvent};
