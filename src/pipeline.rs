//! Staged message pipeline for one session.
//!
//! ```text
//! session --read stage--> [read queue] --process stage--> [write queue] --write stage--> session
//! ```
//!
//! Each stage is its own task. The read queue drops new messages when full
//! so the socket keeps being drained; the write queue makes the process stage
//! wait instead, since its entries are already-accepted work.
//!
//! When the client disconnects, the read stage closes the read queue and the
//! later stages finish what is already queued before exiting. A liveness
//! timeout, owner cancellation, a fatal I/O error or a stage panic cancels the
//! shared token instead, which stops every stage at once and discards anything
//! still queued.

use crate::processor::Processor;
use crate::session::{DisconnectReason, Session, SessionEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, trace, warn, Instrument, Span};

/// Capacities of the two pipeline queues.
#[derive(Debug, Clone, Copy)]
pub struct QueueSizes {
    pub read: usize,
    pub write: usize,
}

/// Why a pipeline stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The session ended (client request, liveness timeout or EOF).
    Disconnected(DisconnectReason),
    /// A fatal I/O error or a stage failure.
    Failed(String),
    /// The owner cancelled the pipeline.
    Shutdown,
}

/// Message counters, shared by the stages.
#[derive(Debug, Default)]
pub struct PipelineStats {
    received: AtomicU64,
    dropped: AtomicU64,
    processed: AtomicU64,
    sent: AtomicU64,
}

impl PipelineStats {
    /// Application messages read from the session.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Messages discarded because the read queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

/// Three running stages bound to one session.
pub struct Pipeline {
    cancel: CancellationToken,
    stats: Arc<PipelineStats>,
    read: JoinHandle<Option<Termination>>,
    process: JoinHandle<Option<Termination>>,
    write: JoinHandle<Option<Termination>>,
    span: Span,
}

impl Pipeline {
    /// Spawn the read, process and write stages.
    ///
    /// Cancelling `cancel` (or calling [`terminate`](Self::terminate)) stops
    /// all three without flushing the queues.
    pub fn start(
        session: Arc<Session>,
        processor: Arc<dyn Processor>,
        sizes: QueueSizes,
        cancel: CancellationToken,
        span: Span,
    ) -> Self {
        let (read_tx, read_rx) = mpsc::channel(sizes.read.max(1));
        let (write_tx, write_rx) = mpsc::channel(sizes.write.max(1));
        let stats = Arc::new(PipelineStats::default());

        debug!(
            parent: &span,
            read_queue = sizes.read,
            write_queue = sizes.write,
            "Starting pipeline"
        );

        let read = tokio::spawn(
            read_stage(
                Arc::clone(&session),
                read_tx,
                Arc::clone(&stats),
                cancel.clone(),
            )
            .instrument(info_span!(parent: &span, "read_stage")),
        );
        let process = tokio::spawn(
            process_stage(
                read_rx,
                write_tx,
                processor,
                Arc::clone(&stats),
                cancel.clone(),
            )
            .instrument(info_span!(parent: &span, "process_stage")),
        );
        let write = tokio::spawn(
            write_stage(session, write_rx, Arc::clone(&stats), cancel.clone())
                .instrument(info_span!(parent: &span, "write_stage")),
        );

        Pipeline {
            cancel,
            stats,
            read,
            process,
            write,
            span,
        }
    }

    /// Ask all stages to stop.
    pub fn terminate(&self) {
        self.cancel.cancel();
    }

    /// True once the pipeline was cancelled or the session has ended.
    pub fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled() || self.read.is_finished()
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Wait until every stage has exited.
    ///
    /// After a client disconnect this includes delivering the responses that
    /// were still queued.
    pub async fn wait(self) -> Termination {
        let Pipeline {
            cancel: _,
            stats,
            read,
            process,
            write,
            span,
        } = self;

        let read = join_stage("read", read).await;
        let process = join_stage("process", process).await;
        let write = join_stage("write", write).await;

        let termination = read.or(write).or(process).unwrap_or(Termination::Shutdown);
        debug!(
            parent: &span,
            ?termination,
            received = stats.received(),
            dropped = stats.dropped(),
            sent = stats.sent(),
            "Pipeline stopped"
        );
        termination
    }
}

async fn join_stage(
    name: &'static str,
    handle: JoinHandle<Option<Termination>>,
) -> Option<Termination> {
    match handle.await {
        Ok(termination) => termination,
        Err(e) => {
            error!(stage = name, error = %e, "Pipeline stage failed");
            Some(Termination::Failed(format!("{name} stage: {e}")))
        }
    }
}

/// Pull events from the session; queue application messages.
async fn read_stage(
    session: Arc<Session>,
    read_tx: mpsc::Sender<String>,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
) -> Option<Termination> {
    let guard = cancel.clone().drop_guard();

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            event = session.decode_next() => event,
        };

        match event {
            Ok(SessionEvent::Message(payload)) => {
                stats.received.fetch_add(1, Ordering::Relaxed);
                match read_tx.try_send(payload) {
                    Ok(()) => {}
                    Err(TrySendError::Full(payload)) => {
                        stats.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(len = payload.len(), "Read queue full, dropping message");
                    }
                    Err(TrySendError::Closed(_)) => return None,
                }
            }
            Ok(SessionEvent::Disconnected(reason)) => {
                // A client presumed dead is not written to. Otherwise dropping
                // `read_tx` lets the later stages drain and stop.
                if reason != DisconnectReason::LivenessTimeout {
                    guard.disarm();
                }
                return Some(Termination::Disconnected(reason));
            }
            Ok(SessionEvent::NoEvent | SessionEvent::Connected) => {}
            Err(e) => {
                error!(error = %e, "Read from client failed");
                return Some(Termination::Failed(e.to_string()));
            }
        }
    }
}

/// Apply the processor to queued messages.
async fn process_stage(
    mut read_rx: mpsc::Receiver<String>,
    write_tx: mpsc::Sender<String>,
    processor: Arc<dyn Processor>,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
) -> Option<Termination> {
    let guard = cancel.clone().drop_guard();

    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = read_rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let output = processor.process(message);
        stats.processed.fetch_add(1, Ordering::Relaxed);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = write_tx.send(output) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    guard.disarm();
    trace!("Process stage stopped");
    None
}

/// Send processed messages back to the client.
async fn write_stage(
    session: Arc<Session>,
    mut write_rx: mpsc::Receiver<String>,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
) -> Option<Termination> {
    let guard = cancel.clone().drop_guard();

    loop {
        let payload = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            payload = write_rx.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            result = session.send_response(&payload) => result,
        };

        if let Err(e) = result {
            error!(error = %e, "Write to client failed");
            return Some(Termination::Failed(e.to_string()));
        }
        stats.sent.fetch_add(1, Ordering::Relaxed);
    }

    guard.disarm();
    trace!("Write stage stopped");
    None
}
