//! Framed links between master and workers
//!
//! A [`Link`] is one bidirectional connection split into a [`FrameSink`] and
//! a [`FrameSource`]. The master accepts links through an [`Acceptor`].
//! [`memory`] keeps everything in process; [`tcp`] speaks newline-delimited
//! JSON over `tokio::net`.

pub mod memory;
pub mod tcp;

pub use memory::{memory_hub, MemoryAcceptor, MemoryConnector};
pub use tcp::{connect_tcp, TcpAcceptor, MAX_FRAME_BYTES};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::RunResult;
use crate::protocol::{Envelope, Message, SequenceCounter};

/// Sending half of a link
#[async_trait]
pub trait FrameSink: Send {
    /// Send one envelope
    async fn send(&mut self, envelope: &Envelope) -> RunResult<()>;

    /// Flush and close; the peer's source then yields `None`
    async fn close(&mut self) -> RunResult<()> {
        Ok(())
    }
}

/// Receiving half of a link
#[async_trait]
pub trait FrameSource: Send {
    /// Next envelope, or `None` once the peer closed the link
    async fn recv(&mut self) -> RunResult<Option<Envelope>>;
}

/// Accepts worker links on the master
#[async_trait]
pub trait Acceptor: Send {
    /// Wait for the next worker link
    async fn accept(&mut self) -> RunResult<Link>;

    /// Where workers should connect
    fn local_addr(&self) -> String;
}

/// One connection between master and worker
pub struct Link {
    /// Outgoing frames
    pub sink: Box<dyn FrameSink>,
    /// Incoming frames
    pub source: Box<dyn FrameSource>,
    /// Peer description for logs
    pub peer: String,
}

impl Link {
    /// Assemble a link from its halves
    pub fn new(
        sink: impl FrameSink + 'static,
        source: impl FrameSource + 'static,
        peer: impl Into<String>,
    ) -> Self {
        Self {
            sink: Box::new(sink),
            source: Box::new(source),
            peer: peer.into(),
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").field("peer", &self.peer).finish()
    }
}

/// Number, frame and send every queued message until the queue closes
///
/// Drains what is left in the queue before closing the sink, so a final
/// `Quit` or heartbeat still reaches the peer.
pub(crate) async fn pump_outbound(
    worker_id: String,
    mut sink: Box<dyn FrameSink>,
    mut rx: mpsc::Receiver<Message>,
) {
    let mut seq = SequenceCounter::new();
    while let Some(message) = rx.recv().await {
        let kind = message.kind();
        let envelope = Envelope::new(seq.next_seq(), worker_id.as_str(), message);
        if let Err(e) = sink.send(&envelope).await {
            tracing::warn!(worker_id = %worker_id, kind, error = %e, "Failed to send message");
            return;
        }
    }
    if let Err(e) = sink.close().await {
        tracing::debug!(worker_id = %worker_id, error = %e, "Failed to close link");
    }
}
