//! In-process transport over tokio mpsc channels
//!
//! Frames are encoded to JSON just like on the network, so the in-process
//! path exercises the same serialization as [`super::tcp`].

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{ErrorKind, RunError, RunResult};
use crate::protocol::Envelope;

use super::{Acceptor, FrameSink, FrameSource, Link};

/// Sending half of an in-process link
#[derive(Debug)]
pub struct MemorySink {
    tx: Option<mpsc::Sender<String>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, envelope: &Envelope) -> RunResult<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| RunError::transport("link closed"))?;
        tx.send(envelope.encode()?)
            .await
            .map_err(|_| RunError::transport("peer dropped the link"))
    }

    async fn close(&mut self) -> RunResult<()> {
        self.tx = None;
        Ok(())
    }
}

/// Receiving half of an in-process link
#[derive(Debug)]
pub struct MemorySource {
    rx: mpsc::Receiver<String>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> RunResult<Option<Envelope>> {
        match self.rx.recv().await {
            Some(frame) => Envelope::decode(&frame).map(Some),
            None => Ok(None),
        }
    }
}

/// A connected pair of in-process links
pub fn memory_link(buffer: usize, a: &str, b: &str) -> (Link, Link) {
    let (a_tx, b_rx) = mpsc::channel(buffer);
    let (b_tx, a_rx) = mpsc::channel(buffer);
    let a_side = Link::new(MemorySink { tx: Some(a_tx) }, MemorySource { rx: a_rx }, b);
    let b_side = Link::new(MemorySink { tx: Some(b_tx) }, MemorySource { rx: b_rx }, a);
    (a_side, b_side)
}

/// Master side of an in-process hub
#[derive(Debug)]
pub struct MemoryAcceptor {
    incoming: mpsc::Receiver<Link>,
}

#[async_trait]
impl Acceptor for MemoryAcceptor {
    async fn accept(&mut self) -> RunResult<Link> {
        self.incoming
            .recv()
            .await
            .ok_or_else(|| RunError::new(ErrorKind::Shutdown, "every connector was dropped"))
    }

    fn local_addr(&self) -> String {
        "memory".to_string()
    }
}

/// Worker side of an in-process hub; clone it once per worker
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    outgoing: mpsc::Sender<Link>,
    buffer: usize,
    next_id: Arc<AtomicU64>,
}

impl MemoryConnector {
    /// Open a new link to the acceptor
    pub async fn connect(&self) -> RunResult<Link> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (worker_side, master_side) =
            memory_link(self.buffer, &format!("memory-worker-{id}"), "memory-master");
        self.outgoing
            .send(master_side)
            .await
            .map_err(|_| RunError::transport("acceptor dropped"))?;
        Ok(worker_side)
    }
}

/// Create an acceptor plus a connector that reaches it
pub fn memory_hub(buffer: usize) -> (MemoryAcceptor, MemoryConnector) {
    let (outgoing, incoming) = mpsc::channel(buffer.max(1));
    (
        MemoryAcceptor { incoming },
        MemoryConnector {
            outgoing,
            buffer: buffer.max(1),
            next_id: Arc::new(AtomicU64::new(1)),
        },
    )
}
