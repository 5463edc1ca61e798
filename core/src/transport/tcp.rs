//! Newline-delimited JSON over TCP

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::error::{RunError, RunResult};
use crate::protocol::Envelope;

use super::{Acceptor, FrameSink, FrameSource, Link};

/// Longest accepted frame, newline excluded
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Writes one JSON envelope per line
#[derive(Debug)]
pub struct TcpSink {
    writer: OwnedWriteHalf,
}

#[async_trait]
impl FrameSink for TcpSink {
    async fn send(&mut self, envelope: &Envelope) -> RunResult<()> {
        let mut frame = envelope.encode()?;
        frame.push('\n');
        self.writer
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| RunError::transport(format!("write failed: {e}")))
    }

    async fn close(&mut self) -> RunResult<()> {
        self.writer
            .shutdown()
            .await
            .map_err(|e| RunError::transport(format!("shutdown failed: {e}")))
    }
}

/// Reads one JSON envelope per line
///
/// A line longer than the frame limit fails the link instead of being
/// buffered.
#[derive(Debug)]
pub struct TcpSource {
    reader: BufReader<OwnedReadHalf>,
    buf: Vec<u8>,
    max_frame: usize,
}

#[async_trait]
impl FrameSource for TcpSource {
    async fn recv(&mut self) -> RunResult<Option<Envelope>> {
        loop {
            self.buf.clear();
            let limit = self.max_frame as u64 + 1;
            let read = (&mut self.reader)
                .take(limit)
                .read_until(b'\n', &mut self.buf)
                .await
                .map_err(|e| RunError::transport(format!("read failed: {e}")))?;
            if read == 0 {
                return Ok(None);
            }
            if self.buf.last() != Some(&b'\n') && read as u64 >= limit {
                return Err(RunError::transport(format!(
                    "frame exceeds {} bytes",
                    self.max_frame
                )));
            }
            let line = std::str::from_utf8(&self.buf)
                .map_err(|e| RunError::protocol(format!("frame is not utf-8: {e}")))?
                .trim();
            if line.is_empty() {
                continue;
            }
            return Envelope::decode(line).map(Some);
        }
    }
}

fn into_link(stream: TcpStream, max_frame: usize) -> Link {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "<unknown>".to_owned());
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }
    let (read_half, write_half) = stream.into_split();
    Link::new(
        TcpSink { writer: write_half },
        TcpSource {
            reader: BufReader::new(read_half),
            buf: Vec::new(),
            max_frame,
        },
        peer,
    )
}

/// Listens for worker connections
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
    max_frame: usize,
}

impl TcpAcceptor {
    /// Bind to `addr`; port 0 picks a free port
    pub async fn bind(addr: impl ToSocketAddrs) -> RunResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RunError::transport(format!("bind failed: {e}")))?;
        Ok(Self {
            listener,
            max_frame: MAX_FRAME_BYTES,
        })
    }

    /// Set the longest frame accepted from workers
    pub fn with_max_frame(mut self, bytes: usize) -> Self {
        self.max_frame = bytes;
        self
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&mut self) -> RunResult<Link> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| RunError::transport(format!("accept failed: {e}")))?;
        tracing::debug!(peer = %addr, "Accepted worker connection");
        Ok(into_link(stream, self.max_frame))
    }

    fn local_addr(&self) -> String {
        self.listener
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "<unbound>".to_owned())
    }
}

/// Connect a worker to the master at `addr`
pub async fn connect_tcp(addr: impl ToSocketAddrs) -> RunResult<Link> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| RunError::transport(format!("connect failed: {e}")))?;
    Ok(into_link(stream, MAX_FRAME_BYTES))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;
    use crate::runner::RunState;

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let mut acceptor = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        let addr = acceptor.local_addr();

        let (worker, master) = tokio::join!(connect_tcp(addr), acceptor.accept());
        let mut worker = worker.unwrap();
        let mut master = master.unwrap();

        let heartbeat = Envelope::new(
            1,
            "w1",
            Message::Heartbeat {
                state: RunState::Running,
                user_count: 4,
            },
        );
        worker.sink.send(&heartbeat).await.unwrap();
        assert_eq!(master.source.recv().await.unwrap(), Some(heartbeat));

        worker.sink.close().await.unwrap();
        assert_eq!(master.source.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_fails_the_link() {
        let mut acceptor = TcpAcceptor::bind("127.0.0.1:0")
            .await
            .unwrap()
            .with_max_frame(256);
        let addr = acceptor.local_addr();

        let (raw, master) = tokio::join!(TcpStream::connect(addr), acceptor.accept());
        let mut raw = raw.unwrap();
        let mut master = master.unwrap();

        let small = Envelope::new(1, "w1", Message::Register).encode().unwrap();
        raw.write_all(format!("{small}\n").as_bytes()).await.unwrap();
        raw.write_all(&[b'x'; 1024]).await.unwrap();

        assert_eq!(
            master.source.recv().await.unwrap().map(|e| e.message),
            Some(Message::Register)
        );
        let err = master.source.recv().await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Transport);
        assert!(err.message.contains("256"));
    }
}
