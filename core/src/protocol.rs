//! Master/worker wire protocol
//!
//! Every message travels inside an [`Envelope`] carrying the protocol
//! version, the sending worker's id and a per-link sequence number. Each side
//! numbers its own envelopes from 1 and the receiver drops anything that does
//! not increase.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, RunError, RunResult};
use crate::runner::RunState;
use crate::stats::StatsDelta;

/// Version written into every envelope
pub const PROTOCOL_VERSION: u32 = 1;

/// Control and reporting messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Worker announces itself; first message on every link
    Register,
    /// Liveness plus the sender's state
    ///
    /// From the master `user_count` is the worker's current share.
    Heartbeat {
        /// Sender state
        state: RunState,
        /// Users running (worker) or assigned (master)
        user_count: usize,
    },
    /// Stats recorded by a worker since its last report
    Stats {
        /// Drained worker stats
        delta: StatsDelta,
    },
    /// Ramp to `target_count` users at `spawn_rate` users per second
    Spawn {
        /// Users for this worker
        target_count: usize,
        /// Spawn rate for this worker
        spawn_rate: f64,
    },
    /// Stop every user
    Stop,
    /// Stop and disconnect
    Quit,
    /// Release run resources
    Cleanup,
    /// Cleanup finished
    CleanupAck,
    /// Registration accepted
    Ack,
    /// Fatal error that ended the worker's run
    Error {
        /// Error classification
        kind: ErrorKind,
        /// Error description
        message: String,
    },
}

impl Message {
    /// Error message describing `err`
    pub fn error(err: &RunError) -> Self {
        Message::Error {
            kind: err.kind,
            message: err.message.clone(),
        }
    }

    /// Message type as written on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Register => "register",
            Message::Heartbeat { .. } => "heartbeat",
            Message::Stats { .. } => "stats",
            Message::Spawn { .. } => "spawn",
            Message::Stop => "stop",
            Message::Quit => "quit",
            Message::Cleanup => "cleanup",
            Message::CleanupAck => "cleanup_ack",
            Message::Ack => "ack",
            Message::Error { .. } => "error",
        }
    }
}

/// One framed message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version
    pub version: u32,
    /// Sender sequence number, strictly increasing per link
    pub seq: u64,
    /// Worker this link belongs to
    pub worker_id: String,
    /// Payload
    pub message: Message,
}

impl Envelope {
    /// Wrap `message` with the current protocol version
    pub fn new(seq: u64, worker_id: impl Into<String>, message: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            seq,
            worker_id: worker_id.into(),
            message,
        }
    }

    /// Serialize to a single JSON line, without the trailing newline
    pub fn encode(&self) -> RunResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse and version-check one frame
    pub fn decode(frame: &str) -> RunResult<Self> {
        let envelope: Envelope = serde_json::from_str(frame.trim_end())?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(RunError::protocol(format!(
                "unsupported protocol version {} (expected {PROTOCOL_VERSION})",
                envelope.version
            )));
        }
        Ok(envelope)
    }
}

/// Hands out sequence numbers for one sender
#[derive(Debug, Default)]
pub struct SequenceCounter {
    last: u64,
}

impl SequenceCounter {
    /// Start at zero; the first envelope gets 1
    pub fn new() -> Self {
        Self::default()
    }

    /// Next sequence number
    pub fn next_seq(&mut self) -> u64 {
        self.last += 1;
        self.last
    }
}

/// Rejects envelopes that do not advance the sender's sequence
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last: Option<u64>,
}

impl SequenceTracker {
    /// Tracker that accepts any first sequence number
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `seq` if it is above every sequence seen so far
    pub fn check(&mut self, seq: u64) -> RunResult<()> {
        match self.last {
            Some(last) if seq <= last => Err(RunError::protocol(format!(
                "out-of-order envelope: seq {seq} after {last}"
            ))),
            _ => {
                self.last = Some(seq);
                Ok(())
            }
        }
    }

    /// Highest accepted sequence number
    pub fn last(&self) -> Option<u64> {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RequestEvent;
    use crate::stats::RequestStats;

    #[test]
    fn test_message_wire_format() {
        let envelope = Envelope::new(
            7,
            "worker-1",
            Message::Spawn {
                target_count: 5,
                spawn_rate: 2.5,
            },
        );
        let json: serde_json::Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();

        assert_eq!(json["version"], PROTOCOL_VERSION);
        assert_eq!(json["seq"], 7);
        assert_eq!(json["worker_id"], "worker-1");
        assert_eq!(json["message"]["type"], "spawn");
        assert_eq!(json["message"]["target_count"], 5);
    }

    #[test]
    fn test_unit_variants_carry_only_type() {
        let frame = Envelope::new(1, "w", Message::CleanupAck).encode().unwrap();
        assert!(frame.contains(r#""message":{"type":"cleanup_ack"}"#));
        assert_eq!(Message::CleanupAck.kind(), "cleanup_ack");
    }

    #[test]
    fn test_stats_message_survives_the_wire() {
        let stats = RequestStats::default();
        stats.record(&RequestEvent::new("GET", "/a").with_response_time(12.0));
        stats.record(&RequestEvent::new("GET", "/a").with_exception("boom"));

        let sent = stats.take_delta();
        assert!(!sent.entries[0].reqs_per_sec.is_empty());
        let frame = Envelope::new(3, "w", Message::Stats { delta: sent.clone() })
            .encode()
            .unwrap();

        let decoded = Envelope::decode(&frame).unwrap();
        let Message::Stats { delta } = decoded.message else {
            panic!("expected stats message");
        };
        assert_eq!(delta, sent);
        let master = RequestStats::default();
        master.merge_delta(&delta);
        assert_eq!(master.total_requests(), 2);
        assert_eq!(master.total_failures(), 1);
    }

    #[test]
    fn test_error_message_keeps_kind() {
        let message = Message::error(&RunError::spawn("factory exploded"));
        let frame = Envelope::new(2, "w", message.clone()).encode().unwrap();
        assert!(frame.contains(r#""kind":"spawn""#));
        assert_eq!(Envelope::decode(&frame).unwrap().message, message);
    }

    #[test]
    fn test_decode_rejects_other_versions() {
        let frame = r#"{"version":2,"seq":1,"worker_id":"w","message":{"type":"stop"}}"#;
        let err = Envelope::decode(frame).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Protocol);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = Envelope::decode("not json\n").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Protocol);
    }

    #[test]
    fn test_sequence_tracker_rejects_replays() {
        let mut tracker = SequenceTracker::new();
        assert!(tracker.check(1).is_ok());
        assert!(tracker.check(2).is_ok());
        assert_eq!(tracker.check(2).unwrap_err().kind, ErrorKind::Protocol);
        assert!(tracker.check(1).is_err());
        assert!(tracker.check(5).is_ok());
        assert_eq!(tracker.last(), Some(5));
    }

    #[test]
    fn test_sequence_counter_starts_at_one() {
        let mut counter = SequenceCounter::new();
        assert_eq!(counter.next_seq(), 1);
        assert_eq!(counter.next_seq(), 2);
    }
}
