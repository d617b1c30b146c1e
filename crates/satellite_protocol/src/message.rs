//! Protocol messages.

use crate::causality::{CausalityTag, ReplicaId, VersionStamp};
use crate::migration::MigrationRecord;
use satellite_storage::Row;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol version exchanged during the handshake.
///
/// Peers are compatible when their major versions match. A newer minor
/// version may introduce message kinds that older peers skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion {
    /// Major version; a mismatch is fatal.
    pub major: u16,
    /// Minor version.
    pub minor: u16,
}

impl ProtocolVersion {
    /// Version implemented by this crate.
    pub const CURRENT: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

    /// Creates a version.
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Returns true if both peers can talk to each other.
    pub fn is_compatible(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Kind byte of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// [`Message::Hello`].
    Hello = 1,
    /// [`Message::HelloAck`].
    HelloAck = 2,
    /// [`Message::SubscribeRequest`].
    SubscribeRequest = 3,
    /// [`Message::SubscribeAck`].
    SubscribeAck = 4,
    /// [`Message::Transaction`].
    Transaction = 5,
    /// [`Message::Ack`].
    Ack = 6,
    /// [`Message::SchemaChange`].
    SchemaChange = 7,
    /// [`Message::Error`].
    Error = 8,
    /// [`Message::Ping`].
    Ping = 9,
    /// [`Message::Pong`].
    Pong = 10,
}

impl MessageKind {
    /// Parses a kind byte. Returns `None` for kinds this version does not
    /// know.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageKind::Hello),
            2 => Some(MessageKind::HelloAck),
            3 => Some(MessageKind::SubscribeRequest),
            4 => Some(MessageKind::SubscribeAck),
            5 => Some(MessageKind::Transaction),
            6 => Some(MessageKind::Ack),
            7 => Some(MessageKind::SchemaChange),
            8 => Some(MessageKind::Error),
            9 => Some(MessageKind::Ping),
            10 => Some(MessageKind::Pong),
            _ => None,
        }
    }

    /// Returns the kind byte.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Client greeting.
    Hello(Hello),
    /// Server reply to [`Message::Hello`].
    HelloAck(HelloAck),
    /// Client asks for the replication stream from a cursor.
    SubscribeRequest(SubscribeRequest),
    /// Server accepted the subscription.
    SubscribeAck(SubscribeAck),
    /// A committed transaction, in either direction.
    Transaction(WireTransaction),
    /// Server acknowledges client oplog entries up to a sequence number.
    Ack(Ack),
    /// Server pushes a schema migration.
    SchemaChange(MigrationRecord),
    /// Either side reports an error.
    Error(ErrorMessage),
    /// Liveness probe.
    Ping,
    /// Liveness reply.
    Pong,
}

impl Message {
    /// Returns the frame kind of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Hello(_) => MessageKind::Hello,
            Message::HelloAck(_) => MessageKind::HelloAck,
            Message::SubscribeRequest(_) => MessageKind::SubscribeRequest,
            Message::SubscribeAck(_) => MessageKind::SubscribeAck,
            Message::Transaction(_) => MessageKind::Transaction,
            Message::Ack(_) => MessageKind::Ack,
            Message::SchemaChange(_) => MessageKind::SchemaChange,
            Message::Error(_) => MessageKind::Error,
            Message::Ping => MessageKind::Ping,
            Message::Pong => MessageKind::Pong,
        }
    }

    /// Shorthand for an [`Message::Ack`].
    pub fn ack(up_to_seq: u64) -> Self {
        Message::Ack(Ack { up_to_seq })
    }

    /// Shorthand for an [`Message::Error`].
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Message::Error(ErrorMessage {
            code,
            message: message.into(),
        })
    }
}

/// Client greeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Client protocol version.
    pub protocol_version: ProtocolVersion,
    /// Client replica identity.
    pub replica_id: ReplicaId,
    /// Schema version the client has applied.
    pub schema_version: u64,
}

/// Server reply to [`Hello`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloAck {
    /// Server protocol version.
    pub server_version: ProtocolVersion,
    /// Schema version the server expects clients to have applied.
    pub assigned_watermark: u64,
}

/// Subscription request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// Last server cursor the client applied (0 for everything).
    pub last_seen_cursor: u64,
    /// Schema version the client has applied.
    pub schema_version: u64,
}

/// Subscription accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeAck {
    /// Cursor the stream resumes from.
    pub cursor: u64,
}

/// Acknowledgement of client oplog entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Highest acknowledged oplog sequence number.
    pub up_to_seq: u64,
}

/// Kind of a row-level change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOp {
    /// Row created.
    Insert,
    /// Some columns changed.
    Update,
    /// Row removed.
    Delete,
}

impl ChangeOp {
    /// Stable textual name, used in the persisted oplog.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Insert => "insert",
            ChangeOp::Update => "update",
            ChangeOp::Delete => "delete",
        }
    }

    /// Parses the textual name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "insert" => Some(ChangeOp::Insert),
            "update" => Some(ChangeOp::Update),
            "delete" => Some(ChangeOp::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row-level change inside a [`WireTransaction`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Oplog sequence number on the originating replica.
    pub seq: u64,
    /// Table name.
    pub table: String,
    /// Operation kind.
    pub op: ChangeOp,
    /// Primary key columns.
    pub pk: Row,
    /// Changed non-key columns (empty for deletes).
    pub values: Row,
}

/// A committed transaction on the wire.
///
/// Client to server: one batch of oplog entries sharing a causality tag.
/// Server to client: a transaction from the global stream, with
/// `commit_seq` set to its position in the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireTransaction {
    /// Causality tag of the originating transaction.
    pub tag: CausalityTag,
    /// Hybrid wall clock of the originating transaction.
    pub timestamp: u64,
    /// Service cursor the originator had applied.
    pub observed: u64,
    /// Global sequence, set by the service.
    pub commit_seq: Option<u64>,
    /// Changes in commit order.
    pub changes: Vec<Change>,
}

impl WireTransaction {
    /// Returns the version stamp every change of this transaction carries.
    pub fn stamp(&self) -> VersionStamp {
        VersionStamp {
            tag: self.tag.clone(),
            timestamp: self.timestamp,
            observed: self.observed,
            commit_seq: self.commit_seq,
        }
    }

    /// Highest oplog sequence number among the changes.
    pub fn last_seq(&self) -> Option<u64> {
        self.changes.iter().map(|c| c.seq).max()
    }
}

/// Error codes carried by [`Message::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The requested cursor is no longer available; resubscribe from 0.
    CursorUnavailable,
    /// The client schema does not match the server.
    SchemaMismatch,
    /// The message was malformed or unexpected.
    BadRequest,
    /// The request is not supported.
    Unsupported,
    /// The server failed internally.
    Internal,
}

/// Payload of [`Message::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_bytes_roundtrip() {
        for byte in 1..=10u8 {
            let kind = MessageKind::from_u8(byte).unwrap();
            assert_eq!(kind.as_u8(), byte);
        }
        assert_eq!(MessageKind::from_u8(0), None);
        assert_eq!(MessageKind::from_u8(200), None);
    }

    #[test]
    fn version_compatibility() {
        let v1_0 = ProtocolVersion::new(1, 0);
        assert!(v1_0.is_compatible(&ProtocolVersion::new(1, 7)));
        assert!(!v1_0.is_compatible(&ProtocolVersion::new(2, 0)));
        assert_eq!(ProtocolVersion::default(), ProtocolVersion::CURRENT);
        assert_eq!(v1_0.to_string(), "1.0");
    }

    #[test]
    fn change_op_names() {
        for op in [ChangeOp::Insert, ChangeOp::Update, ChangeOp::Delete] {
            assert_eq!(ChangeOp::parse(op.as_str()), Some(op));
        }
        assert_eq!(ChangeOp::parse("upsert"), None);
    }

    #[test]
    fn transaction_stamp() {
        let tx = WireTransaction {
            tag: CausalityTag::new("r1", 3),
            timestamp: 42,
            observed: 7,
            commit_seq: Some(9),
            changes: vec![],
        };
        let stamp = tx.stamp();
        assert_eq!(stamp.tag.counter, 3);
        assert_eq!(stamp.commit_seq, Some(9));
        assert_eq!(tx.last_seq(), None);
    }
}
