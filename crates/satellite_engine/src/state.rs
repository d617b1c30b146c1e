//! Connection state, application-facing status and statistics.

use crate::error::SatelliteError;
use std::fmt;

/// State of the connection state machine.
///
/// ```text
/// Disconnected -> Connecting -> Handshaking -> Subscribing -> Active
///       ^              |             |              |           |
///       +--------------+-------------+--------------+-----------+  (transport error)
///
/// Handshaking -> Recovering -> Subscribing      (schema lag: catch up first)
/// Active      -> Recovering -> Active           (cursor lost: resubscribe)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No transport.
    Disconnected,
    /// Opening the transport.
    Connecting,
    /// `Hello` sent, waiting for `HelloAck`.
    Handshaking,
    /// `SubscribeRequest` sent, waiting for `SubscribeAck`.
    Subscribing,
    /// Streaming in both directions.
    Active,
    /// Catching up on migrations or resubscribing after a lost cursor.
    Recovering,
}

impl ConnectionState {
    /// Returns true if a transport is open.
    pub fn is_connected(&self) -> bool {
        !matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Connecting
        )
    }

    /// Returns true if local changes are being streamed.
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Active)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Subscribing => "subscribing",
            ConnectionState::Active => "active",
            ConnectionState::Recovering => "recovering",
        };
        f.write_str(name)
    }
}

/// Connectivity as seen by the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SatelliteStatus {
    /// Not started, or stopped.
    Disconnected,
    /// Trying to reach the service.
    Connecting,
    /// Streaming changes.
    Connected,
    /// Stopped by an error that needs intervention.
    Error(SatelliteError),
}

impl SatelliteStatus {
    /// Returns true while connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, SatelliteStatus::Connected)
    }

    /// Returns the error, if any.
    pub fn error(&self) -> Option<&SatelliteError> {
        match self {
            SatelliteStatus::Error(e) => Some(e),
            _ => None,
        }
    }
}

/// Statistics about sync activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Oplog entries sent (resends included).
    pub entries_sent: u64,
    /// Oplog entries acknowledged.
    pub entries_acked: u64,
    /// Remote transactions received.
    pub transactions_received: u64,
    /// Remote changes applied.
    pub changes_applied: u64,
    /// Remote changes discarded as stale.
    pub changes_stale: u64,
    /// Concurrent writes resolved per column.
    pub conflicts_resolved: u64,
    /// Rows brought back from a tombstone.
    pub rows_resurrected: u64,
    /// Reconnect attempts.
    pub reconnects: u64,
    /// Protocol violations observed.
    pub protocol_violations: u64,
    /// Tombstoned shadow rows collected.
    pub tombstones_collected: u64,
    /// Last error message.
    pub last_error: Option<String>,
}
