//! Connection state machine.
//!
//! One [`ConnectionDriver`] task owns the session with the service. It
//! connects, handshakes, catches up on migrations, subscribes, and then
//! multiplexes in one loop:
//!
//! - inbound frames (transactions, acks, schema changes, pings)
//! - local commit notifications, which drain the oplog into batches
//! - the batch window, ack and liveness timers
//! - the stop signal
//!
//! Transport failures and protocol violations end the session and re-enter
//! the loop after a backoff delay. Unacknowledged entries stay in the oplog
//! and are resent by the next session.

use crate::applier::RemoteApplier;
use crate::context::SyncContext;
use crate::error::{SatelliteError, SatelliteResult};
use crate::meta::{MetaStore, SyncMeta};
use crate::migration::MigrationCoordinator;
use crate::notifier::ChangeOrigin;
use crate::oplog::{OplogEntry, OplogStore};
use crate::state::{ConnectionState, SatelliteStatus};
use crate::transport::{Connector, FramedTransport};
use satellite_protocol::{
    ErrorCode, ErrorMessage, Hello, Message, SubscribeRequest, WireTransaction,
};
use satellite_storage::StorageAdapter;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// Watch channels the driver publishes on.
#[derive(Debug)]
pub(crate) struct Signals {
    pub(crate) state: watch::Sender<ConnectionState>,
    pub(crate) status: watch::Sender<SatelliteStatus>,
}

impl Signals {
    pub(crate) fn new() -> Self {
        Self {
            state: watch::channel(ConnectionState::Disconnected).0,
            status: watch::channel(SatelliteStatus::Disconnected).0,
        }
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(from = %previous, to = %state, "connection state changed");
        }
    }

    pub(crate) fn set_status(&self, status: SatelliteStatus) {
        self.status.send_replace(status);
    }
}

/// Resolves once a stop was requested or the satellite is gone.
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

/// A batch sent and not yet acknowledged.
#[derive(Debug, Clone, Copy)]
struct InFlight {
    last_seq: u64,
    count: usize,
}

/// Outbound bookkeeping of one session.
#[derive(Debug)]
struct Outbound {
    /// Highest oplog seq acknowledged.
    acked: u64,
    /// Highest oplog seq handed to the transport.
    sent_up_to: u64,
    in_flight: VecDeque<InFlight>,
    batch_deadline: Option<Instant>,
    ack_deadline: Option<Instant>,
}

impl Outbound {
    fn new(acked: u64) -> Self {
        Self {
            acked,
            sent_up_to: acked,
            in_flight: VecDeque::new(),
            batch_deadline: None,
            ack_deadline: None,
        }
    }

    fn in_flight_entries(&self) -> usize {
        self.in_flight.iter().map(|b| b.count).sum()
    }

    /// Forgets everything sent but not acknowledged, so it goes out again.
    fn rewind(&mut self) {
        self.sent_up_to = self.acked;
        self.in_flight.clear();
        self.ack_deadline = None;
    }
}

/// Groups consecutive entries of the same local transaction.
pub(crate) fn group_transactions(entries: Vec<OplogEntry>) -> Vec<WireTransaction> {
    let mut out: Vec<WireTransaction> = Vec::new();
    for entry in entries {
        let change = entry.to_change();
        match out.last_mut() {
            Some(txn) if txn.tag == entry.stamp.tag => txn.changes.push(change),
            _ => out.push(WireTransaction {
                tag: entry.stamp.tag,
                timestamp: entry.stamp.timestamp,
                observed: entry.stamp.observed,
                commit_seq: None,
                changes: vec![change],
            }),
        }
    }
    out
}

fn server_error(error: &ErrorMessage) -> SatelliteError {
    match error.code {
        ErrorCode::BadRequest | ErrorCode::Unsupported => {
            SatelliteError::violation(format!("server rejected request: {}", error.message))
        }
        ErrorCode::CursorUnavailable | ErrorCode::SchemaMismatch | ErrorCode::Internal => {
            SatelliteError::transport_retryable(format!(
                "server error {:?}: {}",
                error.code, error.message
            ))
        }
    }
}

/// Owns the connection to the replication service.
pub(crate) struct ConnectionDriver {
    ctx: Arc<SyncContext>,
    storage: Arc<dyn StorageAdapter>,
    connector: Arc<dyn Connector>,
    oplog: OplogStore,
    applier: RemoteApplier,
    migrations: MigrationCoordinator,
    signals: Arc<Signals>,
    stop: watch::Receiver<bool>,
}

impl ConnectionDriver {
    pub(crate) fn new(
        ctx: Arc<SyncContext>,
        storage: Arc<dyn StorageAdapter>,
        connector: Arc<dyn Connector>,
        signals: Arc<Signals>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            oplog: OplogStore::new(Arc::clone(&storage)),
            applier: RemoteApplier::new(Arc::clone(&storage), Arc::clone(&ctx)),
            migrations: MigrationCoordinator::new(Arc::clone(&storage), Arc::clone(&ctx)),
            ctx,
            storage,
            connector,
            signals,
            stop,
        }
    }

    /// Runs sessions until stopped or a fatal error occurs.
    pub(crate) async fn run(self) {
        let backoff = self.ctx.config.backoff.clone();
        let mut attempt: u32 = 0;
        let mut violations: u32 = 0;
        let mut stop = self.stop.clone();
        info!(replica = %self.ctx.replica_id, "connection loop started");

        while !*stop.borrow() {
            self.signals.set_status(SatelliteStatus::Connecting);
            let mut active_since = None;
            let result = self.run_session(&mut active_since).await;

            let stable = active_since
                .is_some_and(|since: Instant| since.elapsed() >= backoff.stability_threshold);
            if stable {
                attempt = 0;
                violations = 0;
            }

            let err = match result {
                Ok(()) => break,
                Err(err) => err,
            };
            self.ctx.record(|s| s.last_error = Some(err.to_string()));

            if matches!(err, SatelliteError::ProtocolViolation(_)) {
                violations += 1;
                self.ctx.record(|s| s.protocol_violations += 1);
                if violations > self.ctx.config.violation_budget {
                    error!(violations, error = %err, "protocol violation budget exhausted");
                    self.fail(err);
                    return;
                }
            }
            if err.is_fatal() {
                error!(error = %err, "sync stopped by fatal error");
                self.fail(err);
                return;
            }

            attempt = attempt.saturating_add(1);
            let delay = backoff.delay_for_attempt(attempt);
            warn!(error = %err, attempt, ?delay, "sync session ended; reconnecting");
            self.signals.set_state(ConnectionState::Disconnected);
            self.ctx.record(|s| s.reconnects += 1);

            tokio::select! {
                biased;
                _ = stopped(&mut stop) => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.signals.set_state(ConnectionState::Disconnected);
        self.signals.set_status(SatelliteStatus::Disconnected);
        info!(replica = %self.ctx.replica_id, "connection loop stopped");
    }

    fn fail(&self, err: SatelliteError) {
        self.signals.set_state(ConnectionState::Disconnected);
        self.signals.set_status(SatelliteStatus::Error(err));
    }

    /// One connection, from connect to close. `Ok` means stop was requested.
    async fn run_session(&self, active_since: &mut Option<Instant>) -> SatelliteResult<()> {
        let config = &self.ctx.config;
        let mut stop = self.stop.clone();
        self.signals.set_state(ConnectionState::Connecting);

        let stream = tokio::select! {
            biased;
            _ = stopped(&mut stop) => return Ok(()),
            result = tokio::time::timeout(config.connect_timeout, self.connector.connect()) => {
                result.map_err(|_| SatelliteError::transport_retryable("connect timed out"))??
            }
        };
        let mut transport = FramedTransport::new(stream, config.max_frame_len)
            .with_write_timeout(config.write_timeout);
        let mut session_stop = stop.clone();
        let result = tokio::select! {
            biased;
            _ = stopped(&mut stop) => {
                debug!("stop requested; abandoning session");
                Ok(())
            }
            result = self.drive(&mut transport, &mut session_stop, active_since) => result,
        };
        transport.close().await;
        result
    }

    async fn drive(
        &self,
        transport: &mut FramedTransport,
        stop: &mut watch::Receiver<bool>,
        active_since: &mut Option<Instant>,
    ) -> SatelliteResult<()> {
        let config = &self.ctx.config;
        self.signals.set_state(ConnectionState::Handshaking);
        let meta = self.load_meta().await?;
        transport
            .send(&Message::Hello(Hello {
                protocol_version: config.protocol_version,
                replica_id: self.ctx.replica_id.clone(),
                schema_version: meta.schema_version,
            }))
            .await?;

        let hello_ack = match self.expect_reply(transport, stop).await? {
            None => return Ok(()),
            Some(Message::HelloAck(ack)) => ack,
            Some(Message::Error(e)) => return Err(server_error(&e)),
            Some(other) => {
                return Err(SatelliteError::violation(format!(
                    "expected HelloAck, got {:?}",
                    other.kind()
                )))
            }
        };
        if !config.protocol_version.is_compatible(&hello_ack.server_version) {
            return Err(SatelliteError::IncompatibleProtocol {
                local: config.protocol_version,
                remote: hello_ack.server_version,
            });
        }

        let mut schema_version = meta.schema_version;
        if hello_ack.assigned_watermark > schema_version {
            self.signals.set_state(ConnectionState::Recovering);
            schema_version = self
                .migrations
                .catch_up(schema_version, hello_ack.assigned_watermark)
                .await?;
        } else if hello_ack.assigned_watermark < schema_version {
            warn!(
                local = schema_version,
                remote = hello_ack.assigned_watermark,
                "local schema is ahead of the service"
            );
        }

        self.signals.set_state(ConnectionState::Subscribing);
        let mut cursor = meta.server_cursor;
        loop {
            transport
                .send(&Message::SubscribeRequest(SubscribeRequest {
                    last_seen_cursor: cursor,
                    schema_version,
                }))
                .await?;
            match self.expect_reply(transport, stop).await? {
                None => return Ok(()),
                Some(Message::SubscribeAck(ack)) => {
                    debug!(requested = cursor, granted = ack.cursor, "subscribed");
                    break;
                }
                Some(Message::Error(e)) if e.code == ErrorCode::CursorUnavailable => {
                    if cursor == 0 {
                        return Err(SatelliteError::violation(
                            "cursor 0 reported unavailable",
                        ));
                    }
                    warn!(cursor, "server lost our cursor; resubscribing from the start");
                    self.signals.set_state(ConnectionState::Recovering);
                    self.reset_cursor().await?;
                    cursor = 0;
                }
                Some(Message::Error(e)) => return Err(server_error(&e)),
                Some(other) => {
                    return Err(SatelliteError::violation(format!(
                        "expected SubscribeAck, got {:?}",
                        other.kind()
                    )))
                }
            }
        }

        self.signals.set_state(ConnectionState::Active);
        self.signals.set_status(SatelliteStatus::Connected);
        *active_since = Some(Instant::now());

        let mut out = Outbound::new(meta.acked_seq);
        self.pump(transport, &mut out, true).await?;
        self.active(transport, stop, &mut out).await
    }

    async fn active(
        &self,
        transport: &mut FramedTransport,
        stop: &mut watch::Receiver<bool>,
        out: &mut Outbound,
    ) -> SatelliteResult<()> {
        let config = &self.ctx.config;
        let mut ping =
            tokio::time::interval_at(Instant::now() + config.ping_interval, config.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_heard = Instant::now();
        let mut resubscribing = false;

        loop {
            let batch_at = out.batch_deadline;
            let ack_at = out.ack_deadline;
            tokio::select! {
                biased;
                _ = stopped(stop) => {
                    debug!("stop requested; closing session");
                    return Ok(());
                }
                message = transport.recv() => {
                    let message = message?.ok_or_else(|| {
                        SatelliteError::transport_retryable("connection closed by peer")
                    })?;
                    last_heard = Instant::now();
                    self.handle(transport, out, message, &mut resubscribing).await?;
                }
                _ = self.ctx.local_writes.notified() => {
                    self.pump(transport, out, false).await?;
                }
                _ = sleep_until(batch_at.unwrap_or_else(Instant::now)), if batch_at.is_some() => {
                    self.pump(transport, out, true).await?;
                }
                _ = sleep_until(ack_at.unwrap_or_else(Instant::now)), if ack_at.is_some() => {
                    warn!(acked = out.acked, sent = out.sent_up_to, "ack timed out; resending");
                    out.rewind();
                    self.pump(transport, out, true).await?;
                }
                _ = ping.tick() => {
                    if last_heard.elapsed() > config.liveness_timeout {
                        return Err(SatelliteError::transport_retryable("liveness timeout"));
                    }
                    transport.send(&Message::Ping).await?;
                }
            }
        }
    }

    async fn handle(
        &self,
        transport: &mut FramedTransport,
        out: &mut Outbound,
        message: Message,
        resubscribing: &mut bool,
    ) -> SatelliteResult<()> {
        match message {
            Message::Transaction(txn) => {
                let report = self.applier.apply(&txn).await?;
                if !report.rows.is_empty() {
                    self.ctx.notifier.notify(ChangeOrigin::Remote, report.rows);
                }
            }
            Message::Ack(ack) => self.on_ack(transport, out, ack.up_to_seq).await?,
            Message::SchemaChange(record) => {
                self.migrations.apply_inline(&record).await?;
            }
            Message::Ping => transport.send(&Message::Pong).await?,
            Message::Pong => {}
            Message::SubscribeAck(ack) if *resubscribing => {
                debug!(cursor = ack.cursor, "resubscribed");
                *resubscribing = false;
                self.signals.set_state(ConnectionState::Active);
            }
            Message::Error(e) if e.code == ErrorCode::CursorUnavailable => {
                if *resubscribing {
                    return Err(SatelliteError::violation("cursor 0 reported unavailable"));
                }
                warn!("server lost our cursor; resubscribing from the start");
                self.signals.set_state(ConnectionState::Recovering);
                self.reset_cursor().await?;
                let schema_version = self.migrations.current_version().await?;
                transport
                    .send(&Message::SubscribeRequest(SubscribeRequest {
                        last_seen_cursor: 0,
                        schema_version,
                    }))
                    .await?;
                *resubscribing = true;
            }
            Message::Error(e) => return Err(server_error(&e)),
            other => {
                return Err(SatelliteError::violation(format!(
                    "unexpected {:?} while active",
                    other.kind()
                )))
            }
        }
        Ok(())
    }

    async fn on_ack(
        &self,
        transport: &mut FramedTransport,
        out: &mut Outbound,
        up_to_seq: u64,
    ) -> SatelliteResult<()> {
        if up_to_seq <= out.acked {
            trace!(up_to_seq, acked = out.acked, "ignoring stale ack");
            return Ok(());
        }
        let marked = self.oplog.mark_sent(up_to_seq).await?;
        self.oplog.purge_sent().await?;

        out.acked = up_to_seq;
        out.sent_up_to = out.sent_up_to.max(up_to_seq);
        out.in_flight.retain(|batch| batch.last_seq > up_to_seq);
        out.ack_deadline = if out.in_flight.is_empty() {
            None
        } else {
            Some(Instant::now() + self.ctx.config.ack_timeout)
        };
        self.ctx.record(|s| s.entries_acked += marked);
        debug!(up_to_seq, marked, "oplog entries acknowledged");

        self.pump(transport, out, false).await
    }

    /// Sends pending oplog entries while the outbound queue has room.
    ///
    /// Without `force`, a partial batch waits for the batch window.
    async fn pump(
        &self,
        transport: &mut FramedTransport,
        out: &mut Outbound,
        force: bool,
    ) -> SatelliteResult<()> {
        let config = &self.ctx.config;
        loop {
            let in_flight = out.in_flight_entries();
            let capacity = config.max_outbound_depth.saturating_sub(in_flight);
            if capacity == 0 {
                trace!(in_flight, "outbound queue full; transmission paused");
                return Ok(());
            }
            let limit = capacity.min(config.batch_size.max(1));
            let entries = self.oplog.pending_entries(out.sent_up_to, limit).await?;
            if entries.is_empty() {
                out.batch_deadline = None;
                return Ok(());
            }

            let full = entries.len() >= limit;
            if !full && !force && !config.batch_window.is_zero() {
                out.batch_deadline
                    .get_or_insert_with(|| Instant::now() + config.batch_window);
                return Ok(());
            }
            out.batch_deadline = None;
            self.send_batch(transport, out, entries).await?;
            if !full {
                return Ok(());
            }
        }
    }

    async fn send_batch(
        &self,
        transport: &mut FramedTransport,
        out: &mut Outbound,
        entries: Vec<OplogEntry>,
    ) -> SatelliteResult<()> {
        let count = entries.len();
        let first_seq = entries.first().map_or(0, |e| e.seq);
        let last_seq = entries.last().map_or(out.sent_up_to, |e| e.seq);
        for txn in group_transactions(entries) {
            transport.send(&Message::Transaction(txn)).await?;
        }

        out.sent_up_to = last_seq;
        out.in_flight.push_back(InFlight { last_seq, count });
        out.ack_deadline
            .get_or_insert_with(|| Instant::now() + self.ctx.config.ack_timeout);
        self.ctx.record(|s| s.entries_sent += count as u64);
        debug!(count, first_seq, last_seq, "sent oplog batch");
        Ok(())
    }

    /// Waits for a handshake reply, answering pings on the way.
    ///
    /// `None` means a stop was requested.
    async fn expect_reply(
        &self,
        transport: &mut FramedTransport,
        stop: &mut watch::Receiver<bool>,
    ) -> SatelliteResult<Option<Message>> {
        let deadline = Instant::now() + self.ctx.config.connect_timeout;
        loop {
            let received = tokio::select! {
                biased;
                _ = stopped(stop) => return Ok(None),
                result = tokio::time::timeout_at(deadline, transport.recv()) => {
                    result.map_err(|_| SatelliteError::transport_retryable("handshake timed out"))??
                }
            };
            match received {
                None => {
                    return Err(SatelliteError::transport_retryable(
                        "connection closed by peer",
                    ))
                }
                Some(Message::Ping) => transport.send(&Message::Pong).await?,
                Some(Message::Pong) => {}
                Some(message) => return Ok(Some(message)),
            }
        }
    }

    async fn load_meta(&self) -> SatelliteResult<SyncMeta> {
        let mut tx = self.storage.begin().await?;
        MetaStore::load(tx.as_mut()).await
    }

    async fn reset_cursor(&self) -> SatelliteResult<()> {
        let mut tx = self.storage.begin().await?;
        MetaStore::set(tx.as_mut(), &[("server_cursor", 0)]).await?;
        tx.commit().await?;
        Ok(())
    }
}

impl std::fmt::Debug for ConnectionDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionDriver")
            .field("replica_id", &self.ctx.replica_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use satellite_protocol::{CausalityTag, ChangeOp, VersionStamp};
    use satellite_storage::{row, Row, SqlValue};

    fn entry(seq: u64, counter: u64) -> OplogEntry {
        OplogEntry {
            seq,
            table: "items".into(),
            op: ChangeOp::Insert,
            pk: row([("id", SqlValue::from(seq as i64))]),
            values: Row::new(),
            stamp: VersionStamp::new(CausalityTag::new("r1", counter), 100 + counter, 3),
            sent: false,
        }
    }

    #[test]
    fn batches_group_by_local_transaction() {
        let txns = group_transactions(vec![entry(5, 1), entry(6, 1), entry(7, 2)]);
        assert_eq!(txns.len(), 2);
        assert_eq!(txns[0].changes.len(), 2);
        assert_eq!(txns[0].tag, CausalityTag::new("r1", 1));
        assert_eq!(txns[0].observed, 3);
        assert_eq!(txns[0].commit_seq, None);
        assert_eq!(txns[1].last_seq(), Some(7));
    }

    #[test]
    fn rewind_resends_from_last_ack() {
        let mut out = Outbound::new(4);
        out.sent_up_to = 7;
        out.in_flight.push_back(InFlight {
            last_seq: 7,
            count: 3,
        });
        assert_eq!(out.in_flight_entries(), 3);
        out.rewind();
        assert_eq!(out.sent_up_to, 4);
        assert_eq!(out.in_flight_entries(), 0);
    }

    #[test]
    fn server_errors_are_classified() {
        let err = server_error(&ErrorMessage {
            code: ErrorCode::BadRequest,
            message: "no".into(),
        });
        assert!(matches!(err, SatelliteError::ProtocolViolation(_)));
        let err = server_error(&ErrorMessage {
            code: ErrorCode::SchemaMismatch,
            message: "behind".into(),
        });
        assert!(err.is_retryable());
    }
}
