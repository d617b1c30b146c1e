//! In-process reference replication service.
//!
//! The service keeps a single global log of committed transactions:
//! - every inbound transaction gets the next commit sequence
//! - transactions are acknowledged by oplog seq, idempotently per replica
//! - committed transactions fan out to every subscribed session, origin
//!   included
//!
//! Tests drive failure modes through the handle: dropping connections,
//! refusing new ones, holding acks, forgetting cursors, and pushing
//! migrations or arbitrary messages.

use parking_lot::Mutex;
use satellite_engine::{BoxedStream, FramedTransport, SatelliteError, SatelliteResult};
use satellite_protocol::{
    Ack, ErrorCode, HelloAck, Message, MigrationRecord, ProtocolVersion, ReplicaId,
    SubscribeAck, WireTransaction, DEFAULT_MAX_FRAME_LEN,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

const PIPE_CAPACITY: usize = 64 * 1024;

struct Session {
    replica: ReplicaId,
    outbox: mpsc::UnboundedSender<Message>,
    subscribed: bool,
    /// Dropping the session closes its connection.
    _close: oneshot::Sender<()>,
}

#[derive(Default)]
struct ServiceState {
    log: Vec<WireTransaction>,
    /// Cursors below this can no longer be served.
    forgotten: u64,
    /// Highest oplog seq received per replica.
    received: HashMap<ReplicaId, u64>,
    schema_version: u64,
    migrations: BTreeMap<u64, MigrationRecord>,
    sessions: HashMap<u64, Session>,
    next_session: u64,
    refusing: bool,
    hold_acks: bool,
    connections: u64,
    inbox: Vec<(ReplicaId, Message)>,
}

impl ServiceState {
    fn head(&self) -> u64 {
        self.log.last().and_then(|t| t.commit_seq).unwrap_or(0)
    }

    fn broadcast(&self, message: &Message) {
        for session in self.sessions.values().filter(|s| s.subscribed) {
            let _ = session.outbox.send(message.clone());
        }
    }

    fn send_to(&self, replica: &ReplicaId, message: &Message) {
        for session in self.sessions.values().filter(|s| &s.replica == replica) {
            let _ = session.outbox.send(message.clone());
        }
    }

    /// Commits `txn` and fans it out. Returns the ack to send, if any.
    fn commit(&mut self, origin: &ReplicaId, mut txn: WireTransaction) -> Option<u64> {
        let last_seq = txn.last_seq().unwrap_or(0);
        let seen = self.received.get(origin).copied().unwrap_or(0);
        if last_seq > seen {
            txn.commit_seq = Some(self.head() + 1);
            trace!(
                replica = %origin,
                commit_seq = ?txn.commit_seq,
                last_seq,
                "committed transaction"
            );
            self.broadcast(&Message::Transaction(txn.clone()));
            self.log.push(txn);
            self.received.insert(origin.clone(), last_seq);
        } else {
            trace!(replica = %origin, last_seq, seen, "duplicate transaction");
        }
        if self.hold_acks {
            None
        } else {
            self.received.get(origin).copied()
        }
    }
}

/// Handle to a reference replication service. Clones share one service.
#[derive(Clone)]
pub struct ReferenceService {
    state: Arc<Mutex<ServiceState>>,
    version: ProtocolVersion,
}

impl Default for ReferenceService {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceService {
    /// Creates a service speaking the current protocol version.
    pub fn new() -> Self {
        Self::with_version(ProtocolVersion::CURRENT)
    }

    /// Creates a service announcing `version`.
    pub fn with_version(version: ProtocolVersion) -> Self {
        Self {
            state: Arc::new(Mutex::new(ServiceState::default())),
            version,
        }
    }

    /// Opens a client connection served by this service.
    ///
    /// # Errors
    ///
    /// Fails with a retryable transport error while refusing connections.
    pub fn connect(&self) -> SatelliteResult<BoxedStream> {
        {
            let mut state = self.state.lock();
            if state.refusing {
                return Err(SatelliteError::transport_retryable("service unavailable"));
            }
            state.connections += 1;
        }
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        tokio::spawn(self.clone().serve(Box::new(server)));
        Ok(Box::new(client))
    }

    /// Serves one connection until either side closes it.
    pub async fn serve(self, stream: BoxedStream) {
        let mut transport = FramedTransport::new(stream, DEFAULT_MAX_FRAME_LEN);
        let (outbox, mut rx) = mpsc::unbounded_channel();
        let (close_tx, mut close_rx) = oneshot::channel();
        let mut close_tx = Some(close_tx);
        let mut session_id = None;

        loop {
            tokio::select! {
                received = transport.recv() => {
                    let message = match received {
                        Ok(Some(message)) => message,
                        Ok(None) => break,
                        Err(e) => {
                            debug!(error = %e, "session read failed");
                            break;
                        }
                    };
                    if let Err(e) = self
                        .handle(&mut transport, &outbox, &mut close_tx, &mut session_id, message)
                        .await
                    {
                        debug!(error = %e, "session ended");
                        break;
                    }
                }
                outgoing = rx.recv() => match outgoing {
                    Some(message) => {
                        if transport.send(&message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = &mut close_rx, if session_id.is_some() => {
                    debug!("session closed by service");
                    break;
                }
            }
        }

        if let Some(id) = session_id {
            self.state.lock().sessions.remove(&id);
        }
        transport.close().await;
    }

    async fn handle(
        &self,
        transport: &mut FramedTransport,
        outbox: &mpsc::UnboundedSender<Message>,
        close_tx: &mut Option<oneshot::Sender<()>>,
        session_id: &mut Option<u64>,
        message: Message,
    ) -> SatelliteResult<()> {
        let replica = session_id.and_then(|id| {
            self.state
                .lock()
                .sessions
                .get(&id)
                .map(|s| s.replica.clone())
        });
        if let Some(replica) = &replica {
            self.state.lock().inbox.push((replica.clone(), message.clone()));
        }

        match message {
            Message::Hello(hello) => {
                let Some(close) = close_tx.take() else {
                    return Err(SatelliteError::violation("second hello"));
                };
                let schema_version = {
                    let mut state = self.state.lock();
                    let id = state.next_session;
                    state.next_session += 1;
                    state.sessions.insert(
                        id,
                        Session {
                            replica: hello.replica_id.clone(),
                            outbox: outbox.clone(),
                            subscribed: false,
                            _close: close,
                        },
                    );
                    state.inbox.push((hello.replica_id.clone(), Message::Hello(hello.clone())));
                    *session_id = Some(id);
                    state.schema_version
                };
                debug!(replica = %hello.replica_id, "session opened");
                transport
                    .send(&Message::HelloAck(HelloAck {
                        server_version: self.version,
                        assigned_watermark: schema_version,
                    }))
                    .await?;
            }
            Message::SubscribeRequest(request) => {
                let Some(id) = *session_id else {
                    return transport
                        .send(&Message::error(ErrorCode::BadRequest, "subscribe before hello"))
                        .await;
                };
                let mut state = self.state.lock();
                if request.schema_version < state.schema_version {
                    let _ = outbox.send(Message::error(
                        ErrorCode::SchemaMismatch,
                        format!("service schema is {}", state.schema_version),
                    ));
                    return Ok(());
                }
                if request.last_seen_cursor > 0 && request.last_seen_cursor < state.forgotten {
                    let _ = outbox.send(Message::error(
                        ErrorCode::CursorUnavailable,
                        format!("history before {} is gone", state.forgotten),
                    ));
                    return Ok(());
                }
                let _ = outbox.send(Message::SubscribeAck(SubscribeAck { cursor: state.head() }));
                for txn in state
                    .log
                    .iter()
                    .filter(|t| t.commit_seq.unwrap_or(0) > request.last_seen_cursor)
                {
                    let _ = outbox.send(Message::Transaction(txn.clone()));
                }
                if let Some(session) = state.sessions.get_mut(&id) {
                    session.subscribed = true;
                }
            }
            Message::Transaction(txn) => {
                let Some(replica) = replica else {
                    return Err(SatelliteError::violation("transaction before hello"));
                };
                let ack = self.state.lock().commit(&replica, txn);
                if let Some(up_to_seq) = ack {
                    let _ = outbox.send(Message::Ack(Ack { up_to_seq }));
                }
            }
            Message::Ping => transport.send(&Message::Pong).await?,
            Message::Pong => {}
            other => warn!(kind = ?other.kind(), "unexpected message from client"),
        }
        Ok(())
    }

    /// Commits a transaction as if `origin` had sent it.
    ///
    /// Returns the commit sequence, or `None` for a duplicate.
    pub fn inject_transaction(&self, origin: &ReplicaId, txn: WireTransaction) -> Option<u64> {
        let mut state = self.state.lock();
        let before = state.head();
        state.commit(origin, txn);
        let head = state.head();
        (head > before).then_some(head)
    }

    /// Sends `message` to every session of `replica`.
    pub fn send_to(&self, replica: &ReplicaId, message: Message) {
        self.state.lock().send_to(replica, &message);
    }

    /// Records a migration, raises the schema version and pushes it to
    /// every subscribed session.
    pub fn publish_migration(&self, record: MigrationRecord) {
        let mut state = self.state.lock();
        state.schema_version = state.schema_version.max(record.version);
        state.broadcast(&Message::SchemaChange(record.clone()));
        state.migrations.insert(record.version, record);
    }

    /// Announces `version` without publishing any record.
    pub fn set_schema_version(&self, version: u64) {
        self.state.lock().schema_version = version;
    }

    /// Current schema version.
    pub fn schema_version(&self) -> u64 {
        self.state.lock().schema_version
    }

    /// Rejects subscriptions resuming from a cursor below `cursor`.
    pub fn forget_history(&self, cursor: u64) {
        self.state.lock().forgotten = cursor;
    }

    /// Closes every open session.
    pub fn drop_connections(&self) {
        let dropped = std::mem::take(&mut self.state.lock().sessions);
        debug!(sessions = dropped.len(), "dropping connections");
    }

    /// Refuses (`false`) or accepts (`true`) new connections.
    pub fn set_accepting(&self, accepting: bool) {
        self.state.lock().refusing = !accepting;
    }

    /// Withholds acks while set. Clearing it acks everything received.
    pub fn hold_acks(&self, hold: bool) {
        let mut state = self.state.lock();
        state.hold_acks = hold;
        if !hold {
            let received: Vec<(ReplicaId, u64)> =
                state.received.iter().map(|(r, s)| (r.clone(), *s)).collect();
            for (replica, up_to_seq) in received {
                state.send_to(&replica, &Message::Ack(Ack { up_to_seq }));
            }
        }
    }

    /// Every committed transaction, in commit order.
    pub fn transactions(&self) -> Vec<WireTransaction> {
        self.state.lock().log.clone()
    }

    /// Highest commit sequence.
    pub fn head(&self) -> u64 {
        self.state.lock().head()
    }

    /// Highest oplog seq received from `replica`.
    pub fn received_seq(&self, replica: &ReplicaId) -> u64 {
        self.state.lock().received.get(replica).copied().unwrap_or(0)
    }

    /// Every message received from `replica` since the service started.
    pub fn received_from(&self, replica: &ReplicaId) -> Vec<Message> {
        self.state
            .lock()
            .inbox
            .iter()
            .filter(|(r, _)| r == replica)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Oplog seqs `replica` sent, in arrival order, duplicates included.
    pub fn received_seqs(&self, replica: &ReplicaId) -> Vec<u64> {
        self.received_from(replica)
            .iter()
            .filter_map(|m| match m {
                Message::Transaction(txn) => Some(txn.changes.iter().map(|c| c.seq)),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Connections accepted so far.
    pub fn connection_count(&self) -> u64 {
        self.state.lock().connections
    }

    /// Sessions open right now.
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// The migration record for `version`, if published.
    pub fn migration(&self, version: u64) -> Option<MigrationRecord> {
        self.state.lock().migrations.get(&version).cloned()
    }
}

impl std::fmt::Debug for ReferenceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ReferenceService")
            .field("head", &state.head())
            .field("sessions", &state.sessions.len())
            .field("schema_version", &state.schema_version)
            .finish()
    }
}
