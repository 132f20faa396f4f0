//! The concurrent session registry and per-session record.
//!
//! One [`Session`] exists per accepted WebSocket connection. The registry is
//! the only structure shared across connection tasks; everything else a
//! session owns is reached through its id, never through a raw handle, so
//! nothing can dangle after teardown.

use crate::transport::MessageSink;
use crate::ws::protocol::{LogicalStorage, PROTOCOL_VERSION, ServerFrame, ServerKind};
use bytes::Bytes;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::{Arc, Mutex as StdMutex};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Lifecycle phase of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionPhase {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// The write half of a session plus the outbound sequence counter.
///
/// Both live under one gate so that assigning `server_seq` and transmitting
/// the frame are atomic with respect to every other sender. The gate is
/// per-session: sends for unrelated sessions never contend with each other.
struct SenderGate {
    /// `None` once the handle has been closed; sends are then skipped.
    sink: Option<Box<dyn MessageSink>>,
    /// Sequence number the next outbound frame will carry. Starts at 1; the
    /// peer already holds 0 from its own side of the handshake.
    server_seq: u64,
}

/// Per-connection session record.
pub struct Session {
    id: String,
    /// Last accepted inbound control-message sequence number. Written only
    /// by the owning read loop, read by reply builders.
    client_seq: AtomicU64,
    phase: StdMutex<SessionPhase>,
    sender: Mutex<SenderGate>,
    /// Opaque to this module; only the protocol layer reads or writes it.
    pub storage: StdMutex<LogicalStorage>,
}

impl Session {
    fn new(id: String, sink: Box<dyn MessageSink>) -> Self {
        Self {
            id,
            client_seq: AtomicU64::new(0),
            phase: StdMutex::new(SessionPhase::Connecting),
            sender: Mutex::new(SenderGate {
                sink: Some(sink),
                server_seq: 1,
            }),
            storage: StdMutex::new(LogicalStorage::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client_seq(&self) -> u64 {
        self.client_seq.load(Ordering::Acquire)
    }

    pub fn set_client_seq(&self, seq: u64) {
        self.client_seq.store(seq, Ordering::Release);
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock().unwrap()
    }

    /// Moves the lifecycle forward. Backward transitions (e.g. `Closing`
    /// back to `Open`) are ignored.
    pub fn advance_phase(&self, next: SessionPhase) {
        let mut phase = self.phase.lock().unwrap();
        if next > *phase {
            *phase = next;
        }
    }

    /// Builds the outbound envelope under the send gate and transmits it.
    ///
    /// Returns `true` when a frame actually went out. If the handle has
    /// already been closed the send is skipped silently; the control channel
    /// is best-effort and no error is surfaced to callers.
    pub async fn send_control(&self, kind: ServerKind, id: String, parameters: Value) -> bool {
        let mut gate = self.sender.lock().await;
        let seq = gate.server_seq;
        let frame = ServerFrame {
            version: PROTOCOL_VERSION,
            id,
            kind,
            seq,
            clientseq: self.client_seq(),
            parameters,
        };
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "Failed to serialize outbound frame");
                return false;
            }
        };
        let Some(sink) = gate.sink.as_mut() else {
            debug!(session_id = %self.id, ?kind, "Handle closed; outbound frame skipped");
            return false;
        };
        match sink.send_text(text).await {
            Ok(()) => {
                gate.server_seq += 1;
                debug!(session_id = %self.id, ?kind, seq, "Sent control message");
                true
            }
            Err(e) => {
                warn!(session_id = %self.id, ?kind, error = %e, "Failed to send control message");
                false
            }
        }
    }

    /// Transmits one binary frame under the send gate. Binary frames occupy
    /// a slot in the outbound sequence just like control messages.
    pub async fn send_binary(&self, bytes: Bytes) -> bool {
        let mut gate = self.sender.lock().await;
        let Some(sink) = gate.sink.as_mut() else {
            debug!(session_id = %self.id, "Handle closed; binary frame skipped");
            return false;
        };
        let len = bytes.len();
        match sink.send_binary(bytes).await {
            Ok(()) => {
                gate.server_seq += 1;
                debug!(session_id = %self.id, bytes = len, "Sent binary frame");
                true
            }
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "Failed to send binary frame");
                false
            }
        }
    }

    /// Closes the transport handle. Safe to call more than once; only the
    /// first call performs the close handshake.
    async fn close(&self) {
        self.advance_phase(SessionPhase::Closing);
        let mut gate = self.sender.lock().await;
        if let Some(mut sink) = gate.sink.take() {
            let _ = sink.close().await;
        }
        drop(gate);
        self.advance_phase(SessionPhase::Closed);
    }
}

/// Thread-safe map from session id to live session record.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and stores a session for `id`, returning the new record.
    /// Returns `None` without touching the existing record when the id is
    /// already present.
    pub fn add(
        &self,
        id: String,
        sink: Box<dyn MessageSink>,
    ) -> Option<Arc<Session>> {
        let entry = self.sessions.entry(id.clone());
        match entry {
            dashmap::Entry::Occupied(_) => {
                warn!(session_id = %id, "Session id already active; connection ignored");
                None
            }
            dashmap::Entry::Vacant(slot) => {
                let session = Arc::new(Session::new(id.clone(), sink));
                slot.insert(session.clone());
                info!(session_id = %id, "Session added");
                Some(session)
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Tears a session down: closes the handle if still open, then evicts
    /// the entry. Idempotent; concurrent calls for the same id close the
    /// handle at most once.
    pub async fn remove(&self, id: &str) {
        let Some((_, session)) = self.sessions.remove(id) else {
            return;
        };
        session.close().await;
        info!(session_id = %id, "Session removed");
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Ids of all live sessions, for the shutdown sweep.
    pub fn ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Sends one control message to the named session. Missing sessions and
    /// closed handles are skipped silently (logged at debug level).
    pub async fn send_control(
        &self,
        session_id: &str,
        kind: ServerKind,
        id: String,
        parameters: Value,
    ) -> bool {
        let Some(session) = self.get(session_id) else {
            debug!(session_id, ?kind, "Send to unknown session skipped");
            return false;
        };
        session.send_control(kind, id, parameters).await
    }

    /// Sends one binary frame to the named session, best-effort.
    pub async fn send_binary(&self, session_id: &str, bytes: Bytes) -> bool {
        let Some(session) = self.get(session_id) else {
            debug!(session_id, "Binary send to unknown session skipped");
            return false;
        };
        session.send_binary(bytes).await
    }
}
