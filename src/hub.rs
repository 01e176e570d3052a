//! Per-room websocket hub
//!
//! The hub multiplexes full-duplex connections by room. Each connection gets
//! a read task (this module's socket loop), a writer task draining a
//! per-connection outbound queue, and a liveness ping task. Op ingestion
//! serializes append, apply, snapshot save and broadcast under a per-room
//! async mutex so every connection observes ops in sequence order; the
//! registry itself sits behind a plain mutex that is never held across
//! store I/O.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::apply::apply;
use crate::error::AppResult;
use crate::model::{now_ms, ClientFrame, Op, RoomDoc, ServerFrame};
use crate::presence;
use crate::store::RoomStore;

/// Liveness ping period
pub const PING_PERIOD: Duration = Duration::from_secs(30);

/// A connection is reaped when nothing arrives for this long
pub const READ_DEADLINE: Duration = Duration::from_secs(90);

/// Per-frame write deadline on a peer socket
pub const WRITE_DEADLINE: Duration = Duration::from_secs(10);

struct ClientHandle {
    sender: UnboundedSender<Message>,
    actor_id: Option<String>,
}

/// Connection multiplexer for all rooms served by this process
pub struct Hub {
    store: Arc<dyn RoomStore>,
    clients: Mutex<HashMap<String, HashMap<u64, ClientHandle>>>,
    room_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    next_conn_id: AtomicU64,
}

impl Hub {
    pub fn new(store: Arc<dyn RoomStore>) -> Self {
        Self {
            store,
            clients: Mutex::new(HashMap::new()),
            room_locks: DashMap::new(),
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn RoomStore> {
        &self.store
    }

    pub(crate) fn room_lock(&self, room_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.room_locks
            .entry(room_id.to_string())
            .or_default()
            .clone()
    }

    /// Register a connection's outbound queue; returns its connection id.
    pub fn register(&self, room_id: &str, sender: UnboundedSender<Message>) -> u64 {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let mut clients = self.clients.lock();
        clients.entry(room_id.to_string()).or_default().insert(
            conn_id,
            ClientHandle {
                sender,
                actor_id: None,
            },
        );
        conn_id
    }

    /// Drop a connection from the registry; returns the actor it was bound
    /// to, if any.
    pub fn unregister(&self, room_id: &str, conn_id: u64) -> Option<String> {
        let mut clients = self.clients.lock();
        let room = clients.get_mut(room_id)?;
        let handle = room.remove(&conn_id);
        if room.is_empty() {
            clients.remove(room_id);
        }
        handle.and_then(|handle| handle.actor_id)
    }

    /// Bind a connection to the actor it speaks for. Presence derives
    /// liveness from these bindings.
    pub fn bind_actor(&self, room_id: &str, conn_id: u64, actor_id: &str) {
        let mut clients = self.clients.lock();
        if let Some(handle) = clients
            .get_mut(room_id)
            .and_then(|room| room.get_mut(&conn_id))
        {
            handle.actor_id = Some(actor_id.to_string());
        }
    }

    /// Whether any live connection in the room is bound to the actor.
    pub fn has_actor_connection(&self, room_id: &str, actor_id: &str) -> bool {
        let clients = self.clients.lock();
        clients
            .get(room_id)
            .map(|room| {
                room.values()
                    .any(|handle| handle.actor_id.as_deref() == Some(actor_id))
            })
            .unwrap_or(false)
    }

    /// Snapshot of the registry: every registered room with the set of
    /// actors currently bound to at least one of its connections.
    pub fn live_actors(&self) -> Vec<(String, HashSet<String>)> {
        let clients = self.clients.lock();
        clients
            .iter()
            .map(|(room_id, room)| {
                let actors = room
                    .values()
                    .filter_map(|handle| handle.actor_id.clone())
                    .collect();
                (room_id.clone(), actors)
            })
            .collect()
    }

    /// Serialize a frame once and queue it on every connection in the room.
    /// Send failures are swallowed; the peer's own close path reaps it.
    pub fn broadcast(&self, room_id: &str, frame: &ServerFrame) {
        let Ok(payload) = serde_json::to_string(frame) else {
            return;
        };
        let clients = self.clients.lock();
        let Some(room) = clients.get(room_id) else {
            return;
        };
        for handle in room.values() {
            let _ = handle.sender.send(Message::Text(payload.clone()));
        }
    }

    /// Materialize the room: snapshot, replayed tail, and the effective
    /// sequence. A missing or unreadable room yields a fresh empty document.
    pub async fn load_doc(&self, room_id: &str) -> (RoomDoc, i64) {
        let (mut doc, snapshot_seq) = match self.store.load_snapshot(room_id).await {
            Ok(Some((doc, seq))) => (doc, seq),
            Ok(None) => (RoomDoc::new(room_id, ""), 0),
            Err(err) => {
                warn!(room = room_id, error = %err, "snapshot load failed; starting from empty");
                (RoomDoc::new(room_id, ""), 0)
            }
        };
        match self.store.load_ops(room_id, snapshot_seq).await {
            Ok(tail) => {
                for entry in &tail {
                    apply(&mut doc, &entry.op);
                }
            }
            Err(err) => warn!(room = room_id, error = %err, "op replay failed"),
        }
        let current = self
            .store
            .current_seq(room_id)
            .await
            .unwrap_or(snapshot_seq);
        let seq = snapshot_seq.max(current);
        doc.seq = seq;
        (doc, seq)
    }

    /// Ingest one op: stamp missing id/timestamp, append to the log, apply
    /// to a freshly reloaded document, persist the snapshot and fan out.
    /// Returns the assigned sequence and the stamped op. An append failure
    /// drops the op (no broadcast, no ack).
    pub async fn ingest_op(&self, room_id: &str, mut op: Op) -> AppResult<(i64, Op)> {
        if op.id.is_empty() {
            op.id = Uuid::new_v4().to_string();
        }
        if op.timestamp == 0 {
            op.timestamp = now_ms();
        }

        let lock = self.room_lock(room_id);
        let _guard = lock.lock().await;

        let (mut doc, _) = self.load_doc(room_id).await;
        let seq = self.store.append_op(room_id, &op).await?;
        apply(&mut doc, &op);
        doc.seq = seq;
        if let Err(err) = self.store.save_snapshot(room_id, &doc, seq).await {
            warn!(room = room_id, error = %err, "snapshot save failed; log remains authoritative");
        }
        self.broadcast(
            room_id,
            &ServerFrame::Op {
                seq,
                op: op.clone(),
            },
        );
        Ok((seq, op))
    }

    /// Drive one upgraded websocket until it closes.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket, room_id: String) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let conn_id = self.register(&room_id, tx.clone());
        debug!(room = %room_id, conn = conn_id, "connection registered");

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match tokio::time::timeout(WRITE_DEADLINE, ws_sender.send(message)).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
        });

        let ping_sender = tx.clone();
        let pinger = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_PERIOD);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if ping_sender.send(Message::Ping(Vec::new())).is_err() {
                    break;
                }
            }
        });

        let (doc, seq) = self.load_doc(&room_id).await;
        send_frame(&tx, &ServerFrame::Snapshot { seq, doc });
        if let Err(err) = self.store.touch(&room_id).await {
            warn!(room = %room_id, error = %err, "room ttl refresh failed");
        }

        loop {
            let message = match tokio::time::timeout(READ_DEADLINE, ws_receiver.next()).await {
                Ok(Some(Ok(message))) => message,
                // deadline exceeded, peer closed, or transport error
                _ => break,
            };
            match message {
                Message::Text(text) => {
                    let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else {
                        debug!(room = %room_id, conn = conn_id, "malformed frame; closing");
                        break;
                    };
                    match frame {
                        ClientFrame::Op { op, .. } => {
                            if !op.actor_id.is_empty() {
                                self.bind_actor(&room_id, conn_id, &op.actor_id);
                            }
                            match self.ingest_op(&room_id, op).await {
                                Ok((seq, _)) => send_frame(&tx, &ServerFrame::Ack { seq }),
                                Err(err) => {
                                    warn!(room = %room_id, error = %err, "op append failed; dropped");
                                }
                            }
                        }
                        ClientFrame::Resync => {
                            let (doc, seq) = self.load_doc(&room_id).await;
                            send_frame(&tx, &ServerFrame::Snapshot { seq, doc });
                        }
                        ClientFrame::Ping => send_frame(&tx, &ServerFrame::Pong { ts: now_ms() }),
                        ClientFrame::Unknown => {}
                    }
                }
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
            }
        }

        let actor = self.unregister(&room_id, conn_id);
        pinger.abort();
        writer.abort();
        if let Some(actor_id) = actor {
            if !self.has_actor_connection(&room_id, &actor_id) {
                presence::mark_departed(&self, &room_id, &actor_id).await;
            }
        }
        debug!(room = %room_id, conn = conn_id, "connection closed");
    }
}

fn send_frame(sender: &UnboundedSender<Message>, frame: &ServerFrame) {
    if let Ok(payload) = serde_json::to_string(frame) {
        let _ = sender.send(Message::Text(payload));
    }
}
