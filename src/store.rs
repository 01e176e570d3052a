//! Room persistence over a remote key/value store
//!
//! Per room three keys are used: `room:{id}:snapshot` (JSON document),
//! `room:{id}:seq` (atomic counter; the post-increment value is an op's
//! sequence) and `room:{id}:ops` (ordered list of `{seq, op}` entries).
//! Every write path refreshes the TTLs so idle rooms evict together.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;

use crate::error::AppResult;
use crate::model::{Op, RoomDoc, SeqOp};

fn snapshot_key(room_id: &str) -> String {
    format!("room:{room_id}:snapshot")
}

fn seq_key(room_id: &str) -> String {
    format!("room:{room_id}:seq")
}

fn ops_key(room_id: &str) -> String {
    format!("room:{room_id}:ops")
}

/// Persistence seam for room documents and their op logs
#[async_trait]
pub trait RoomStore: Send + Sync {
    /// Load the latest snapshot and its sequence; `None` if the room is
    /// absent (or expired).
    async fn load_snapshot(&self, room_id: &str) -> AppResult<Option<(RoomDoc, i64)>>;

    /// Atomically write the snapshot and its sequence, refreshing TTLs.
    /// After this returns, all ops with sequence <= `seq` are reflected in
    /// the stored document.
    async fn save_snapshot(&self, room_id: &str, doc: &RoomDoc, seq: i64) -> AppResult<()>;

    /// Assign the next sequence and append `{seq, op}` to the room's log.
    /// The increment is atomic; the push is best-effort (readers tolerate
    /// the counter briefly running ahead of the list).
    async fn append_op(&self, room_id: &str, op: &Op) -> AppResult<i64>;

    /// Latest assigned sequence, 0 when the room is absent.
    async fn current_seq(&self, room_id: &str) -> AppResult<i64>;

    /// All logged ops with sequence > `from_seq`, in log order.
    /// Undecodable log entries are skipped.
    async fn load_ops(&self, room_id: &str, from_seq: i64) -> AppResult<Vec<SeqOp>>;

    /// Refresh the TTLs on all of the room's keys.
    async fn touch(&self, room_id: &str) -> AppResult<()>;

    /// Read a string cache entry (used for the FX rates cache).
    async fn cache_get(&self, key: &str) -> AppResult<Option<String>>;

    /// Write a string cache entry with its own TTL.
    async fn cache_set(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()>;
}

/// Redis-backed `RoomStore`
pub struct RedisStore {
    conn: ConnectionManager,
    ttl: Duration,
}

impl RedisStore {
    /// Connect to Redis and return a store enforcing the given room TTL.
    pub async fn connect(url: &str, ttl: Duration) -> AppResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn, ttl })
    }

    fn ttl_secs(&self) -> usize {
        self.ttl.as_secs() as usize
    }
}

#[async_trait]
impl RoomStore for RedisStore {
    async fn load_snapshot(&self, room_id: &str) -> AppResult<Option<(RoomDoc, i64)>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(snapshot_key(room_id)).await?;
        let Some(payload) = payload else {
            return Ok(None);
        };
        let doc: RoomDoc = serde_json::from_str(&payload)?;
        let seq = conn
            .get::<_, Option<i64>>(seq_key(room_id))
            .await
            .ok()
            .flatten()
            .unwrap_or(0);
        Ok(Some((doc, seq)))
    }

    async fn save_snapshot(&self, room_id: &str, doc: &RoomDoc, seq: i64) -> AppResult<()> {
        let payload = serde_json::to_string(doc)?;
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .set_ex(snapshot_key(room_id), payload, self.ttl_secs())
            .ignore()
            .set_ex(seq_key(room_id), seq, self.ttl_secs())
            .ignore()
            .expire(ops_key(room_id), self.ttl_secs())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn append_op(&self, room_id: &str, op: &Op) -> AppResult<i64> {
        let mut conn = self.conn.clone();
        let seq: i64 = conn.incr(seq_key(room_id), 1).await?;
        let entry = serde_json::to_string(&SeqOp {
            seq,
            op: op.clone(),
        })?;
        let pushed: Result<(), redis::RedisError> = redis::pipe()
            .atomic()
            .rpush(ops_key(room_id), entry)
            .ignore()
            .expire(ops_key(room_id), self.ttl_secs())
            .ignore()
            .expire(seq_key(room_id), self.ttl_secs())
            .ignore()
            .query_async(&mut conn)
            .await;
        if let Err(err) = pushed {
            warn!(room = room_id, error = %err, "op push failed after seq increment");
        }
        Ok(seq)
    }

    async fn current_seq(&self, room_id: &str) -> AppResult<i64> {
        let mut conn = self.conn.clone();
        let seq: Option<i64> = conn.get(seq_key(room_id)).await?;
        Ok(seq.unwrap_or(0))
    }

    async fn load_ops(&self, room_id: &str, from_seq: i64) -> AppResult<Vec<SeqOp>> {
        let mut conn = self.conn.clone();
        let entries: Vec<String> = conn.lrange(ops_key(room_id), 0, -1).await?;
        let mut ops = Vec::new();
        for entry in entries {
            let Ok(wrapper) = serde_json::from_str::<SeqOp>(&entry) else {
                continue;
            };
            if wrapper.seq > from_seq {
                ops.push(wrapper);
            }
        }
        Ok(ops)
    }

    async fn touch(&self, room_id: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let refreshed: Result<(), redis::RedisError> = redis::pipe()
            .atomic()
            .expire(snapshot_key(room_id), self.ttl_secs())
            .ignore()
            .expire(seq_key(room_id), self.ttl_secs())
            .ignore()
            .expire(ops_key(room_id), self.ttl_secs())
            .ignore()
            .query_async(&mut conn)
            .await;
        if let Err(err) = refreshed {
            warn!(room = room_id, error = %err, "ttl refresh failed");
        }
        Ok(())
    }

    async fn cache_get(&self, key: &str) -> AppResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn cache_set(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl.as_secs() as usize).await?;
        Ok(())
    }
}

/// In-memory `RoomStore` backing the test suites and `REDIS_URL=memory://`
/// local runs. Entries are stored serialized so decode tolerance matches the
/// Redis backend. TTLs are accepted but not enforced.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    rooms: HashMap<String, MemoryRoom>,
    cache: HashMap<String, String>,
}

#[derive(Default)]
struct MemoryRoom {
    snapshot: Option<String>,
    snapshot_seq: i64,
    seq: i64,
    ops: Vec<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoomStore for MemoryStore {
    async fn load_snapshot(&self, room_id: &str) -> AppResult<Option<(RoomDoc, i64)>> {
        let payload = {
            let inner = self.inner.lock();
            inner.rooms.get(room_id).and_then(|room| {
                room.snapshot
                    .as_ref()
                    .map(|snapshot| (snapshot.clone(), room.snapshot_seq))
            })
        };
        let Some((payload, seq)) = payload else {
            return Ok(None);
        };
        let doc: RoomDoc = serde_json::from_str(&payload)?;
        Ok(Some((doc, seq)))
    }

    async fn save_snapshot(&self, room_id: &str, doc: &RoomDoc, seq: i64) -> AppResult<()> {
        let payload = serde_json::to_string(doc)?;
        let mut inner = self.inner.lock();
        let room = inner.rooms.entry(room_id.to_string()).or_default();
        room.snapshot = Some(payload);
        room.snapshot_seq = seq;
        Ok(())
    }

    async fn append_op(&self, room_id: &str, op: &Op) -> AppResult<i64> {
        let mut inner = self.inner.lock();
        let room = inner.rooms.entry(room_id.to_string()).or_default();
        room.seq += 1;
        let seq = room.seq;
        let entry = serde_json::to_string(&SeqOp {
            seq,
            op: op.clone(),
        })?;
        room.ops.push(entry);
        Ok(seq)
    }

    async fn current_seq(&self, room_id: &str) -> AppResult<i64> {
        let inner = self.inner.lock();
        Ok(inner.rooms.get(room_id).map(|room| room.seq).unwrap_or(0))
    }

    async fn load_ops(&self, room_id: &str, from_seq: i64) -> AppResult<Vec<SeqOp>> {
        let entries = {
            let inner = self.inner.lock();
            inner
                .rooms
                .get(room_id)
                .map(|room| room.ops.clone())
                .unwrap_or_default()
        };
        let mut ops = Vec::new();
        for entry in entries {
            let Ok(wrapper) = serde_json::from_str::<SeqOp>(&entry) else {
                continue;
            };
            if wrapper.seq > from_seq {
                ops.push(wrapper);
            }
        }
        Ok(ops)
    }

    async fn touch(&self, _room_id: &str) -> AppResult<()> {
        Ok(())
    }

    async fn cache_get(&self, key: &str) -> AppResult<Option<String>> {
        let inner = self.inner.lock();
        Ok(inner.cache.get(key).cloned())
    }

    async fn cache_set(&self, key: &str, value: &str, _ttl: Duration) -> AppResult<()> {
        let mut inner = self.inner.lock();
        inner.cache.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
