//! Room document, operation and wire-frame types
//!
//! The room document is the replicated entity. Persisted snapshots are
//! treated as best-effort: every container deserializes from `null` or a
//! missing field into its empty value, so snapshots written before a schema
//! addition rehydrate cleanly.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};

/// Current wall-clock time in millisecond epoch
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Replicated room document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomDoc {
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub target_currency: String,
    #[serde(default, deserialize_with = "null_default")]
    pub items: HashMap<String, Item>,
    #[serde(default, deserialize_with = "null_default")]
    pub participants: HashMap<String, Participant>,
    #[serde(default)]
    pub tax_cents: i64,
    #[serde(default)]
    pub tip_cents: i64,
    /// Latest applied server sequence
    #[serde(default)]
    pub seq: i64,
    #[serde(default)]
    pub updated_at: i64,
    /// Item id -> removal timestamp
    #[serde(default, deserialize_with = "null_default")]
    pub tombstones: HashMap<String, i64>,
    /// Participant id -> removal timestamp
    #[serde(default, deserialize_with = "null_default")]
    pub participant_tombstones: HashMap<String, i64>,
}

impl RoomDoc {
    /// Create an empty room document
    pub fn new(room_id: &str, name: &str) -> Self {
        Self {
            room_id: room_id.to_string(),
            name: name.to_string(),
            updated_at: now_ms(),
            ..Self::default()
        }
    }
}

/// A line item on the shared bill
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Item {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub quantity: i64,
    #[serde(default)]
    pub unit_price_cents: i64,
    #[serde(default)]
    pub line_price_cents: i64,
    #[serde(default)]
    pub discount_cents: i64,
    #[serde(default)]
    pub discount_percent: f64,
    /// Participant id -> whether that participant shares this item
    #[serde(default, deserialize_with = "null_default")]
    pub assigned: HashMap<String, bool>,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub raw_text: String,
    #[serde(default, deserialize_with = "null_default")]
    pub warnings: Vec<String>,
    #[serde(default, deserialize_with = "null_default")]
    pub meta: HashMap<String, serde_json::Value>,
}

/// A collaborator in a room
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub initials: String,
    #[serde(default)]
    pub color_seed: String,
    #[serde(default)]
    pub present: bool,
    #[serde(default)]
    pub updated_at: i64,
}

/// Operation kind; unrecognized or missing kinds deserialize to `Unknown`
/// and are dropped by the apply path instead of failing the whole frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    SetItem,
    RemoveItem,
    SetParticipant,
    RemoveParticipant,
    AssignItem,
    SetTaxTip,
    SetRoomName,
    #[default]
    #[serde(other)]
    Unknown,
}

/// An atomic edit to a room document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub actor_id: String,
    /// Millisecond epoch; the server stamps `now` when zero on receipt
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub kind: OpKind,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Op {
    /// Build a `set_participant` op carrying the given participant state.
    /// The op timestamp mirrors the participant's `updated_at`.
    pub fn set_participant(actor_id: &str, participant: &Participant) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            actor_id: actor_id.to_string(),
            timestamp: participant.updated_at,
            kind: OpKind::SetParticipant,
            payload: serde_json::json!({ "participant": participant }),
        }
    }
}

/// An op together with its server-assigned sequence; the element type of
/// the persisted op log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeqOp {
    pub seq: i64,
    pub op: Op,
}

/// Frames the server sends to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Snapshot { seq: i64, doc: RoomDoc },
    Op { seq: i64, op: Op },
    Ack { seq: i64 },
    Pong { ts: i64 },
}

/// Frames clients send to the server
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Op {
        op: Op,
        #[serde(default)]
        last_seq: i64,
        #[serde(default)]
        client_id: String,
        #[serde(default)]
        timestamp: i64,
    },
    Resync,
    Ping,
    #[serde(other)]
    Unknown,
}
