//! Presence reconciliation
//!
//! Presence is derived, not authoritative: a participant is present while at
//! least one connection is bound to their actor id. A periodic tick
//! reconciles every registered room against the document's `present` flags
//! and writes `set_participant` ops back into the log for any drift, which
//! collapses connect/disconnect flaps into at most one op per participant
//! per tick. The explicit disconnect path performs the same mutation
//! immediately for the affected actor.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::apply::apply;
use crate::hub::Hub;
use crate::model::{now_ms, Op, Participant, RoomDoc, ServerFrame};

/// Reconciliation tick interval
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Run the reconciler until the process exits.
pub async fn run(hub: Arc<Hub>) {
    let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
    loop {
        ticker.tick().await;
        tick(&hub).await;
    }
}

/// One reconciliation pass over every registered room.
pub async fn tick(hub: &Hub) {
    for (room_id, live) in hub.live_actors() {
        reconcile_room(hub, &room_id, &live).await;
    }
}

/// Converge one room's `present` flags onto the live actor set. Saves a
/// fresh snapshot at the latest observed sequence when anything changed.
pub async fn reconcile_room(hub: &Hub, room_id: &str, live: &HashSet<String>) {
    let lock = hub.room_lock(room_id);
    let _guard = lock.lock().await;

    let (mut doc, mut latest_seq) = hub.load_doc(room_id).await;
    let drifted: Vec<Participant> = doc
        .participants
        .values()
        .filter(|participant| participant.present != live.contains(&participant.id))
        .cloned()
        .collect();
    if drifted.is_empty() {
        return;
    }

    for mut participant in drifted {
        participant.present = live.contains(&participant.id);
        participant.updated_at = now_ms();
        if let Some(seq) = emit(hub, room_id, &mut doc, &participant).await {
            latest_seq = seq;
        }
    }
    save(hub, room_id, &doc, latest_seq).await;
}

/// Immediately mark a departed actor absent (connection close path).
pub async fn mark_departed(hub: &Hub, room_id: &str, actor_id: &str) {
    let lock = hub.room_lock(room_id);
    let _guard = lock.lock().await;

    let (mut doc, _) = hub.load_doc(room_id).await;
    let Some(existing) = doc.participants.get(actor_id) else {
        return;
    };
    if !existing.present {
        return;
    }
    let mut participant = existing.clone();
    participant.present = false;
    participant.updated_at = now_ms();
    if let Some(seq) = emit(hub, room_id, &mut doc, &participant).await {
        save(hub, room_id, &doc, seq).await;
    }
}

async fn emit(
    hub: &Hub,
    room_id: &str,
    doc: &mut RoomDoc,
    participant: &Participant,
) -> Option<i64> {
    // presence ops are server-derived; they carry no actor id
    let op = Op::set_participant("", participant);
    let seq = match hub.store().append_op(room_id, &op).await {
        Ok(seq) => seq,
        Err(err) => {
            warn!(room = room_id, actor = %participant.id, error = %err, "presence op append failed");
            return None;
        }
    };
    apply(doc, &op);
    doc.seq = seq;
    hub.broadcast(room_id, &ServerFrame::Op { seq, op });
    Some(seq)
}

async fn save(hub: &Hub, room_id: &str, doc: &RoomDoc, seq: i64) {
    if let Err(err) = hub.store().save_snapshot(room_id, doc, seq).await {
        warn!(room = room_id, error = %err, "presence snapshot save failed");
    }
}
