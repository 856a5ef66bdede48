//! Two-step reconciliation and incremental fan-out on the server side.
//!
//! ```text
//!  peer                         server
//!   │ ── Step1(file, sv_peer) ──► │  diff = diff_since(sv_peer)
//!   │ ◄── Step2(file, diff) ───── │  sent only if non-empty
//!   │ ◄── Step1(file, sv_srv) ─── │  if diff was empty, or the peer holds
//!   │                             │  content the server lacks
//!   │ ── Step2 / Update ────────► │  apply → persist → fan out as Update
//! ```
//!
//! Every inbound frame is handled in isolation: a frame that fails to decode
//! or apply is logged and dropped, and the connection stays open.

use crate::connection::ConnectionId;
use crate::document::{Document, DocumentState};
use crate::presence::AwarenessChanges;
use crate::protocol::{AwarenessUpdate, Frame, SyncMessage, SyncStep};
use crate::replica::is_empty_update;

/// Handle one binary frame from `origin`. Returns the direct replies.
pub async fn handle_frame(doc: &Document, origin: ConnectionId, bytes: &[u8]) -> Vec<Frame> {
    match Frame::decode(bytes) {
        Ok(Frame::Sync(msg)) => handle_sync(doc, origin, msg).await,
        Ok(Frame::Awareness(update)) => {
            handle_awareness(doc, origin, update).await;
            Vec::new()
        }
        Err(e) => {
            log::warn!("Dropping malformed frame on {} from {origin}: {e}", doc.id());
            Vec::new()
        }
    }
}

/// Apply a SYNC message.
pub async fn handle_sync(doc: &Document, origin: ConnectionId, msg: SyncMessage) -> Vec<Frame> {
    match msg.step {
        SyncStep::Step1 => {
            let mut state = doc.lock().await;
            answer_step1(&mut state, doc.id(), &msg)
        }
        SyncStep::Step2 | SyncStep::Update => {
            apply_delta(doc, origin, msg).await;
            Vec::new()
        }
    }
}

fn answer_step1(state: &mut DocumentState, doc_id: &str, msg: &SyncMessage) -> Vec<Frame> {
    let sub_doc = state.replica.sub_doc(&msg.file);

    let diff = match sub_doc.diff_since(&msg.payload) {
        Ok(diff) => diff,
        Err(e) => {
            log::warn!("Bad state vector for {doc_id}/{}: {e}", msg.file);
            return Vec::new();
        }
    };
    let lacks = sub_doc.lacks(&msg.payload).unwrap_or(false);
    let diff_empty = is_empty_update(&diff);
    log::debug!(
        "Step1 for {doc_id}/{}: diff {} bytes, peer ahead: {lacks}",
        msg.file,
        if diff_empty { 0 } else { diff.len() }
    );

    let mut replies = Vec::with_capacity(2);
    if !diff_empty {
        replies.push(Frame::Sync(SyncMessage::step2(msg.file.clone(), diff)));
    }
    if diff_empty || lacks {
        replies.push(Frame::Sync(SyncMessage::step1(msg.file.clone(), sub_doc.state_vector())));
    }
    replies
}

async fn apply_delta(doc: &Document, origin: ConnectionId, msg: SyncMessage) {
    if is_empty_update(&msg.payload) {
        return;
    }

    {
        let mut state = doc.lock().await;
        let can_edit = state.connection(origin).map(|c| c.can_edit()).unwrap_or(false);
        if !can_edit {
            log::debug!(
                "Ignoring {:?} for {}/{} from view-only connection {origin}",
                msg.step,
                doc.id(),
                msg.file
            );
            return;
        }

        if let Err(e) = state.replica.sub_doc(&msg.file).apply_remote_delta(&msg.payload) {
            log::warn!("Dropping delta for {}/{} from {origin}: {e}", doc.id(), msg.file);
            return;
        }
    }

    // Persist and fan out outside the document lock
    doc.persist(&msg.file, &msg.payload).await;

    let frame = Frame::Sync(SyncMessage::update(msg.file, msg.payload));
    match doc.broadcast().broadcast(Some(origin), &frame) {
        Ok(receivers) => log::debug!("Fanned out delta on {} to {receivers} receivers", doc.id()),
        Err(e) => log::warn!("Failed to fan out delta on {}: {e}", doc.id()),
    }
}

/// Merge presence entries from `origin` and fan out whatever changed.
pub async fn handle_awareness(doc: &Document, origin: ConnectionId, update: AwarenessUpdate) {
    let fanout = {
        let mut state = doc.lock().await;
        if !state.connections.contains_key(&origin) {
            return;
        }

        // A connection may only publish ids nobody else owns
        let (accepted, foreign): (Vec<_>, Vec<_>) = update.entries.into_iter().partition(|e| {
            state.owners.get(&e.client_id).map_or(true, |owner| *owner == origin)
        });
        for entry in &foreign {
            log::warn!(
                "Connection {origin} tried to publish presence for client {} on {}",
                entry.client_id,
                doc.id()
            );
        }

        // The ceiling is reserved so the server's removal on detach can still win
        let (accepted, saturated): (Vec<_>, Vec<_>) =
            accepted.into_iter().partition(|e| e.clock < u32::MAX);
        for entry in &saturated {
            log::warn!(
                "Connection {origin} sent presence for client {} with a saturated clock on {}",
                entry.client_id,
                doc.id()
            );
        }

        let changes = state.awareness.apply(&AwarenessUpdate::new(accepted));
        record_ownership(&mut state, origin, &changes);
        if changes.is_empty() {
            return;
        }
        log::trace!(
            "Presence on {}: +{} ~{} -{}",
            doc.id(),
            changes.added.len(),
            changes.updated.len(),
            changes.removed.len()
        );
        state.awareness.entries_for(&changes.changed_ids())
    };

    if let Err(e) = doc.broadcast().broadcast(Some(origin), &Frame::Awareness(fanout)) {
        log::warn!("Failed to fan out presence on {}: {e}", doc.id());
    }
}

fn record_ownership(state: &mut DocumentState, origin: ConnectionId, changes: &AwarenessChanges) {
    for id in changes.added.iter().chain(&changes.updated) {
        state.owners.insert(*id, origin);
        if let Some(conn) = state.connections.get_mut(&origin) {
            conn.awareness_ids.insert(*id);
        }
    }
    for id in &changes.removed {
        state.owners.remove(id);
        if let Some(conn) = state.connections.get_mut(&origin) {
            conn.awareness_ids.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Permission;
    use crate::connection::Connection;
    use crate::document::DocumentConfig;
    use crate::presence::{PresenceFields, PresenceState};
    use crate::protocol::AwarenessEntry;
    use crate::replica::{Replica, SubDocument, TextEdit};
    use crate::storage::{DeltaLog, MemoryDeltaLog};
    use std::sync::Arc;

    fn seeded_doc(log: Option<Arc<dyn DeltaLog>>) -> Document {
        let mut replica = Replica::new();
        replica
            .sub_doc("main.tex")
            .local_edit(&TextEdit::Insert {
                at: 0,
                text: "\\begin{document}\\end{document}".into(),
            })
            .unwrap();
        Document::new("P1", "/tmp/P1", replica, DocumentConfig::default(), log, 0)
    }

    async fn join(doc: &Document, permission: Permission) -> (ConnectionId, crate::document::Attachment) {
        let conn = Connection::new(None, permission);
        let id = conn.id;
        (id, doc.attach(conn).await.unwrap())
    }

    fn sync_frame(msg: SyncMessage) -> Vec<u8> {
        Frame::Sync(msg).encode().unwrap()
    }

    fn presence(name: &str) -> PresenceState {
        PresenceState::from_fields(1, PresenceFields { name: name.into(), ..Default::default() })
    }

    #[tokio::test]
    async fn test_step1_from_empty_peer_gets_step2() {
        let doc = seeded_doc(None);
        let (id, _att) = join(&doc, Permission::Edit).await;
        let peer = SubDocument::new();

        let replies = handle_frame(&doc, id, &sync_frame(SyncMessage::step1("main.tex", peer.state_vector()))).await;
        assert_eq!(replies.len(), 1);
        let Frame::Sync(step2) = &replies[0] else { panic!("expected sync") };
        assert_eq!(step2.step, SyncStep::Step2);
        peer.apply_remote_delta(&step2.payload).unwrap();
        assert_eq!(peer.text(), "\\begin{document}\\end{document}");
    }

    #[tokio::test]
    async fn test_step1_when_caught_up_answers_step1() {
        let doc = seeded_doc(None);
        let (id, _att) = join(&doc, Permission::Edit).await;
        let peer = SubDocument::new();
        let full = doc.lock().await.replica.get("main.tex").unwrap().full_state();
        peer.apply_remote_delta(&full).unwrap();

        let replies = handle_frame(&doc, id, &sync_frame(SyncMessage::step1("main.tex", peer.state_vector()))).await;
        assert_eq!(replies.len(), 1);
        let Frame::Sync(msg) = &replies[0] else { panic!("expected sync") };
        assert_eq!(msg.step, SyncStep::Step1);
    }

    #[tokio::test]
    async fn test_step1_from_peer_ahead_requests_its_content() {
        let doc = seeded_doc(None);
        let (id, _att) = join(&doc, Permission::Edit).await;
        let peer = SubDocument::new();
        peer.local_edit(&TextEdit::Insert { at: 0, text: "offline".into() }).unwrap();

        let replies = handle_frame(&doc, id, &sync_frame(SyncMessage::step1("main.tex", peer.state_vector()))).await;
        let steps: Vec<SyncStep> = replies
            .iter()
            .filter_map(|f| match f {
                Frame::Sync(m) => Some(m.step),
                _ => None,
            })
            .collect();
        assert_eq!(steps, vec![SyncStep::Step2, SyncStep::Step1]);
    }

    #[tokio::test]
    async fn test_update_applied_and_fanned_out_to_others() {
        let log = Arc::new(MemoryDeltaLog::new());
        let doc = seeded_doc(Some(log.clone() as Arc<dyn DeltaLog>));
        let (a, mut att_a) = join(&doc, Permission::Edit).await;
        let (b, mut att_b) = join(&doc, Permission::Edit).await;

        let client = SubDocument::new();
        let full = doc.lock().await.replica.get("main.tex").unwrap().full_state();
        client.apply_remote_delta(&full).unwrap();
        let delta = client.local_edit(&TextEdit::Insert { at: 16, text: "Hello".into() }).unwrap().unwrap();

        let replies = handle_frame(&doc, a, &sync_frame(SyncMessage::update("main.tex", delta))).await;
        assert!(replies.is_empty());
        assert_eq!(
            doc.text("main.tex").await.unwrap(),
            "\\begin{document}Hello\\end{document}"
        );
        assert_eq!(log.delta_count("P1"), 1);

        let env_b = att_b.receiver.recv().await.unwrap();
        assert!(env_b.is_for(b));
        let env_a = att_a.receiver.recv().await.unwrap();
        assert!(!env_a.is_for(a));
    }

    #[tokio::test]
    async fn test_view_only_update_ignored() {
        let doc = seeded_doc(None);
        let (viewer, _att) = join(&doc, Permission::View).await;

        let client = SubDocument::new();
        let delta = client.local_edit(&TextEdit::Insert { at: 0, text: "vandal".into() }).unwrap().unwrap();
        handle_frame(&doc, viewer, &sync_frame(SyncMessage::update("main.tex", delta.clone()))).await;
        handle_frame(&doc, viewer, &sync_frame(SyncMessage::step2("main.tex", delta))).await;

        assert!(!doc.text("main.tex").await.unwrap().contains("vandal"));
        assert_eq!(doc.broadcast().stats().messages_sent, 0);
    }

    #[tokio::test]
    async fn test_malformed_frames_dropped() {
        let doc = seeded_doc(None);
        let (id, _att) = join(&doc, Permission::Edit).await;

        assert!(handle_frame(&doc, id, &[7, 1, 2]).await.is_empty());
        assert!(handle_frame(&doc, id, &[]).await.is_empty());
        let bad = sync_frame(SyncMessage::update("main.tex", vec![0xFF, 0xFF, 0xFF]));
        assert!(handle_frame(&doc, id, &bad).await.is_empty());
        assert_eq!(doc.text("main.tex").await.unwrap(), "\\begin{document}\\end{document}");
    }

    #[tokio::test]
    async fn test_awareness_fan_out_and_cleanup() {
        let doc = seeded_doc(None);
        let (a, _att_a) = join(&doc, Permission::View).await;
        let (b, mut att_b) = join(&doc, Permission::Edit).await;

        let update = AwarenessUpdate::new(vec![AwarenessEntry {
            client_id: 42,
            clock: 1,
            state: Some(presence("Ada")),
        }]);
        handle_frame(&doc, a, &Frame::Awareness(update).encode().unwrap()).await;
        assert_eq!(doc.collaborators().await.len(), 1);

        let env = att_b.receiver.recv().await.unwrap();
        assert!(env.is_for(b));
        let Frame::Awareness(seen) = Frame::decode(&env.bytes).unwrap() else { panic!() };
        assert_eq!(seen.client_ids(), vec![42]);

        let detached = doc.detach(a).await;
        assert_eq!(detached.removed, vec![42]);
        let env = att_b.receiver.recv().await.unwrap();
        let Frame::Awareness(gone) = Frame::decode(&env.bytes).unwrap() else { panic!() };
        assert!(gone.entries[0].is_removal());
        assert!(doc.collaborators().await.is_empty());
    }

    #[tokio::test]
    async fn test_awareness_foreign_id_rejected() {
        let doc = seeded_doc(None);
        let (a, _att_a) = join(&doc, Permission::Edit).await;
        let (b, _att_b) = join(&doc, Permission::Edit).await;

        let own = AwarenessUpdate::new(vec![AwarenessEntry { client_id: 1, clock: 1, state: Some(presence("Ada")) }]);
        handle_awareness(&doc, a, own).await;

        let hijack = AwarenessUpdate::new(vec![AwarenessEntry { client_id: 1, clock: 9, state: None }]);
        handle_awareness(&doc, b, hijack).await;

        assert_eq!(doc.collaborators().await[0].1.name, "Ada");
    }

    #[tokio::test]
    async fn test_awareness_saturated_clock_rejected() {
        let doc = seeded_doc(None);
        let (a, _att_a) = join(&doc, Permission::Edit).await;

        let maxed = AwarenessUpdate::new(vec![AwarenessEntry {
            client_id: 5,
            clock: u32::MAX,
            state: Some(presence("Ada")),
        }]);
        handle_awareness(&doc, a, maxed).await;
        assert!(doc.collaborators().await.is_empty());

        let own = AwarenessUpdate::new(vec![AwarenessEntry { client_id: 5, clock: u32::MAX - 1, state: Some(presence("Ada")) }]);
        handle_awareness(&doc, a, own).await;
        assert_eq!(doc.collaborators().await.len(), 1);

        let detached = doc.detach(a).await;
        assert_eq!(detached.removed, vec![5]);
        assert!(doc.collaborators().await.is_empty());
    }
}
