use criterion::{criterion_group, criterion_main, Criterion};
use overtex_collab::broadcast::BroadcastGroup;
use overtex_collab::presence::{Awareness, Cursor, PresenceFields, PresenceState};
use overtex_collab::protocol::{Frame, SyncMessage};
use overtex_collab::replica::{SubDocument, TextEdit};
use overtex_collab::storage::{DeltaLog, DocumentStore, StoreConfig};
use std::hint::black_box;
use std::sync::Arc;
use uuid::Uuid;

/// A sub-document holding roughly a page of LaTeX built from many edits.
fn page() -> SubDocument {
    let doc = SubDocument::new();
    for i in 0..200u32 {
        let at = doc.len();
        doc.local_edit(&TextEdit::Insert { at, text: format!("line {i} of \\emph{{text}}\n") })
            .unwrap();
    }
    doc
}

fn bench_update_encode(c: &mut Criterion) {
    let frame = Frame::Sync(SyncMessage::update("main.tex", vec![0u8; 64]));

    c.bench_function("update_encode_64B", |b| {
        b.iter(|| black_box(black_box(&frame).encode().unwrap()))
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let encoded = Frame::Sync(SyncMessage::update("main.tex", vec![0u8; 64])).encode().unwrap();

    c.bench_function("update_decode_64B", |b| {
        b.iter(|| black_box(Frame::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_awareness_encode(c: &mut Criterion) {
    let mut awareness = Awareness::new();
    for id in 0..20u64 {
        let fields = PresenceFields {
            name: format!("User{id}"),
            active_file: Some("main.tex".to_string()),
            cursor: Some(Cursor::caret(id as u32 * 10)),
            ..PresenceFields::default()
        };
        awareness.set_local(id, PresenceState::from_fields(id, fields));
    }
    let frame = Frame::Awareness(awareness.snapshot());

    c.bench_function("awareness_encode_20_entries", |b| {
        b.iter(|| black_box(black_box(&frame).encode().unwrap()))
    });
}

fn bench_local_edit(c: &mut Criterion) {
    let doc = page();

    c.bench_function("local_edit_insert", |b| {
        b.iter(|| {
            let delta = doc.local_edit(&TextEdit::Insert { at: 0, text: "x".to_string() }).unwrap();
            black_box(delta);
        })
    });
}

fn bench_diff_empty_peer(c: &mut Criterion) {
    let doc = page();
    let empty = SubDocument::new().state_vector();

    c.bench_function("diff_since_empty_200_lines", |b| {
        b.iter(|| black_box(doc.diff_since(black_box(&empty)).unwrap()))
    });
}

fn bench_diff_caught_up_peer(c: &mut Criterion) {
    let doc = page();
    let current = doc.state_vector();

    c.bench_function("diff_since_current_200_lines", |b| {
        b.iter(|| black_box(doc.diff_since(black_box(&current)).unwrap()))
    });
}

fn bench_apply_catch_up(c: &mut Criterion) {
    let full = page().full_state();

    c.bench_function("apply_full_state_200_lines", |b| {
        b.iter(|| {
            let replica = SubDocument::new();
            replica.apply_remote_delta(black_box(&full)).unwrap();
            black_box(replica.len());
        })
    });
}

fn bench_broadcast_100_receivers(c: &mut Criterion) {
    let group = BroadcastGroup::new(1024);
    let mut receivers: Vec<_> = (0..100).map(|_| group.subscribe()).collect();
    let frame = Frame::Sync(SyncMessage::update("main.tex", vec![0u8; 64]));
    let origin = Some(Uuid::new_v4());

    c.bench_function("broadcast_100_receivers", |b| {
        b.iter(|| {
            black_box(group.broadcast(origin, black_box(&frame)).unwrap());
            for rx in &mut receivers {
                let _ = rx.try_recv();
            }
        })
    });
}

fn bench_broadcast_1000_messages(c: &mut Criterion) {
    c.bench_function("broadcast_raw_1000_msgs_100_receivers", |b| {
        b.iter(|| {
            let group = BroadcastGroup::new(2048);
            let _receivers: Vec<_> = (0..100).map(|_| group.subscribe()).collect();
            for i in 0..1000u64 {
                let data = Arc::new(vec![i as u8; 64]);
                group.broadcast_raw(None, black_box(data));
            }
        })
    });
}

fn bench_log_append(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("overtex_bench_append_{}", Uuid::new_v4()));
    let store = DocumentStore::open(StoreConfig::for_testing(&dir)).unwrap();
    let delta = vec![42u8; 256];

    c.bench_function("log_append_256B", |b| {
        b.iter(|| black_box(store.append("P1", "main.tex", black_box(&delta)).unwrap()))
    });

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}

fn bench_log_load(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("overtex_bench_load_{}", Uuid::new_v4()));
    let store = DocumentStore::open(StoreConfig::for_testing(&dir)).unwrap();
    for _ in 0..1000 {
        store.append("P1", "main.tex", &[7u8; 128]).unwrap();
    }

    c.bench_function("log_load_1000_deltas", |b| {
        b.iter(|| black_box(store.load(black_box("P1")).unwrap()))
    });

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_awareness_encode,
    bench_local_edit,
    bench_diff_empty_peer,
    bench_diff_caught_up_peer,
    bench_apply_catch_up,
    bench_broadcast_100_receivers,
    bench_broadcast_1000_messages,
    bench_log_append,
    bench_log_load,
);
criterion_main!(benches);
