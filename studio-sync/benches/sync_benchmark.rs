use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use studio_sync::awareness::{AwarenessEntry, PresenceState, UserPresence};
use studio_sync::broadcast::{BroadcastGroup, Outbound};
use studio_sync::document::{Actor, Document, Op};
use studio_sync::model::{MixerPatch, NewRegion, NewTrack};
use studio_sync::protocol::{Frame, JoinInfo};
use studio_sync::{Awareness, AwarenessUpdate, DeviceClass, OfflineQueue};

fn seeded_document(tracks: usize, regions_per_track: usize) -> Document {
    let actor = Actor::new("alice", "Alice");
    let mut doc = Document::new(Uuid::new_v4());
    for t in 0..tracks {
        let id = format!("t{t}");
        doc.apply_local(Op::AddTrack(NewTrack::named(format!("Track {t}")).with_id(&id)), &actor)
            .unwrap();
        for r in 0..regions_per_track {
            let start = r as f64 * 4.0;
            doc.apply_local(
                Op::AddRegion {
                    track_id: id.clone(),
                    region: NewRegion::span(start, start + 2.0),
                },
                &actor,
            )
            .unwrap();
        }
    }
    doc
}

fn bench_local_edit(c: &mut Criterion) {
    let actor = Actor::new("alice", "Alice");
    let mut doc = seeded_document(16, 0);

    c.bench_function("mixer_edit_encode", |b| {
        b.iter(|| {
            let applied = doc
                .apply_local(
                    Op::UpdateMixer {
                        track_id: "t3".into(),
                        patch: MixerPatch::volume(black_box(0.5)),
                    },
                    &actor,
                )
                .unwrap();
            black_box(applied.encode().unwrap());
        })
    });
}

fn bench_frame_roundtrip(c: &mut Criterion) {
    let actor = Actor::new("alice", "Alice");
    let mut doc = seeded_document(1, 0);
    let update = doc
        .apply_local(
            Op::UpdateMixer {
                track_id: "t0".into(),
                patch: MixerPatch::volume(0.5),
            },
            &actor,
        )
        .unwrap()
        .encode()
        .unwrap();
    let client = Uuid::new_v4();

    c.bench_function("update_frame_roundtrip", |b| {
        b.iter(|| {
            let bytes = Frame::update(client, 42, black_box(update.clone())).encode().unwrap();
            black_box(Frame::decode(&bytes).unwrap());
        })
    });
}

fn bench_remote_merge(c: &mut Criterion) {
    let source = seeded_document(32, 16);
    let snapshot = source.snapshot().unwrap();
    println!("snapshot: 32 tracks x 16 regions = {} bytes", snapshot.len());

    c.bench_function("merge_snapshot_32x16", |b| {
        b.iter(|| {
            let mut replica = Document::new(Uuid::new_v4());
            black_box(replica.apply_remote(black_box(&snapshot)).unwrap());
        })
    });

    let mut warm = Document::new(Uuid::new_v4());
    warm.apply_remote(&snapshot).unwrap();
    c.bench_function("merge_snapshot_duplicate", |b| {
        b.iter(|| {
            black_box(warm.apply_remote(black_box(&snapshot)).unwrap());
        })
    });
}

fn bench_timeline_view(c: &mut Criterion) {
    let doc = seeded_document(32, 16);
    c.bench_function("timeline_view_32x16", |b| {
        b.iter(|| black_box(doc.timeline()))
    });
}

fn bench_awareness_apply(c: &mut Criterion) {
    let remote = Awareness::new(Uuid::new_v4(), "bob", "Bob", DeviceClass::Desktop);
    let user: UserPresence = remote.local_state().user.clone();
    let now = Instant::now();

    c.bench_function("awareness_apply_50_peers", |b| {
        b.iter(|| {
            let mut local = Awareness::new(Uuid::new_v4(), "alice", "Alice", DeviceClass::Desktop);
            let update = AwarenessUpdate {
                entries: (0..50u128)
                    .map(|n| AwarenessEntry {
                        client_id: Uuid::from_u128(n + 1),
                        clock: 1,
                        state: Some(PresenceState { user: user.clone() }),
                    })
                    .collect(),
            };
            black_box(local.apply_update(update, now));
        })
    });
}

fn bench_offline_queue(c: &mut Criterion) {
    c.bench_function("offline_queue_1k_enqueue_drain", |b| {
        b.iter(|| {
            let mut queue = OfflineQueue::new(10_000);
            for i in 0..1000u64 {
                queue.enqueue(i, vec![0u8; 64]);
            }
            black_box(queue.drain());
        })
    });
}

fn bench_broadcast_fanout(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(64);
                let mut receivers = Vec::with_capacity(100);
                for n in 0..100 {
                    let info = JoinInfo {
                        room: "studio-bench".into(),
                        user_id: format!("u{n}"),
                        name: format!("User {n}"),
                    };
                    receivers.push(group.add_peer(Uuid::new_v4(), info).await);
                }
                let from = Uuid::new_v4();
                for _ in 0..10 {
                    group.broadcast(Outbound::new(from, vec![0u8; 128]));
                }
                for rx in receivers.iter_mut() {
                    while rx.try_recv().is_ok() {}
                }
            })
        })
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().measurement_time(Duration::from_secs(3));
    targets = bench_local_edit,
        bench_frame_roundtrip,
        bench_remote_merge,
        bench_timeline_view,
        bench_awareness_apply,
        bench_offline_queue,
        bench_broadcast_fanout
}
criterion_main!(benches);
