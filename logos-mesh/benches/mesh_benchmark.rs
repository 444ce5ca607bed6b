use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use logos_mesh::protocol::{
    decode, decode_frame, encode_frame, ControlMessage, EncodePool, FrameClass, HlcTimestamp,
    OpPacket, SignalEnvelope, SignalMessage, WirePacket,
};
use logos_mesh::queue::{OfflineQueue, QueueEntry};
use logos_mesh::storage::{decode_queue, encode_queue};
use logos_mesh::sync_core::{LwwMap, SyncCore};

fn op_packet() -> WirePacket {
    let ts = HlcTimestamp::new(1_700_000_000_000, 3, 42);
    let mut op = OpPacket::set("layers/42/transform", vec![7u8; 64], ts);
    op.actor = Some("peer-a".into());
    op.seq = 1;
    WirePacket::Op(op)
}

fn queue_entries(n: usize) -> Vec<QueueEntry> {
    (0..n)
        .map(|i| {
            let ts = HlcTimestamp::new(1_700_000_000_000 + i as u64, 0, 1);
            let packet = WirePacket::Op(OpPacket::set(format!("k{i}"), vec![1u8; 32], ts));
            QueueEntry {
                key: format!("k{i}"),
                value: vec![1u8; 32],
                timestamp: ts,
                packet: packet.encode(),
            }
        })
        .collect()
}

fn bench_op_encode(c: &mut Criterion) {
    let packet = op_packet();
    c.bench_function("op_encode_64B", |b| {
        b.iter(|| black_box(black_box(&packet).encode()))
    });
}

fn bench_op_encode_pooled(c: &mut Criterion) {
    let packet = op_packet();
    let mut pool = EncodePool::default();
    c.bench_function("op_encode_pooled_64B", |b| {
        b.iter(|| black_box(pool.encode(black_box(&packet)).len()))
    });
}

fn bench_op_decode(c: &mut Criterion) {
    let bytes = op_packet().encode();
    c.bench_function("op_decode_64B", |b| {
        b.iter(|| black_box(decode(black_box(&bytes)).unwrap()))
    });
}

fn bench_signal_frame(c: &mut Criterion) {
    let env = SignalEnvelope::new(
        "peer-b",
        "peer-a",
        SignalMessage::Candidate {
            candidate: "candidate:1 1 udp 2122260223 192.168.1.7 54321 typ host".into(),
        },
    );
    c.bench_function("signal_fast_path_frame", |b| {
        b.iter(|| {
            let frame = encode_frame(FrameClass::Signal, &env.encode_body());
            let (_, payload) = decode_frame(&frame).unwrap();
            black_box(SignalEnvelope::decode_body(payload).unwrap());
        })
    });
}

fn bench_control_parse(c: &mut Criterion) {
    let text = r#"{"type":"presence","action":"join","peerId":"peer-b","userId":"bob","state":{"cursor":[10,20]}}"#;
    c.bench_function("control_text_parse", |b| {
        b.iter(|| black_box(ControlMessage::parse(black_box(text)).unwrap()))
    });
}

fn bench_queue_flush_1000(c: &mut Criterion) {
    let entries = queue_entries(1000);
    c.bench_function("offline_queue_flush_1000", |b| {
        b.iter(|| {
            let mut queue = OfflineQueue::new(1000);
            for entry in entries.iter().cloned() {
                queue.enqueue(entry);
            }
            let mut bytes = 0usize;
            let report = queue.flush(|e| {
                bytes += e.packet.len();
                Ok(())
            });
            black_box((report, bytes));
        })
    });
}

fn bench_queue_snapshot_codec(c: &mut Criterion) {
    let entries = queue_entries(1000);
    let encoded = encode_queue(&entries).unwrap();
    c.bench_function("queue_snapshot_encode_1000", |b| {
        b.iter(|| black_box(encode_queue(black_box(&entries)).unwrap()))
    });
    c.bench_function("queue_snapshot_decode_1000", |b| {
        b.iter(|| black_box(decode_queue(black_box(&encoded)).unwrap()))
    });
}

fn bench_lww_merge(c: &mut Criterion) {
    let packets: Vec<WirePacket> = (0..1000)
        .map(|i| {
            let ts = HlcTimestamp::new(1_700_000_000_000 + i, 0, 2);
            WirePacket::Op(OpPacket::set(format!("k{}", i % 100), vec![0u8; 16], ts))
        })
        .collect();
    c.bench_function("lww_merge_1000_ops", |b| {
        b.iter(|| {
            let mut map = LwwMap::new();
            for p in &packets {
                black_box(map.merge_remote(p).unwrap());
            }
        })
    });
}

criterion_group!(
    benches,
    bench_op_encode,
    bench_op_encode_pooled,
    bench_op_decode,
    bench_signal_frame,
    bench_control_parse,
    bench_queue_flush_1000,
    bench_queue_snapshot_codec,
    bench_lww_merge,
);
criterion_main!(benches);
