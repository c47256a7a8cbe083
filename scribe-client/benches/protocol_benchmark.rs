use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

use scribe_client::protocol::{
    decode, CreateData, Message, OperationData, OperationMessage, SubscribeMessage,
    JSON0_TYPE_URL,
};
use scribe_client::scribe_ot::JsonOp;

fn update_frame() -> Message {
    Message::Operation(OperationMessage {
        collection: "examples".into(),
        document: "counter".into(),
        source: Some("c1".into()),
        sequence: 1,
        version: Some(3),
        data: Some(OperationData::Update(vec![JsonOp::object_replace(
            vec!["numClicks".into()],
            json!(6),
            json!(5),
        )])),
    })
}

fn bench_op_encode(c: &mut Criterion) {
    let msg = update_frame();
    c.bench_function("op_frame_encode", |b| {
        b.iter(|| black_box(&msg).encode().unwrap())
    });
}

fn bench_op_decode(c: &mut Criterion) {
    let text = update_frame().encode().unwrap();
    c.bench_function("op_frame_decode", |b| {
        b.iter(|| decode(black_box(&text)).unwrap())
    });
}

fn bench_create_roundtrip(c: &mut Criterion) {
    let msg = Message::Operation(OperationMessage {
        collection: "examples".into(),
        document: "counter".into(),
        source: Some("c1".into()),
        sequence: 1,
        version: Some(0),
        data: Some(OperationData::Create(CreateData {
            type_url: Some(JSON0_TYPE_URL.into()),
            data: json!({"numClicks": 0, "tags": ["a", "b"]}),
        })),
    });
    c.bench_function("create_frame_roundtrip", |b| {
        b.iter(|| {
            let text = msg.encode().unwrap();
            black_box(decode(&text).unwrap());
        })
    });
}

fn bench_subscribe_decode(c: &mut Criterion) {
    let msg = Message::Subscribe(SubscribeMessage {
        collection: "examples".into(),
        document: "counter".into(),
        version: None,
        data: None,
    });
    let text = msg.encode().unwrap();
    c.bench_function("subscribe_frame_decode", |b| {
        b.iter(|| decode(black_box(&text)).unwrap())
    });
}

criterion_group!(
    benches,
    bench_op_encode,
    bench_op_decode,
    bench_create_roundtrip,
    bench_subscribe_decode
);
criterion_main!(benches);
