use criterion::{black_box, criterion_group, criterion_main, Criterion};
use scribe_ot::{json0, JsonOp};
use serde_json::json;

fn sample_doc() -> serde_json::Value {
    json!({
        "title": "meeting notes",
        "numClicks": 0,
        "tags": ["draft", "shared"],
        "body": "The quick brown fox jumps over the lazy dog.",
    })
}

fn sample_ops() -> Vec<JsonOp> {
    vec![
        JsonOp::object_replace(vec!["numClicks".into()], json!(1), json!(0)),
        JsonOp::list_insert(vec!["tags".into(), 2.into()], json!("reviewed")),
        JsonOp::string_insert(vec!["title".into()], 0, "weekly "),
        JsonOp::number_add(vec!["numClicks".into()], 5.into()),
    ]
}

fn bench_apply(c: &mut Criterion) {
    let doc = sample_doc();
    let ops = sample_ops();

    c.bench_function("json0_apply_4_ops", |b| {
        b.iter(|| json0::apply(black_box(&doc), black_box(&ops)).unwrap())
    });
}

fn bench_invert(c: &mut Criterion) {
    let ops = sample_ops();

    c.bench_function("json0_invert_4_ops", |b| {
        b.iter(|| json0::invert(black_box(&ops)).unwrap())
    });
}

fn bench_apply_deep_list(c: &mut Criterion) {
    // 100 inserts into a growing list, the worst realistic churn shape.
    let doc = json!({"xs": []});
    let ops: Vec<JsonOp> = (0..100)
        .map(|i| JsonOp::list_insert(vec!["xs".into(), i.into()], json!(i)))
        .collect();

    c.bench_function("json0_apply_100_list_inserts", |b| {
        b.iter(|| json0::apply(black_box(&doc), black_box(&ops)).unwrap())
    });
}

fn bench_op_codec(c: &mut Criterion) {
    let op = JsonOp::object_replace(vec!["numClicks".into()], json!(6), json!(5));
    let wire = serde_json::to_string(&op).unwrap();

    c.bench_function("json0_op_encode", |b| {
        b.iter(|| serde_json::to_string(black_box(&op)).unwrap())
    });
    c.bench_function("json0_op_decode", |b| {
        b.iter(|| serde_json::from_str::<JsonOp>(black_box(&wire)).unwrap())
    });
}

criterion_group!(
    benches,
    bench_apply,
    bench_invert,
    bench_apply_deep_list,
    bench_op_codec
);
criterion_main!(benches);
