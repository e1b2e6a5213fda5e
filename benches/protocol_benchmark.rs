//! Benchmarks for wire-format encoding and decoding.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use multirunner::protocol::{self, Diagnostic, TaskResult};
use serde_json::{Value, json};

/// An item with `fields` string keys, roughly the shape of a data record.
fn make_item(fields: usize) -> Value {
    let map = (0..fields)
        .map(|i| (format!("field{}", i), json!(format!("value-{}", i))))
        .collect::<serde_json::Map<_, _>>();
    Value::Object(map)
}

fn bench_result_lines(c: &mut Criterion) {
    let mut group = c.benchmark_group("task_result");

    for fields in [1, 16, 256].iter() {
        let result = TaskResult::new(
            make_item(*fields),
            0,
            "x".repeat(*fields * 8),
            String::new(),
        );
        let line = result.to_line();

        group.bench_with_input(BenchmarkId::new("to_line", fields), fields, |b, _| {
            b.iter(|| black_box(result.to_line()));
        });
        group.bench_with_input(BenchmarkId::new("from_line", fields), fields, |b, _| {
            b.iter(|| black_box(TaskResult::from_line(black_box(&line))));
        });
    }

    group.finish();
}

fn bench_encode_item(c: &mut Criterion) {
    let item = make_item(64);
    c.bench_function("encode_item", |b| {
        b.iter(|| black_box(protocol::encode_item(black_box(&item))))
    });
}

fn bench_coerce_exit(c: &mut Criterion) {
    let mut group = c.benchmark_group("coerce_exit");

    let cases = [
        ("integer", json!(3)),
        ("float", json!(2.9)),
        ("string", json!("not a number")),
        ("object", json!({"exit": 1})),
    ];
    for (name, value) in cases.iter() {
        group.bench_function(*name, |b| {
            b.iter(|| black_box(protocol::coerce_exit(black_box(value))))
        });
    }

    group.finish();
}

fn bench_diagnostic_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("diagnostic_from_line");

    let reported = r#"{"stack":"Traceback (most recent call last):\n  File \"<job>\", line 1\nNameError: name 'x' is not defined","when":"loading module"}"#;
    let raw = "Segmentation fault (core dumped)";

    group.bench_function("reported", |b| {
        b.iter(|| black_box(Diagnostic::from_line(black_box(reported))))
    });
    group.bench_function("raw", |b| {
        b.iter(|| black_box(Diagnostic::from_line(black_box(raw))))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_result_lines,
    bench_encode_item,
    bench_coerce_exit,
    bench_diagnostic_parse
);
criterion_main!(benches);
