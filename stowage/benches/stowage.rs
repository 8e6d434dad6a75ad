use anyhow::Result;

use stowage::io::MemoryContainer;
use stowage::types::{InlinePolicy, PrimitiveKind, RecordType, SourceType, TypeTable, Value};
use stowage::Stowage;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::Rng;

const TEST_FILE: &str = "bench.stw";

// Utility function for building a type table with the benchmarked types
fn types() -> (TypeTable, SourceType, SourceType) {
    let mut types = TypeTable::new();
    let point = types.register_record(
        RecordType::immutable("bench::Point")
            .field("x", PrimitiveKind::Float64)
            .field("y", PrimitiveKind::Float64),
    );
    let cell = types.register_record(
        RecordType::mutable("bench::Cell")
            .field("label", SourceType::ByteString)
            .field("next", SourceType::Any),
    );
    (types, point, cell)
}

// Utility function for creating an array of random points
fn points(point: &SourceType, len: usize) -> Result<Value> {
    let mut rng = rand::thread_rng();
    let items = (0..len)
        .map(|_| {
            Value::record(
                point,
                vec![
                    Some(Value::Float64(rng.gen_range(-1.0..1.0))),
                    Some(Value::Float64(rng.gen_range(-1.0..1.0))),
                ],
            )
        })
        .collect::<Result<Vec<Value>>>()?;
    Ok(Value::array(point.clone(), items))
}

// Utility function for creating a linked chain of cells
fn chain(cell: &SourceType, len: usize) -> Result<Value> {
    let mut next = None;
    for index in 0..len {
        next = Some(Value::record(
            cell,
            vec![Some(Value::string(&format!("cell {index}"))), next],
        )?);
    }
    Ok(next.unwrap_or(Value::Bool(false)))
}

fn stowage_write(c: &mut Criterion) {
    let (types, point, cell) = types();
    let mut store: Stowage<MemoryContainer> =
        Stowage::in_memory(types, InlinePolicy::default()).expect("create store");

    let mut group = c.benchmark_group("write");
    for size in [64, 256, 1024, 4096].iter() {
        let array = points(&point, *size).expect("build points");
        group.bench_with_input(BenchmarkId::new("points", size), &array, |b, array| {
            b.iter(|| store.write("points", array).expect("write points"))
        });
        let linked = chain(&cell, *size).expect("build chain");
        group.bench_with_input(BenchmarkId::new("chain", size), &linked, |b, linked| {
            b.iter(|| store.write("chain", linked).expect("write chain"))
        });
    }
}

fn stowage_read(c: &mut Criterion) {
    let (types, point, cell) = types();
    let mut store: Stowage<MemoryContainer> =
        Stowage::in_memory(types, InlinePolicy::default()).expect("create store");

    let mut group = c.benchmark_group("read");
    for size in [64, 256, 1024, 4096].iter() {
        let points_name = format!("points{size}");
        let chain_name = format!("chain{size}");
        store
            .write(&points_name, &points(&point, *size).expect("build points"))
            .expect("write points");
        store
            .write(&chain_name, &chain(&cell, *size).expect("build chain"))
            .expect("write chain");
        group.bench_with_input(BenchmarkId::new("points", size), &points_name, |b, name| {
            b.iter(|| store.read(name).expect("read points"))
        });
        group.bench_with_input(BenchmarkId::new("chain", size), &chain_name, |b, name| {
            b.iter(|| store.read(name).expect("read chain"))
        });
    }
}

fn stowage_open(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let (types, point, cell) = types();
        let mut store = Stowage::try_new(TEST_FILE, types, InlinePolicy::default()).await?;
        store.write("points", &points(&point, 4096)?)?;
        store.write("chain", &chain(&cell, 1024)?)?;
        store.flush_to_disk().await
    })
    .expect("task spawn failed");

    let mut group = c.benchmark_group("open");
    group.bench_function("open and read", |b| {
        b.to_async(tokio::runtime::Runtime::new().expect("build tokio runtime"))
            .iter(|| async {
                let mut store =
                    Stowage::try_open(TEST_FILE, TypeTable::new(), InlinePolicy::default())
                        .await
                        .expect("open store");
                let _ = store.read("points");
            })
    });
    group.finish();
    let _ = std::fs::remove_file(TEST_FILE);
}

criterion_group!(benches, stowage_write, stowage_read, stowage_open);
criterion_main!(benches);
