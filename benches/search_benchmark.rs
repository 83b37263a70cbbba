use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rand::Rng;
use serde_json::{Value, json};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;
use typhoon::{Config, Engine, Schema};

const WORDS: [&str; 8] = ["the", "quick", "brown", "fox", "jumps", "over", "lazy", "dog"];

fn schema() -> Schema {
    Schema::from_settings(&json!({
        "columns": {"id": "pkey", "rank": "int", "category": "string", "content": "fulltext"},
        "sortkeys": ["rank,desc"]
    }))
    .unwrap()
}

/// Helper to create test documents
fn create_test_document(id: u64, words: usize) -> Value {
    let mut rng = rand::thread_rng();
    let content: Vec<&str> = (0..words).map(|_| WORDS[rng.gen_range(0..WORDS.len())]).collect();
    json!({
        "id": id,
        "rank": rng.gen_range(0..1000),
        "category": format!("category_{}", id % 10),
        "content": content.join(" "),
    })
}

fn open_engine(batch_size: usize) -> (TempDir, Engine) {
    let dir = tempfile::tempdir().unwrap();
    let config = Config { batch_size, ..Config::with_path(dir.path()) };
    let engine = Engine::open(config, schema()).unwrap();
    (dir, engine)
}

/// Benchmark single document insertion
fn bench_single_insert(c: &mut Criterion) {
    let (_dir, engine) = open_engine(100);
    c.bench_function("single_document_insert", |b| {
        let mut id = 0;
        b.iter(|| {
            engine.index(&create_test_document(id, 50), true).unwrap();
            id += 1;
        });
    });
}

/// Benchmark batch insertion
fn bench_batch_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_insert");
    for batch_size in [10, 100, 500].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), batch_size, |b, &batch_size| {
            let (_dir, engine) = open_engine(batch_size);
            let mut id = 0u64;
            b.iter(|| {
                for _ in 0..batch_size {
                    engine.index(&create_test_document(id, 50), false).unwrap();
                    id += 1;
                }
                engine.flush().unwrap();
            });
        });
    }
    group.finish();
}

/// Benchmark search performance
fn bench_search(c: &mut Criterion) {
    let (_dir, engine) = open_engine(500);
    for id in 0..5000 {
        engine.index(&create_test_document(id, 50), false).unwrap();
    }
    engine.sync().unwrap();

    let mut group = c.benchmark_group("search");
    let cases = [
        ("category_search", json!({"conditions": ["category", "equal", "category_5"]})),
        ("phrase_search", json!({"conditions": ["content", "equal", "quick brown"]})),
        ("boolean_and_search", json!({"conditions": [["content", "equal", "fox"], ["content", "equal", "dog"]]})),
        ("boolean_or_search", json!({"conditions": [[["category", "equal", "category_1"], ["category", "equal", "category_2"]]]})),
        ("prefix_search", json!({"conditions": ["category", "prefix", "category_"]})),
        ("range_search", json!({"conditions": ["rank", "between", 100, 200]})),
        ("ordered_search", json!({"conditions": ["category", "equal", "category_3"], "order": ["rank"]})),
        ("exact_count", json!({"lazy_count": false, "conditions": ["content", "equal", "lazy"]})),
    ];
    for (name, request) in cases.iter() {
        group.bench_function(*name, |b| {
            b.iter(|| engine.search(black_box(request)).unwrap());
        });
    }
    group.finish();
}

/// Benchmark concurrent searches sharing one page cache
fn bench_concurrent_search(c: &mut Criterion) {
    let (_dir, engine) = open_engine(500);
    for id in 0..2000 {
        engine.index(&create_test_document(id, 30), false).unwrap();
    }
    engine.flush().unwrap();
    let engine = Arc::new(engine);

    c.bench_function("concurrent_search_4_threads", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let engine = Arc::clone(&engine);
                    thread::spawn(move || {
                        let request = format!(
                            r#"{{"command":"search","conditions":["category","equal","category_{}"]}}"#,
                            t
                        );
                        engine.handle_request(&request)
                    })
                })
                .collect();
            for handle in handles {
                black_box(handle.join().unwrap());
            }
        });
    });
}

criterion_group!(
    benches,
    bench_single_insert,
    bench_batch_insert,
    bench_search,
    bench_concurrent_search
);
criterion_main!(benches);
