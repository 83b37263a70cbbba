use std::cmp::Ordering;
use std::sync::Arc;
use serde_json::{Value, json};
use tempfile::TempDir;
use typhoon::core::types::PhraseValue;
use typhoon::query::LeafSource;
use typhoon::search::SearchResponse;
use typhoon::search::cursor::{LeafCursor, SearchContext};
use typhoon::{Config, Engine, ErrorKind, Schema};

const DOCS: u64 = 1000;

/// Phrase `p{n:06}`.
fn p(n: u64) -> String {
    format!("p{:06}", n)
}

/// Every document carries its `id % 10`, `id % 7`, `id % 15` tags, a block of
/// twenty phrases unique to it and one phrase shared by all.
fn titles(id: u64) -> Vec<String> {
    let mut titles = vec![p(id % 10), p(id % 7 + 10), p(id % 15 + 20)];
    titles.extend((70..90).map(|j| p(id * 100 + j)));
    titles.push(p(99));
    titles
}

fn sample_engine() -> (TempDir, Engine) {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        page_size: 4096,
        block_size: 256,
        batch_size: 250,
        ..Config::with_path(dir.path())
    };
    let schema = Schema::from_settings(&json!({
        "columns": {"id": "pkey", "rank": "int", "title": "string"},
        "sortkeys": ["rank"]
    }))
    .unwrap();
    let engine = Engine::open(config, schema).unwrap();
    for id in 0..DOCS {
        engine
            .index(&json!({"id": id, "rank": id % 10, "title": titles(id)}), false)
            .unwrap();
    }
    engine.flush().unwrap();
    (dir, engine)
}

fn search(engine: &Engine, request: Value) -> SearchResponse {
    engine.search(&request).unwrap()
}

fn exact(conditions: Value) -> Value {
    json!({"offset": 0, "limit": 3000, "lazy_count": false, "conditions": conditions})
}

/// Results come by ascending rank, then descending id.
fn assert_result_order(ids: &[u64]) {
    for pair in ids.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        assert!(a % 10 < b % 10 || (a % 10 == b % 10 && a > b), "{} before {}", a, b);
    }
}

#[test]
fn empty_requests_match_nothing() {
    let (_dir, engine) = sample_engine();
    assert_eq!(search(&engine, json!({})), SearchResponse::empty());
    assert_eq!(search(&engine, json!({"offset": 0, "limit": 10, "conditions": []})), SearchResponse::empty());
}

#[test]
fn single_condition() {
    let (_dir, engine) = sample_engine();
    let response = search(
        &engine,
        json!({"offset": 0, "limit": 10, "lazy_count": false, "conditions": ["title", "equal", p(99)]}),
    );
    assert_eq!(response.count, DOCS as usize);
    assert_eq!(response.result.len(), 10);
    assert_eq!(response.result, vec![990, 980, 970, 960, 950, 940, 930, 920, 910, 900]);
}

#[test]
fn unknown_attribute_matches_nothing() {
    let (_dir, engine) = sample_engine();
    let response = search(&engine, exact(json!(["unknown", "equal", p(99)])));
    assert_eq!(response.count, 0);
    assert!(response.result.is_empty());
}

#[test]
fn and_is_the_intersection() {
    let (_dir, engine) = sample_engine();
    let response = search(
        &engine,
        exact(json!([["title", "equal", p(99)], ["title", "equal", p(0)], ["title", "equal", p(10)]])),
    );
    let expected = (0..DOCS).filter(|id| id % 70 == 0).count();
    assert_eq!(response.count, expected);
    assert_eq!(response.result.len(), expected);
    assert!(response.result.iter().all(|id| id % 70 == 0));
    assert_result_order(&response.result);
}

#[test]
fn or_is_the_deduplicated_union() {
    let (_dir, engine) = sample_engine();
    let response = search(
        &engine,
        exact(json!([[["title", "equal", p(1)], ["title", "equal", p(2)], ["title", "equal", p(3)]]])),
    );
    assert_eq!(response.count, 300);
    assert_eq!(response.result.len(), 300);
    assert!(response.result.iter().all(|id| matches!(id % 10, 1..=3)));
    assert_result_order(&response.result);

    let both = search(&engine, exact(json!([[["title", "equal", p(1)], ["title", "equal", p(99)]]])));
    assert_eq!(both.count, DOCS as usize);
}

#[test]
fn and_over_or() {
    let (_dir, engine) = sample_engine();
    let response = search(
        &engine,
        exact(json!([
            ["title", "equal", p(0)],
            [["title", "equal", p(10)], ["title", "equal", p(11)], ["title", "equal", p(12)]]
        ])),
    );
    let expected: Vec<u64> = (0..DOCS).filter(|id| id % 10 == 0 && id % 7 <= 2).collect();
    assert_eq!(response.count, expected.len());
    let mut got = response.result.clone();
    got.sort_unstable();
    assert_eq!(got, expected);
}

#[test]
fn prefix_search() {
    let (_dir, engine) = sample_engine();
    let response = search(&engine, exact(json!([["title", "prefix", "p075"]])));
    assert_eq!(response.count, 10);
    let mut got = response.result.clone();
    assert_result_order(&got);
    got.sort_unstable();
    assert_eq!(got, (750..760).collect::<Vec<u64>>());
}

#[test]
fn range_search() {
    let (_dir, engine) = sample_engine();
    let response = search(&engine, exact(json!([["title", "between", "p035000", "p036000"]])));
    assert_eq!(response.count, 10);
    let mut got = response.result.clone();
    got.sort_unstable();
    assert_eq!(got, (350..360).collect::<Vec<u64>>());
}

#[test]
fn integer_attribute_search() {
    let (_dir, engine) = sample_engine();
    let response = search(&engine, exact(json!(["rank", "equal", 4])));
    assert_eq!(response.count, 100);
    assert!(response.result.iter().all(|id| id % 10 == 4));

    let range = search(&engine, exact(json!(["rank", "between", 8, 9])));
    assert_eq!(range.count, 200);
}

#[test]
fn offset_and_limit_page_through_results() {
    let (_dir, engine) = sample_engine();
    let all = search(&engine, exact(json!(["title", "equal", p(5)]))).result;
    let page = search(
        &engine,
        json!({"offset": 20, "limit": 15, "lazy_count": false, "conditions": ["title", "equal", p(5)]}),
    );
    assert_eq!(page.count, 100);
    assert_eq!(page.result, all[20..35].to_vec());
}

#[test]
fn custom_order() {
    let (_dir, engine) = sample_engine();
    let response = search(
        &engine,
        json!({"offset": 0, "limit": 5, "lazy_count": false, "conditions": ["title", "equal", p(99)], "order": ["rank,desc"]}),
    );
    assert_eq!(response.count, DOCS as usize);
    assert_eq!(response.result, vec![999, 989, 979, 969, 959]);

    let err = engine
        .search(&json!({"conditions": ["title", "equal", p(99)], "order": ["title"]}))
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidRequest);
    assert!(err.context.starts_with("failed to parse request"));
}

#[test]
fn lazy_count() {
    let (_dir, engine) = sample_engine();
    let small = search(
        &engine,
        json!({"offset": 0, "limit": 10, "conditions": ["title", "equal", p(1)]}),
    );
    assert_eq!(small.count, 100);

    let large = search(
        &engine,
        json!({"offset": 0, "limit": 10, "conditions": ["title", "equal", p(99)]}),
    );
    assert_eq!(large.result.len(), 10);
    assert!(large.count >= large.result.len());
}

#[test]
fn phrase_adjacency() {
    let dir = tempfile::tempdir().unwrap();
    let schema = Schema::from_settings(&json!({
        "columns": {"id": "pkey", "body": "fulltext"}
    }))
    .unwrap();
    let config = Config { page_size: 4096, block_size: 32, ..Config::with_path(dir.path()) };
    let engine = Engine::open(config, schema).unwrap();
    engine.index(&json!({"id": 1, "body": "aaa bbb ccc"}), true).unwrap();
    engine.index(&json!({"id": 2, "body": "aaa ccc bbb"}), true).unwrap();

    let ids = |text: &str| search(&engine, exact(json!(["body", "equal", text]))).result;
    assert_eq!(ids("aaa bbb"), vec![1]);
    assert!(ids("bbb aaa").is_empty());
    assert_eq!(ids("bbb ccc"), vec![1]);
    assert_eq!(ids("ccc bbb"), vec![2]);
    assert_eq!(ids("aaa, bbb"), vec![2, 1]);
    assert_eq!(ids("AAA BBB"), vec![1]);
}

#[test]
fn prefix_over_sequential_phrases() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config { page_size: 4096, block_size: 64, batch_size: 200, ..Config::with_path(dir.path()) };
    let schema = Schema::from_settings(&json!({"columns": {"id": "pkey", "title": "string"}})).unwrap();
    let engine = Engine::open(config, schema).unwrap();
    for id in 0..1000u64 {
        engine.index(&json!({"id": id, "title": p(id)}), false).unwrap();
    }
    engine.flush().unwrap();

    let sorted = |request| {
        let mut ids = search(&engine, request).result;
        ids.sort_unstable();
        ids
    };
    assert_eq!(sorted(exact(json!(["title", "prefix", "p00075"]))), (750..760).collect::<Vec<u64>>());
    assert_eq!(sorted(exact(json!(["title", "between", "p000350", "p000359"]))), (350..360).collect::<Vec<u64>>());
    assert_eq!(sorted(exact(json!(["title", "prefix", "p0009"]))), (900..1000).collect::<Vec<u64>>());
}

#[test]
fn phrase_after_a_loose_word() {
    let dir = tempfile::tempdir().unwrap();
    let schema = Schema::from_settings(&json!({"columns": {"id": "pkey", "body": "fulltext"}})).unwrap();
    let config = Config { page_size: 4096, block_size: 32, ..Config::with_path(dir.path()) };
    let engine = Engine::open(config, schema).unwrap();
    engine.index(&json!({"id": 1, "body": "bbb aaa, bbb ccc"}), false).unwrap();
    engine.index(&json!({"id": 2, "body": "ccc bbb aaa"}), false).unwrap();
    engine.index(&json!({"id": 3, "body": "aaa bbb ccc"}), true).unwrap();

    let ids = |text: &str| search(&engine, exact(json!(["body", "equal", text]))).result;
    assert_eq!(ids("aaa, bbb ccc"), vec![3, 1]);
    assert_eq!(ids("bbb ccc"), vec![3, 1]);
}

#[test]
fn prefix_leaf_merges_phrases_in_order() {
    let (_dir, engine) = sample_engine();
    let tables = engine.tables();
    let ctx = SearchContext {
        inverted: Arc::clone(&tables.inverted),
        documents: Arc::clone(tables.documents.heap()),
        schema: Arc::clone(engine.schema()),
        order: Vec::new(),
    };
    let header = engine.schema().column("title").unwrap().header();
    let leaf = LeafSource::Prefix(PhraseValue::string(header, "p0000"));
    let mut cursor = LeafCursor::open(&leaf, &ctx).unwrap();

    let first = cursor.next(&ctx).unwrap().unwrap();
    let (total, current) = cursor.progress();
    assert!(current < total);

    // every title phrase sits at position 0, so each document comes once
    let mut hits = vec![first];
    while let Some(hit) = cursor.next(&ctx).unwrap() {
        hits.push(hit);
    }
    assert_eq!(hits.len(), DOCS as usize);
    assert!(hits.windows(2).all(|pair| pair[0].strong_cmp(&pair[1]) == Ordering::Less));
    let ids: Vec<u64> = hits.iter().map(|h| h.id.0).collect();
    assert_result_order(&ids);

    let lazy = search(&engine, json!({"limit": 10, "conditions": ["title", "prefix", "p0000"]}));
    assert_eq!(lazy.result, ids[..10].to_vec());
    assert!(lazy.count >= 10);
}
