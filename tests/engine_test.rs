use std::collections::HashSet;
use std::io::Write;
use rand::Rng;
use rand::seq::SliceRandom;
use serde_json::json;
use tempfile::TempDir;
use typhoon::core::types::{DocId, PhraseValue};
use typhoon::{Config, Engine, Schema};

fn schema() -> Schema {
    Schema::from_settings(&json!({
        "columns": {"id": "pkey", "rank": "int", "title": "string", "note": "string,noindex"},
        "sortkeys": ["rank,desc"]
    }))
    .unwrap()
}

fn config(dir: &TempDir) -> Config {
    Config {
        page_size: 2048,
        block_size: 32,
        batch_size: 50,
        ..Config::with_path(dir.path())
    }
}

fn title(engine: &Engine, text: &str) -> PhraseValue {
    let column = engine.schema().column("title").unwrap();
    PhraseValue::string(column.header(), text)
}

/// Ids holding `value`, across every document sector.
fn holders(engine: &Engine, value: &PhraseValue) -> HashSet<u64> {
    let tables = engine.tables();
    let last = tables.documents.heap().next().sector;
    (0..=last)
        .flat_map(|sector| tables.inverted.find(value, sector).unwrap())
        .map(|posting| tables.documents.read(posting.doc).unwrap().id.0)
        .collect()
}

#[test]
fn round_trip_in_any_insert_order() {
    let mut rng = rand::thread_rng();
    for round in 0..3 {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(config(&dir), schema()).unwrap();

        let mut ids: Vec<u64> = (0..400).collect();
        match round {
            0 => {}
            1 => ids.reverse(),
            _ => ids.shuffle(&mut rng),
        }
        for id in &ids {
            let flush = rng.gen_bool(0.1);
            engine
                .index(&json!({"id": id, "rank": id % 13, "title": format!("t{}", id % 5)}), flush)
                .unwrap();
        }
        engine.flush().unwrap();

        for id in 0..400u64 {
            let record = engine.find(id).unwrap().unwrap();
            assert_eq!(record.id, DocId(id));
            assert_eq!(record.sortkey[0], (id % 13) as u32);
        }
        assert!(engine.find(400).unwrap().is_none());
        let stats = engine.stats().unwrap();
        assert_eq!(stats.documents.units, 400);
        assert!(stats.documents.leaves > 1);
        assert!(stats.documents.max_leaf_fill <= stats.documents.data_limit);
    }
}

#[test]
fn update_keeps_the_address() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(config(&dir), schema()).unwrap();
    for id in 0..200u64 {
        engine.index(&json!({"id": id, "rank": 1, "title": "old"}), false).unwrap();
    }
    engine.flush().unwrap();

    let tables = engine.tables();
    let addr = tables.documents.find_addr(DocId(42)).unwrap().unwrap();
    let leaves = engine.stats().unwrap().documents.leaves;

    engine.index(&json!({"id": 42, "rank": 7, "title": "new"}), true).unwrap();
    assert_eq!(tables.documents.find_addr(DocId(42)).unwrap(), Some(addr));
    assert_eq!(engine.find(42).unwrap().unwrap().sortkey[0], 7);
    assert_eq!(engine.stats().unwrap().documents.leaves, leaves);

    assert!(!holders(&engine, &title(&engine, "old")).contains(&42));
    assert_eq!(holders(&engine, &title(&engine, "new")), HashSet::from([42]));

    let response = engine
        .search(&json!({"lazy_count": false, "conditions": ["title", "equal", "old"]}))
        .unwrap();
    assert_eq!(response.count, 199);
}

#[test]
fn phrases_are_stored_once() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(config(&dir), schema()).unwrap();
    engine.index(&json!({"id": 1, "title": ["same", "same"]}), false).unwrap();
    engine.index(&json!({"id": 2, "title": "same"}), true).unwrap();
    let tables = engine.tables();
    let value = title(&engine, "same");
    let addr = tables.phrases.find_addr(&value).unwrap().unwrap();

    engine.index(&json!({"id": 3, "title": "same"}), true).unwrap();
    assert_eq!(tables.phrases.find_addr(&value).unwrap(), Some(addr));
    let stored = tables.phrases.values().unwrap();
    assert_eq!(stored.iter().filter(|v| **v == value).count(), 1);
}

#[test]
fn forward_and_inverted_agree() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(config(&dir), schema()).unwrap();
    engine.index(&json!({"id": 9, "title": ["p1", "p2", "p3"]}), true).unwrap();

    let tables = engine.tables();
    let doc = tables.documents.find_addr(DocId(9)).unwrap().unwrap();
    let forward: HashSet<PhraseValue> = tables
        .forward
        .find(doc)
        .unwrap()
        .into_iter()
        .map(|addr| tables.phrases.read(addr).unwrap())
        .collect();
    let expected: HashSet<PhraseValue> = ["p1", "p2", "p3"].iter().map(|t| title(&engine, t)).collect();
    assert_eq!(forward, expected);
    assert!(holders(&engine, &title(&engine, "p1")).contains(&9));

    engine.index(&json!({"id": 9, "title": ["p1", "p4"]}), true).unwrap();
    assert!(!holders(&engine, &title(&engine, "p2")).contains(&9));
    assert!(holders(&engine, &title(&engine, "p1")).contains(&9));
    assert!(holders(&engine, &title(&engine, "p4")).contains(&9));
    assert_eq!(tables.forward.find(doc).unwrap().len(), 2);
}

#[test]
fn pending_documents_wait_for_flush() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(config(&dir), schema()).unwrap();
    engine.index(&json!({"id": 5, "title": "later"}), false).unwrap();
    assert!(engine.find(5).unwrap().is_none());
    assert_eq!(engine.stats().unwrap().pending, 1);
    assert_eq!(engine.flush().unwrap(), 1);
    assert!(engine.find(5).unwrap().is_some());
}

#[test]
fn unknown_and_unindexed_attributes() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(config(&dir), schema()).unwrap();
    engine
        .index(&json!({"id": 1, "color": ["red", "blue"], "note": "private"}), true)
        .unwrap();

    let ids = |conditions| {
        engine
            .search(&json!({"lazy_count": false, "conditions": conditions}))
            .unwrap()
            .result
    };
    assert_eq!(ids(json!(["color", "equal", "blue"])), vec![1]);
    assert!(ids(json!(["color", "equal", "green"])).is_empty());
    assert!(ids(json!(["note", "equal", "private"])).is_empty());
}

#[test]
fn reopen_keeps_the_index() {
    let dir = tempfile::tempdir().unwrap();
    {
        let engine = Engine::open(config(&dir), schema()).unwrap();
        for id in 0..120u64 {
            engine.index(&json!({"id": id, "rank": id % 4, "title": "kept"}), false).unwrap();
        }
        engine.close().unwrap();
    }

    let engine = Engine::reopen(config(&dir)).unwrap();
    assert_eq!(engine.schema().as_ref(), &schema());
    assert_eq!(engine.find(77).unwrap().unwrap().sortkey[0], 3);
    let response = engine
        .search(&json!({"limit": 3, "lazy_count": false, "conditions": ["title", "equal", "kept"]}))
        .unwrap();
    assert_eq!(response.count, 120);
    assert_eq!(response.result, vec![119, 115, 111]);

    engine.index(&json!({"id": 500, "rank": 3, "title": "kept"}), true).unwrap();
    drop(engine);
    let engine = Engine::reopen(config(&dir)).unwrap();
    assert!(engine.find(500).unwrap().is_some());
}

#[test]
fn reopen_rejects_a_different_schema() {
    let dir = tempfile::tempdir().unwrap();
    Engine::open(config(&dir), schema()).unwrap().close().unwrap();
    let other = Schema::from_settings(&json!({"columns": {"id": "pkey", "body": "fulltext"}})).unwrap();
    assert!(Engine::open(config(&dir), other).is_err());
    assert!(Engine::reopen(Config::with_path(dir.path().join("missing"))).is_err());
}

#[test]
fn import_json_lines() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(config(&dir), schema()).unwrap();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    for id in 0..130u64 {
        writeln!(file, "{}", json!({"id": id, "rank": id % 3, "title": "bulk"})).unwrap();
    }
    writeln!(file).unwrap();
    writeln!(file, "{}", json!({"command": "index", "data": {"id": 1000, "title": "bulk"}})).unwrap();
    writeln!(file, "not json").unwrap();
    file.flush().unwrap();

    assert_eq!(engine.import_file(file.path()).unwrap(), 131);
    let response = engine
        .search(&json!({"lazy_count": false, "conditions": ["title", "equal", "bulk"]}))
        .unwrap();
    assert_eq!(response.count, 131);
}

#[test]
fn many_sectors() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config { block_size: 4, ..config(&dir) };
    let engine = Engine::open(config, schema()).unwrap();
    for id in 0..300u64 {
        engine
            .index(&json!({"id": id, "rank": id % 6, "title": ["all", format!("g{}", id % 3)]}), id % 25 == 0)
            .unwrap();
    }
    engine.flush().unwrap();
    assert!(engine.tables().documents.heap().next().sector > 0);

    let response = engine
        .search(&json!({"limit": 1000, "lazy_count": false, "conditions": ["title", "equal", "all"]}))
        .unwrap();
    assert_eq!(response.count, 300);
    for pair in response.result.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        assert!(a % 6 > b % 6 || (a % 6 == b % 6 && a > b));
    }
    let g1 = engine
        .search(&json!({"limit": 1000, "lazy_count": false, "conditions": [["title", "equal", "all"], ["title", "equal", "g1"]]}))
        .unwrap();
    assert_eq!(g1.count, 100);
}

#[test]
fn wide_primary_keys_stay_distinct() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(config(&dir), schema()).unwrap();
    engine.index(&json!({"id": 1, "rank": 1, "title": "small"}), false).unwrap();
    engine.index(&json!({"id": 4_294_967_297u64, "rank": 2, "title": "wide"}), true).unwrap();

    assert_eq!(engine.find(1).unwrap().unwrap().sortkey[0], 1);
    assert_eq!(engine.find(4_294_967_297).unwrap().unwrap().sortkey[0], 2);
    let response = engine
        .search(&json!({"lazy_count": false, "conditions": ["title", "equal", "small"]}))
        .unwrap();
    assert_eq!(response.result, vec![1]);

    let reply = engine.handle_request(r#"{"command":"index","data":{"id":-5,"title":"neg"}}"#);
    assert!(reply.contains(r#""error":true"#));
}
