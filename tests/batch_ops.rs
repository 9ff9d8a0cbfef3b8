//! Transactional batch integration tests: atomicity at the facade,
//! partial-failure semantics with injected WAL errors, and statistics.

use std::path::Path;

use tempfile::tempdir;
use vexdb::{
    BatchOperation, Config, PersistenceConfig, Vector, VexDB, VexDBError,
};

fn v(xs: &[f32]) -> Vector {
    Vector::from(xs.to_vec())
}

fn persistent_config(root: &Path, dimension: usize) -> Config {
    Config {
        persistence: PersistenceConfig::under(root),
        ..Config::new(dimension)
    }
}

fn keys(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

// ============================================================================
// Success paths
// ============================================================================

#[test]
fn test_batch_insert_all_commit() {
    let db = VexDB::open(Config::in_memory(2)).unwrap();
    let result = db
        .batch_insert(
            &keys(&["x", "y", "z"]),
            &[v(&[1.0, 1.0]), v(&[2.0, 2.0]), v(&[3.0, 3.0])],
            &["first".to_string()],
        )
        .unwrap();

    assert!(result.success);
    assert_eq!(result.operations_committed, 3);
    assert!(result.transaction_id >= 1);
    assert_eq!(db.len().unwrap(), 3);
    assert_eq!(db.metadata("x").unwrap(), "first");
    assert_eq!(db.metadata("y").unwrap(), "");
}

#[test]
fn test_mixed_batch() {
    let db = VexDB::open(Config::in_memory(2)).unwrap();
    db.insert("keep", v(&[0.0, 0.0]), None).unwrap();
    db.insert("gone", v(&[1.0, 1.0]), None).unwrap();

    let ops = vec![
        BatchOperation::insert("new", v(&[2.0, 2.0]), Some("n".into())),
        BatchOperation::update("keep", v(&[9.0, 9.0]), None),
        BatchOperation::delete("gone"),
    ];
    let result = db.execute_batch(&ops).unwrap();
    assert!(result.success);
    assert_eq!(result.operations_committed, 3);

    assert!(db.contains("new").unwrap());
    assert_eq!(db.get("keep").unwrap().unwrap(), v(&[9.0, 9.0]));
    assert!(!db.contains("gone").unwrap());
}

#[test]
fn test_batch_delete() {
    let db = VexDB::open(Config::in_memory(2)).unwrap();
    for key in ["a", "b", "c"] {
        db.insert(key, v(&[0.0, 0.0]), None).unwrap();
    }

    let result = db.batch_delete(&keys(&["a", "c"])).unwrap();
    assert!(result.success);
    assert_eq!(result.operations_committed, 2);
    assert_eq!(db.all_keys().unwrap(), vec!["b".to_string()]);
}

// ============================================================================
// Partial failure (injected WAL error)
// ============================================================================

#[test]
fn test_batch_partial_failure_commits_prefix_only() {
    // The third WAL append fails: success = false, exactly two
    // operations committed, and the maps hold exactly x and y.
    let dir = tempdir().unwrap();
    let db = VexDB::open(persistent_config(dir.path(), 2)).unwrap();
    db.inject_wal_failures_after(2).unwrap();

    let result = db
        .batch_insert(
            &keys(&["x", "y", "z", "w"]),
            &[v(&[1.0, 1.0]), v(&[2.0, 2.0]), v(&[3.0, 3.0]), v(&[4.0, 4.0])],
            &[],
        )
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.operations_committed, 2);
    assert!(result.error_message.is_some());

    let mut live = db.all_keys().unwrap();
    live.sort();
    assert_eq!(live, vec!["x".to_string(), "y".to_string()]);
    drop(db); // crash

    // The WAL agrees with the in-memory outcome: recovery replays
    // exactly the committed prefix.
    let db = VexDB::open(persistent_config(dir.path(), 2)).unwrap();
    let mut recovered = db.all_keys().unwrap();
    recovered.sort();
    assert_eq!(recovered, vec!["x".to_string(), "y".to_string()]);
    db.close().unwrap();
}

#[test]
fn test_failed_operation_rolls_back_in_memory_half() {
    let dir = tempdir().unwrap();
    let db = VexDB::open(persistent_config(dir.path(), 2)).unwrap();
    db.insert("victim", v(&[1.0, 1.0]), Some("original")).unwrap();

    // Next append fails: the update must leave the old value in place.
    db.inject_wal_failures_after(0).unwrap();
    let ops = vec![BatchOperation::update("victim", v(&[9.0, 9.0]), Some("new".into()))];
    let result = db.execute_batch(&ops).unwrap();

    assert!(!result.success);
    assert_eq!(result.operations_committed, 0);
    assert_eq!(db.get("victim").unwrap().unwrap(), v(&[1.0, 1.0]));
    assert_eq!(db.metadata("victim").unwrap(), "original");
}

#[test]
fn test_batch_stops_at_semantic_failure() {
    // A duplicate key inside the batch stops it; earlier operations stay.
    let db = VexDB::open(Config::in_memory(2)).unwrap();
    db.insert("existing", v(&[0.0, 0.0]), None).unwrap();

    let ops = vec![
        BatchOperation::insert("fresh", v(&[1.0, 1.0]), None),
        BatchOperation::insert("existing", v(&[2.0, 2.0]), None),
        BatchOperation::insert("never", v(&[3.0, 3.0]), None),
    ];
    let result = db.execute_batch(&ops).unwrap();

    assert!(!result.success);
    assert_eq!(result.operations_committed, 1);
    assert!(db.contains("fresh").unwrap());
    assert!(!db.contains("never").unwrap());
    assert_eq!(db.get("existing").unwrap().unwrap(), v(&[0.0, 0.0]));
}

// ============================================================================
// Validation
// ============================================================================

#[test]
fn test_validation_rejects_whole_batch() {
    let db = VexDB::open(Config::in_memory(2)).unwrap();

    // One bad dimension poisons the whole batch up front.
    let result = db
        .batch_insert(
            &keys(&["good", "bad"]),
            &[v(&[1.0, 1.0]), v(&[1.0, 1.0, 1.0])],
            &[],
        )
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.operations_committed, 0);
    assert_eq!(db.len().unwrap(), 0, "validation failure applies nothing");
}

#[test]
fn test_mismatched_keys_and_vectors_rejected() {
    let db = VexDB::open(Config::in_memory(2)).unwrap();
    let err = db
        .batch_insert(&keys(&["a", "b"]), &[v(&[1.0, 1.0])], &[])
        .unwrap_err();
    assert!(err.is_validation());
}

#[test]
fn test_batch_size_cap() {
    let mut config = Config::in_memory(2);
    config.max_batch_size = 3;
    let db = VexDB::open(config).unwrap();

    let ops: Vec<BatchOperation> = (0..4)
        .map(|i| BatchOperation::insert(format!("k{i}"), v(&[0.0, 0.0]), None))
        .collect();
    let result = db.execute_batch(&ops).unwrap();
    assert!(!result.success);
    assert_eq!(result.operations_committed, 0);
}

#[test]
fn test_batches_disabled() {
    let mut config = Config::in_memory(2);
    config.batch_operations = false;
    let db = VexDB::open(config).unwrap();

    let err = db.batch_delete(&keys(&["a"])).unwrap_err();
    assert!(matches!(err, VexDBError::Config { .. }));
}

// ============================================================================
// Cache coherence and statistics
// ============================================================================

#[test]
fn test_batch_commit_invalidates_cache() {
    let db = VexDB::open(Config::in_memory(2)).unwrap();
    db.insert("a", v(&[0.0, 0.0]), None).unwrap();

    let query = v(&[0.4, 0.4]);
    db.similarity_search(&query, 1).unwrap();

    db.batch_insert(&keys(&["b"]), &[v(&[0.5, 0.5])], &[]).unwrap();

    let results = db.similarity_search(&query, 1).unwrap();
    assert_eq!(results[0].0, "b", "batch mutation must invalidate the cache");
}

#[test]
fn test_batch_statistics() {
    let dir = tempdir().unwrap();
    let db = VexDB::open(persistent_config(dir.path(), 2)).unwrap();

    db.batch_insert(&keys(&["a", "b"]), &[v(&[1.0, 1.0]), v(&[2.0, 2.0])], &[])
        .unwrap();

    db.inject_wal_failures_after(0).unwrap();
    db.batch_insert(&keys(&["c"]), &[v(&[3.0, 3.0])], &[]).unwrap();

    let stats = db.statistics().unwrap().batch.unwrap();
    assert_eq!(stats.total_batches, 2);
    assert_eq!(stats.successful_batches, 1);
    assert_eq!(stats.failed_batches, 1);
    assert_eq!(stats.total_operations, 2);
    assert!((stats.success_rate - 0.5).abs() < f64::EPSILON);
}
