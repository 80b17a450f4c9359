//! Batch executor behavior against the in-memory store.

use oplog_engine::{
    as_document, Batch, BatchAnalyzer, ChangeOperation, CommandOp, DeleteOp, Document, InsertOp,
    Namespace, ReplicationContext, UpdateOp,
};
use oplog_server::{
    BatchExecutor, ConcurrentBatchExecutor, DefaultOperationApplier,
    FixedSubBatchHeuristic, JobError, MemoryBackend, ReplError, RetryPolicy,
    SequentialBatchExecutor,
};
use serde_json::{json, Value};
use std::sync::Arc;

fn doc(value: Value) -> Document {
    as_document(value).unwrap()
}

fn insert(ts: u64, coll: &str, value: Value) -> ChangeOperation {
    ChangeOperation::Insert(InsertOp::new(ts, ts as i64, "shop", coll, doc(value)))
}

fn update(ts: u64, coll: &str, id: Value, modification: Value) -> ChangeOperation {
    ChangeOperation::Update(UpdateOp::new(
        ts,
        ts as i64,
        "shop",
        coll,
        doc(json!({ "_id": id })),
        doc(modification),
        false,
    ))
}

fn delete(ts: u64, coll: &str, id: Value) -> ChangeOperation {
    ChangeOperation::Delete(DeleteOp::new(ts, ts as i64, "shop", coll, doc(json!({ "_id": id }))))
}

fn command(ts: u64, value: Value) -> ChangeOperation {
    ChangeOperation::Command(CommandOp::new(ts, ts as i64, "shop", doc(value)))
}

fn orders() -> Namespace {
    Namespace::new("shop", "orders")
}

fn sequential(backend: &MemoryBackend) -> SequentialBatchExecutor {
    SequentialBatchExecutor::new(Arc::new(backend.clone()), Arc::new(DefaultOperationApplier))
        .with_retry_policy(RetryPolicy::testing())
}

fn concurrent(backend: &MemoryBackend, sub_batch: usize) -> ConcurrentBatchExecutor {
    ConcurrentBatchExecutor::new(
        Arc::new(backend.clone()),
        Arc::new(DefaultOperationApplier),
        Arc::new(FixedSubBatchHeuristic(sub_batch)),
        4,
    )
    .with_retry_policy(RetryPolicy::testing())
}

fn analyze(ops: &[ChangeOperation]) -> Vec<Batch> {
    BatchAnalyzer::new(ReplicationContext::default())
        .analyze(ops)
        .unwrap()
}

async fn apply_all(
    executor: &dyn BatchExecutor,
    ops: &[ChangeOperation],
) -> Result<Option<ChangeOperation>, ReplError> {
    let mut last = None;
    for batch in analyze(ops) {
        last = executor.apply(batch, ReplicationContext::default()).await?;
    }
    Ok(last)
}

#[tokio::test]
async fn insert_then_set_update_inserts_once_without_lookups() {
    let backend = MemoryBackend::new();
    let ops = vec![
        insert(1, "orders", json!({"_id": "k1", "a": 1})),
        update(2, "orders", json!("k1"), json!({"a": 2})),
    ];

    let last = apply_all(&sequential(&backend), &ops).await.unwrap();

    assert_eq!(last, Some(ops[1].clone()));
    assert_eq!(backend.documents(&orders()), vec![doc(json!({"_id": "k1", "a": 2}))]);
    let stats = backend.stats();
    assert_eq!(stats.insert_calls, 1);
    assert_eq!(stats.find_calls, 0);
    assert_eq!(stats.fetch_calls, 0);
    assert_eq!(stats.delete_calls, 0);
}

#[tokio::test]
async fn update_after_delete_fails_the_job_without_writing() {
    let backend = MemoryBackend::new();
    backend
        .seed(&orders(), vec![doc(json!({"_id": "k0", "a": 0}))])
        .unwrap();
    let ops = vec![
        insert(1, "orders", json!({"_id": "k2"})),
        delete(2, "orders", json!("k1")),
        update(3, "orders", json!("k1"), json!({"$inc": {"a": 1}})),
        delete(4, "orders", json!("k0")),
    ];
    let executor = sequential(&backend);

    let err = apply_all(&executor, &ops).await.unwrap_err();

    match err {
        ReplError::Job(JobError::Mismatch { namespace, mismatches }) => {
            assert_eq!(namespace, orders());
            let keys: Vec<_> = mismatches.iter().map(|m| m.key.to_string()).collect();
            assert_eq!(keys, vec!["\"k1\"".to_string()]);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(backend.documents(&orders()), vec![doc(json!({"_id": "k0", "a": 0}))]);
    assert_eq!(executor.metrics().snapshot().retries, 0);
    assert_eq!(executor.metrics().snapshot().failures, 1);
}

#[tokio::test]
async fn optimistic_collision_falls_back_to_pessimistic() {
    let seeded = || {
        let backend = MemoryBackend::new();
        backend
            .seed(&orders(), vec![doc(json!({"_id": "k1", "a": 1})), doc(json!({"_id": "k2"}))])
            .unwrap();
        backend
    };
    let ops = vec![
        insert(1, "orders", json!({"_id": "k1", "a": 9})),
        insert(2, "orders", json!({"_id": "k3", "a": 3})),
    ];

    let optimistic = seeded();
    let executor = sequential(&optimistic);
    apply_all(&executor, &ops).await.unwrap();
    assert_eq!(executor.metrics().snapshot().optimistic_fallbacks, 1);

    let pessimistic = seeded();
    let ctx = ReplicationContext::new(false, Some(true));
    let executor = sequential(&pessimistic);
    for batch in BatchAnalyzer::new(ctx).analyze(&ops).unwrap() {
        executor.apply(batch, ctx).await.unwrap();
    }
    assert_eq!(executor.metrics().snapshot().optimistic_fallbacks, 0);

    assert_eq!(optimistic.documents(&orders()), pessimistic.documents(&orders()));
    assert_eq!(
        optimistic.get(&orders(), &"k1".into()),
        Some(doc(json!({"_id": "k1", "a": 9})))
    );
}

#[tokio::test]
async fn reapplying_an_applied_batch_changes_nothing() {
    let backend = MemoryBackend::new();
    backend
        .seed(&orders(), vec![doc(json!({"_id": "k2", "a": 1})), doc(json!({"_id": "k3"}))])
        .unwrap();
    let ops = vec![
        insert(1, "orders", json!({"_id": "k1", "a": 1})),
        update(2, "orders", json!("k2"), json!({"$set": {"b": 2}})),
        delete(3, "orders", json!("k3")),
        insert(4, "orders", json!({"_id": "k4"})),
        update(5, "orders", json!("k4"), json!({"c": true})),
    ];
    let executor = sequential(&backend);
    apply_all(&executor, &ops).await.unwrap();
    let applied = backend.documents(&orders());

    let ctx = ReplicationContext::reapplying();
    for batch in BatchAnalyzer::new(ctx).analyze(&ops).unwrap() {
        executor.execute(&batch, &ctx).await.unwrap();
    }

    assert_eq!(backend.documents(&orders()), applied);
    assert_eq!(
        applied,
        vec![
            doc(json!({"_id": "k1", "a": 1})),
            doc(json!({"_id": "k2", "a": 1, "b": 2})),
            doc(json!({"_id": "k4", "c": true})),
        ]
    );
}

#[tokio::test]
async fn rollback_retries_the_whole_batch() {
    let backend = MemoryBackend::new();
    backend.seed(&orders(), vec![doc(json!({"_id": 1, "n": 1}))]).unwrap();
    backend.fail_next_commits(1);
    let ops = vec![
        update(1, "orders", json!(1), json!({"$set": {"n": 2}})),
        insert(2, "orders", json!({"_id": 2, "n": 5})),
    ];
    let executor = sequential(&backend);

    apply_all(&executor, &ops).await.unwrap();

    assert_eq!(executor.metrics().snapshot().retries, 1);
    assert_eq!(
        backend.documents(&orders()),
        vec![doc(json!({"_id": 1, "n": 2})), doc(json!({"_id": 2, "n": 5}))]
    );
}

#[tokio::test]
async fn retries_are_bounded() {
    let backend = MemoryBackend::new();
    backend.fail_next_commits(10);
    let executor = sequential(&backend);

    let err = apply_all(&executor, &[insert(1, "orders", json!({"_id": 1}))])
        .await
        .unwrap_err();

    match err {
        ReplError::RetriesExhausted { attempts, source, .. } => {
            assert_eq!(attempts, 3);
            assert!(source.is_retryable());
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(backend.documents(&orders()).is_empty());
    assert_eq!(executor.metrics().snapshot().retries, 2);
}

#[tokio::test]
async fn commands_act_as_barriers() {
    let backend = MemoryBackend::new();
    let ops = vec![
        insert(1, "orders", json!({"_id": 1})),
        insert(2, "orders", json!({"_id": 2})),
        command(3, json!({"drop": "orders"})),
        insert(4, "orders", json!({"_id": 3})),
    ];
    let executor = sequential(&backend);

    let last = apply_all(&executor, &ops).await.unwrap();

    assert_eq!(last.map(|op| op.ts()), Some(4));
    assert_eq!(backend.documents(&orders()), vec![doc(json!({"_id": 3}))]);
    let snapshot = executor.metrics().snapshot();
    assert_eq!(snapshot.grouped_batches, 2);
    assert_eq!(snapshot.single_batches, 1);
    assert_eq!(snapshot.single_ops["command"].count, 1);
}

#[tokio::test]
async fn unknown_command_is_not_retried() {
    let backend = MemoryBackend::new();
    let executor = sequential(&backend);

    let err = apply_all(&executor, &[command(1, json!({"eval": "1"}))])
        .await
        .unwrap_err();

    assert!(matches!(err, ReplError::Apply(_)));
    assert_eq!(executor.metrics().snapshot().retries, 0);
}

/// A valid history over three collections with a barrier in the middle.
fn workload() -> Vec<ChangeOperation> {
    let mut ops = Vec::new();
    let mut ts = 0;
    let mut next = || {
        ts += 1;
        ts
    };
    for coll in ["orders", "users", "carts"] {
        for i in 0..40 {
            ops.push(insert(next(), coll, json!({"_id": i, "n": i})));
        }
    }
    ops.push(command(next(), json!({"create": "invoices"})));
    for coll in ["orders", "users", "carts"] {
        for i in 0..40 {
            ops.push(update(next(), coll, json!(i), json!({"$inc": {"n": 100}})));
            if i % 5 == 0 {
                ops.push(delete(next(), coll, json!(i)));
            }
            if i % 10 == 0 {
                ops.push(insert(next(), coll, json!({"_id": i, "reborn": true})));
            }
            // 35 stays deleted, so it gets no update
            if i % 7 == 0 && i != 35 {
                ops.push(update(next(), coll, json!(i), json!({"replaced": i})));
            }
        }
    }
    ops
}

#[tokio::test]
async fn concurrent_execution_matches_sequential() {
    let ops = workload();

    let expected = MemoryBackend::new();
    apply_all(&sequential(&expected), &ops).await.unwrap();

    for sub_batch in [1, 3, 64] {
        let actual = MemoryBackend::new();
        let executor = concurrent(&actual, sub_batch);
        apply_all(&executor, &ops).await.unwrap();

        for coll in ["orders", "users", "carts"] {
            let ns = Namespace::new("shop", coll);
            assert_eq!(actual.documents(&ns), expected.documents(&ns), "{coll} / {sub_batch}");
        }
        let snapshot = executor.metrics().snapshot();
        assert!(snapshot.sub_batches >= 6);
        assert_eq!(snapshot.failures, 0);
    }

    let orders = expected.documents(&orders());
    assert_eq!(orders.len(), 40 - 8 + 4);
    assert_eq!(orders[1], doc(json!({"_id": 1, "n": 101})));
    assert_eq!(orders[0], doc(json!({"_id": 0, "replaced": 0})));
}

#[tokio::test]
async fn concurrent_executor_reports_job_failures() {
    let backend = MemoryBackend::new();
    backend.seed(&orders(), vec![doc(json!({"_id": 1}))]).unwrap();
    let ops = vec![
        update(1, "orders", json!(1), json!({"$set": {"ok": true}})),
        update(2, "users", json!(99), json!({"$inc": {"n": 1}})),
    ];
    let executor = concurrent(&backend, 1);

    let err = apply_all(&executor, &ops).await.unwrap_err();

    assert!(matches!(err, ReplError::Job(JobError::Mismatch { .. })));
    assert!(backend
        .documents(&Namespace::new("shop", "users"))
        .is_empty());
}

#[tokio::test]
async fn concurrent_mismatch_wins_over_rollback() {
    let backend = MemoryBackend::new();
    backend.seed(&orders(), vec![doc(json!({"_id": 1}))]).unwrap();
    // the orders piece fails to commit, the users piece never finds its document
    backend.fail_next_commits(1);
    let ops = vec![
        update(1, "orders", json!(1), json!({"$set": {"ok": true}})),
        update(2, "users", json!(99), json!({"$inc": {"n": 1}})),
    ];
    let executor = concurrent(&backend, 1);

    let err = apply_all(&executor, &ops).await.unwrap_err();

    assert!(matches!(err, ReplError::Job(JobError::Mismatch { .. })));
    assert_eq!(executor.metrics().snapshot().retries, 0);
    // a reapplying retry would have upserted the missing user
    assert!(backend
        .documents(&Namespace::new("shop", "users"))
        .is_empty());
    assert_eq!(backend.documents(&orders()), vec![doc(json!({"_id": 1}))]);
}
