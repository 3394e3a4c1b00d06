use std::fs;
use std::sync::Arc;

use tx::model::Status;
use tx::store::Store;
use tx::store::tasks::{NewTask, TaskUpdate};
use tx::sync::{JsonlSync, SyncOp};

fn store() -> Arc<Store> {
    Arc::new(Store::open_memory().unwrap())
}

/// Export, wipe, import: the live task/dep set must be identical, including
/// status and timestamps carried through the op log.
#[test]
fn export_wipe_import_is_lossless() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.jsonl");

    let source = store();
    let sync = JsonlSync::new(Arc::clone(&source), &path);

    let mut ids = Vec::new();
    for i in 0..5 {
        let task = source
            .create_task(NewTask {
                title: format!("task {i}"),
                description: format!("description {i}"),
                score: Some(100 * i),
                ..Default::default()
            })
            .unwrap();
        ids.push(task.id);
    }
    source.add_dependency(&ids[0], &ids[1]).unwrap();
    source.add_dependency(&ids[1], &ids[2]).unwrap();
    source
        .update_task(
            &ids[3],
            TaskUpdate {
                status: Some(Status::Active),
                ..Default::default()
            },
        )
        .unwrap();
    sync.export().unwrap();

    let target = store();
    let sync2 = JsonlSync::new(Arc::clone(&target), &path);
    let report = sync2.import().unwrap();
    assert_eq!(report.imported, 7);
    assert_eq!(report.conflicts, 0);
    assert_eq!(report.skipped, 0);

    let source_tasks = source.all_tasks().unwrap();
    let target_tasks = target.all_tasks().unwrap();
    assert_eq!(source_tasks, target_tasks);
    assert_eq!(
        source.all_dependencies().unwrap(),
        target.all_dependencies().unwrap()
    );
}

/// The literal LWW scenario: an older op conflicts, a newer op applies.
#[test]
fn lww_import_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.jsonl");
    let local = store();
    let sync = JsonlSync::new(Arc::clone(&local), &path);

    // Seed the local row at a pinned updated_at by importing it.
    let task_id: tx::ids::TaskId = "tx-00000abc".parse().unwrap();
    let pinned = serde_json::json!({
        "id": task_id,
        "title": "old",
        "status": "backlog",
        "score": 500,
        "created_at": "2024-01-10T00:00:00Z",
        "updated_at": "2024-01-10T00:00:00Z",
    });
    fs::write(
        &path,
        format!(
            "{}\n",
            serde_json::to_string(&SyncOp {
                op: "upsert_task".into(),
                ts: "2024-01-10T00:00:00Z".into(),
                data: pinned.clone(),
            })
            .unwrap()
        ),
    )
    .unwrap();
    sync.import().unwrap();

    let mut older = pinned.clone();
    older["title"] = "older".into();
    let mut newer = pinned.clone();
    newer["title"] = "new".into();
    newer["updated_at"] = "2024-01-11T00:00:00Z".into();

    let lines = format!(
        "{}\n{}\n",
        serde_json::to_string(&SyncOp {
            op: "upsert_task".into(),
            ts: "2024-01-09T00:00:00Z".into(),
            data: older,
        })
        .unwrap(),
        serde_json::to_string(&SyncOp {
            op: "upsert_task".into(),
            ts: "2024-01-11T00:00:00Z".into(),
            data: newer,
        })
        .unwrap(),
    );
    fs::write(&path, lines).unwrap();

    let report = sync.import().unwrap();
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.imported, 1);
    assert_eq!(local.get_task(&task_id).unwrap().title, "new");
}

/// compact(compact(X)) == compact(X), and the compacted stream applies to
/// the same final state as the raw stream.
#[test]
fn compaction_is_idempotent_and_equivalent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.jsonl");

    let mk = |id: &str, title: &str, ts: &str| {
        serde_json::to_string(&SyncOp {
            op: "upsert_task".into(),
            ts: ts.into(),
            data: serde_json::json!({
                "id": id,
                "title": title,
                "status": "backlog",
                "score": 500,
                "created_at": ts,
                "updated_at": ts,
            }),
        })
        .unwrap()
    };
    let del = |id: &str, ts: &str| {
        serde_json::to_string(&SyncOp {
            op: "delete_task".into(),
            ts: ts.into(),
            data: serde_json::json!({ "id": id }),
        })
        .unwrap()
    };

    let raw = [
        mk("tx-00000001", "a v1", "2024-01-01T00:00:00Z"),
        mk("tx-00000002", "b v1", "2024-01-01T00:00:00Z"),
        mk("tx-00000001", "a v2", "2024-01-02T00:00:00Z"),
        del("tx-00000002", "2024-01-03T00:00:00Z"),
        mk("tx-00000003", "c v1", "2024-01-01T00:00:00Z"),
    ]
    .join("\n")
        + "\n";
    fs::write(&path, &raw).unwrap();

    // Raw stream applied sequentially.
    let raw_store = store();
    JsonlSync::new(Arc::clone(&raw_store), &path).import().unwrap();

    // Compact twice; contents must stabilize after the first pass.
    let compactor = JsonlSync::new(store(), &path);
    let first = compactor.compact().unwrap();
    assert_eq!(first.before, 5);
    assert_eq!(first.after, 2);
    let after_first = fs::read_to_string(&path).unwrap();

    let second = compactor.compact().unwrap();
    assert_eq!(second.before, 2);
    assert_eq!(second.after, 2);
    assert_eq!(after_first, fs::read_to_string(&path).unwrap());

    // Compacted stream applied to a fresh store: same live set.
    let compact_store = store();
    JsonlSync::new(Arc::clone(&compact_store), &path).import().unwrap();

    let raw_titles: Vec<String> = raw_store
        .all_tasks()
        .unwrap()
        .into_iter()
        .map(|t| t.title)
        .collect();
    let compact_titles: Vec<String> = compact_store
        .all_tasks()
        .unwrap()
        .into_iter()
        .map(|t| t.title)
        .collect();
    assert_eq!(raw_titles, compact_titles);
    assert_eq!(raw_titles, vec!["a v2", "c v1"]);
}
