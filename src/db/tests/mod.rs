use crate::db::*;
use crate::model::{Article, Job, NzbFile};
use crate::types::{HistoryEntry, JobId, JobStatus, Priority};
use chrono::{TimeZone, Utc};
use std::path::PathBuf;
use tempfile::TempDir;

async fn store() -> (AdminStore, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = AdminStore::open(&dir.path().join("admin.db"), &dir.path().join("admin"))
        .await
        .unwrap();
    (store, dir)
}

fn job(id: &str) -> Job {
    let files = vec![NzbFile::new(
        "\"movie.mkv\" yEnc (1/2)",
        "movie.mkv".into(),
        vec![Article::new("a1@x", 100, 1), Article::new("a2@x", 100, 2)],
    )];
    Job::new(JobId::from(id), id, files, PathBuf::from("/incomplete").join(id))
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("admin.db");
    let admin = dir.path().join("admin");
    let first = AdminStore::open(&db, &admin).await.unwrap();
    first.close().await;
    let second = AdminStore::open(&db, &admin).await.unwrap();
    assert!(second.load_queue().await.unwrap().is_empty());
}

#[tokio::test]
async fn queue_order_round_trips() {
    let (store, _dir) = store().await;
    let rows = vec![
        QueueRow {
            job_id: JobId::from("b"),
            position: 0,
            priority: Priority::High.to_i32(),
            paused: false,
        },
        QueueRow {
            job_id: JobId::from("a"),
            position: 1,
            priority: Priority::Normal.to_i32(),
            paused: true,
        },
    ];
    store.save_queue(&rows).await.unwrap();
    assert_eq!(store.load_queue().await.unwrap(), rows);

    store.save_queue(&rows[1..]).await.unwrap();
    assert_eq!(store.load_queue().await.unwrap().len(), 1);
}

#[tokio::test]
async fn history_is_newest_first_and_replaceable() {
    let (store, _dir) = store().await;
    let entry = |id: &str, status: JobStatus, secs: i64| HistoryEntry {
        id: JobId::from(id),
        name: id.into(),
        category: Some("tv".into()),
        status,
        fail_message: (status == JobStatus::Failed).then(|| "encryption".to_string()),
        downloaded_bytes: 1234,
        bad_articles: 2,
        workdir: PathBuf::from("/incomplete").join(id),
        completed_at: Utc.timestamp_opt(secs, 0).unwrap(),
    };
    store
        .insert_history(&entry("old", JobStatus::Finished, 1_000))
        .await
        .unwrap();
    store
        .insert_history(&entry("new", JobStatus::Failed, 2_000))
        .await
        .unwrap();

    let history = store.query_history(10, 0).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id.as_str(), "new");
    assert_eq!(history[0].status, JobStatus::Failed);
    assert_eq!(history[0].fail_message.as_deref(), Some("encryption"));
    assert_eq!(history[1].bad_articles, 2);

    store
        .insert_history(&entry("old", JobStatus::Failed, 3_000))
        .await
        .unwrap();
    let history = store.query_history(10, 0).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id.as_str(), "old");

    assert!(store.delete_history(&JobId::from("old")).await.unwrap());
    assert!(!store.delete_history(&JobId::from("old")).await.unwrap());
}

#[tokio::test]
async fn kv_values_round_trip() {
    let (store, _dir) = store().await;
    assert_eq!(store.get_kv::<u64>("quota_used").await.unwrap(), None);
    store.set_kv("quota_used", &42u64).await.unwrap();
    store.set_kv("quota_used", &43u64).await.unwrap();
    assert_eq!(store.get_kv::<u64>("quota_used").await.unwrap(), Some(43));
}

#[tokio::test]
async fn job_snapshot_keeps_article_state() {
    let (store, _dir) = store().await;
    let mut job = job("j1");
    job.files[0].articles[0].on_disk = true;
    job.files[0].articles[0].try_list.add("s1");
    job.files[0].articles[1].fetcher = Some("s2".into());
    job.password = Some("secret".into());
    store.save_job(&job).await.unwrap();

    let loaded = store.load_job(&job.id).await.unwrap();
    assert!(loaded.files[0].articles[0].on_disk);
    assert!(loaded.files[0].articles[0].try_list.contains("s1"));
    assert_eq!(loaded.files[0].articles[1].fetcher, None, "in-flight state is not persisted");
    assert_eq!(loaded.password.as_deref(), Some("secret"));
    assert!(!store.job_dir(&job.id).join("job.json.tmp").exists());
}

#[tokio::test]
async fn manifest_is_stored_compressed() {
    let (store, _dir) = store().await;
    let id = JobId::from("j1");
    let manifest = b"<?xml version=\"1.0\"?><nzb></nzb>".repeat(20);
    store.save_manifest(&id, &manifest).await.unwrap();
    let on_disk = std::fs::read(store.job_dir(&id).join(MANIFEST_FILE)).unwrap();
    assert!(on_disk.len() < manifest.len());
    assert_eq!(store.load_manifest(&id).await.unwrap(), manifest);

    store.remove_job_dir(&id).await.unwrap();
    assert!(!store.job_dir(&id).exists());
    store.remove_job_dir(&id).await.unwrap();
}

#[tokio::test]
async fn missing_snapshot_is_a_snapshot_error() {
    let (store, _dir) = store().await;
    let err = store.load_job(&JobId::from("nope")).await.unwrap_err();
    assert!(matches!(
        err,
        crate::Error::Database(crate::error::DatabaseError::Snapshot { .. })
    ));
}
