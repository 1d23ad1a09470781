#![allow(clippy::disallowed_methods)]

mod common;

use std::collections::HashSet;
use std::error::Error;

use db::SurrealJobStore;
use queue_core::{ErrorInfo, JobId, JobStatus, JobStore, StoreError};

#[tokio::test]
async fn test_insert_and_get() -> Result<(), Box<dyn Error>> {
    let store = common::setup_store().await?;

    let id = store
        .insert("default", "tests.Echo", r#"{"msg":"hi"}"#.to_string())
        .await?;
    let job = store.get_by_id(id).await?.ok_or("job missing")?;

    assert_eq!(job.id, id);
    assert_eq!(job.queue, "default");
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.payload_type, "tests.Echo");
    assert_eq!(job.payload, r#"{"msg":"hi"}"#);
    assert!(job.worker_id.is_none());
    assert!(job.data.is_none());
    assert!(job.stopped_at.is_none());

    assert!(store.get_by_id(JobId::new()).await?.is_none());
    assert_eq!(store.count_pending("default").await?, 1);
    assert_eq!(store.count_pending("other").await?, 0);

    Ok(())
}

#[tokio::test]
async fn test_claim_oldest_first() -> Result<(), Box<dyn Error>> {
    let store = common::setup_store().await?;

    let first = store.insert("default", "t", "1".to_string()).await?;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = store.insert("default", "t", "2".to_string()).await?;
    store.insert("mail", "t", "3".to_string()).await?;

    let claimed = store
        .claim_next("default", "host-a")
        .await?
        .ok_or("nothing claimed")?;
    assert_eq!(claimed.id, first);
    assert_eq!(claimed.status, JobStatus::Processing);
    assert_eq!(claimed.worker_id.as_deref(), Some("host-a"));

    let claimed = store
        .claim_next("default", "host-a")
        .await?
        .ok_or("nothing claimed")?;
    assert_eq!(claimed.id, second);

    assert!(store.claim_next("default", "host-a").await?.is_none());
    assert_eq!(store.count_in_progress("default", "host-a").await?, 2);
    assert_eq!(store.count_in_progress("default", "host-b").await?, 0);
    assert_eq!(store.count_pending("mail").await?, 1);

    Ok(())
}

#[tokio::test]
async fn test_terminal_marks() -> Result<(), Box<dyn Error>> {
    let store = common::setup_store().await?;

    let done = store.insert("default", "t", "{}".to_string()).await?;
    let failed = store.insert("default", "t", "{}".to_string()).await?;

    // Nothing applies to a pending job
    assert!(!store.mark_completed(done, None).await?);
    assert!(!store.mark_stopped(done).await?);

    store.claim_next("default", "w").await?;
    store.claim_next("default", "w").await?;

    assert!(store.mark_completed(done, Some("42".to_string())).await?);
    let job = store.get_by_id(done).await?.ok_or("job missing")?;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.data_as::<u32>()?, Some(42));
    assert!(job.worker_id.is_none());

    // Already terminal
    assert!(!store.mark_failed(done, ErrorInfo::new("late", "late")).await?);

    assert!(
        store
            .mark_failed(failed, ErrorInfo::new("boom", "trace"))
            .await?
    );
    let job = store.get_by_id(failed).await?.ok_or("job missing")?;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.exception_message.as_deref(), Some("boom"));
    assert_eq!(job.exception_stacktrace.as_deref(), Some("trace"));

    Ok(())
}

#[tokio::test]
async fn test_mark_pending_clears_fields() -> Result<(), Box<dyn Error>> {
    let store = common::setup_store().await?;

    let id = store.insert("default", "t", "{}".to_string()).await?;
    store.claim_next("default", "w").await?;
    store.set_data(id, Some("1".to_string())).await?;
    store.mark_failed(id, ErrorInfo::new("boom", "trace")).await?;

    assert!(store.mark_pending(id).await?);
    let job = store.get_by_id(id).await?.ok_or("job missing")?;
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.worker_id.is_none());
    assert!(job.data.is_none());
    assert!(job.exception_message.is_none());
    assert!(job.exception_stacktrace.is_none());

    assert!(!store.mark_pending(JobId::new()).await?);

    Ok(())
}

#[tokio::test]
async fn test_stop_requests() -> Result<(), Box<dyn Error>> {
    let store = common::setup_store().await?;

    let id = store.insert("default", "t", "{}".to_string()).await?;
    assert!(!store.request_stop(id).await?);
    assert!(store.list_stop_requested().await?.is_empty());

    store.claim_next("default", "w").await?;
    assert!(store.request_stop(id).await?);
    assert_eq!(store.list_stop_requested().await?, vec![id]);

    assert!(store.mark_stopped(id).await?);
    let job = store.get_by_id(id).await?.ok_or("job missing")?;
    assert_eq!(job.status, JobStatus::Stopped);
    assert!(job.stopped_at.is_some());
    assert!(store.list_stop_requested().await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_reclaim_worker_jobs() -> Result<(), Box<dyn Error>> {
    let store = common::setup_store().await?;

    for _ in 0..3 {
        store.insert("default", "t", "{}".to_string()).await?;
    }
    store.claim_next("default", "host-a").await?;
    store.claim_next("default", "host-a").await?;
    store.claim_next("default", "host-b").await?;

    assert_eq!(store.reclaim_worker_jobs("host-a").await?, 2);
    assert_eq!(store.count_pending("default").await?, 2);
    assert_eq!(store.count_in_progress("default", "host-a").await?, 0);
    assert_eq!(store.count_in_progress("default", "host-b").await?, 1);
    assert_eq!(store.reclaim_worker_jobs("host-a").await?, 0);

    Ok(())
}

#[tokio::test]
async fn test_set_data() -> Result<(), Box<dyn Error>> {
    let store = common::setup_store().await?;

    let id = store.insert("default", "t", "{}".to_string()).await?;
    assert!(store.set_data(id, Some(r#"{"progress":50}"#.to_string())).await?);
    let job = store.get_by_id(id).await?.ok_or("job missing")?;
    assert_eq!(job.data.as_deref(), Some(r#"{"progress":50}"#));

    assert!(store.set_data(id, None).await?);
    let job = store.get_by_id(id).await?.ok_or("job missing")?;
    assert!(job.data.is_none());

    assert!(!store.set_data(JobId::new(), None).await?);

    Ok(())
}

#[tokio::test]
async fn test_concurrent_claims_are_exclusive() -> Result<(), Box<dyn Error>> {
    let store = common::setup_store().await?;

    for i in 0..3 {
        store.insert("default", "t", i.to_string()).await?;
    }

    let mut tasks = Vec::new();
    for n in 0..10 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            store.claim_next("default", &format!("w-{n}")).await
        }));
    }

    let mut claimed = HashSet::new();
    for task in tasks {
        if let Some(job) = task.await?? {
            assert!(claimed.insert(job.id), "job {} claimed twice", job.id);
        }
    }
    assert_eq!(claimed.len(), 3);
    assert_eq!(store.count_pending("default").await?, 0);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_separate_stores_never_double_claim() -> Result<(), Box<dyn Error>> {
    let store = common::setup_store().await?;

    for i in 0..12 {
        store.insert("default", "t", i.to_string()).await?;
    }

    // Each store has its own claim lock, like stores in separate processes
    let mut tasks = Vec::new();
    for n in 0..6 {
        let store = SurrealJobStore::new(store.database().clone());
        tasks.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(job) = store.claim_next("default", &format!("w-{n}")).await? {
                claimed.push(job.id);
            }
            Ok::<_, StoreError>(claimed)
        }));
    }

    let mut claimed = HashSet::new();
    for task in tasks {
        for id in task.await?? {
            assert!(claimed.insert(id), "job {id} claimed twice");
        }
    }

    // A worker can give up early after losing races; whatever is left is
    // still claimable exactly once.
    while let Some(job) = store.claim_next("default", "drain").await? {
        assert!(claimed.insert(job.id), "job {} claimed twice", job.id);
    }
    assert_eq!(claimed.len(), 12);
    assert_eq!(store.count_pending("default").await?, 0);

    Ok(())
}
