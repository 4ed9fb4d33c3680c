//! PostgreSQL store tests. Require a database at DATABASE_URL:
//!
//! cargo test --features postgres -- --ignored

#![cfg(feature = "postgres")]


use leasework::{JobStatus, LeaseworkError, QueueType};
use test_utils::{setup_postgres_client, unique_definitions};

#[tokio::test]
#[ignore] // Requires database connection
async fn test_postgres_enqueue_and_dedup() {
    let client = setup_postgres_client().await;
    let defs = unique_definitions("dedup", 3);

    let first = client
        .enqueue(QueueType::Export, &defs[..2], None, false)
        .await
        .unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].group_id, first[1].group_id);
    assert!(first.iter().all(|job| job.status == JobStatus::Created));

    let second = client
        .enqueue(QueueType::Export, &defs[1..], None, false)
        .await
        .unwrap();
    assert_eq!(second[0], first[1]);
    assert_ne!(second[1].group_id, first[0].group_id);

    let dup = client
        .enqueue(QueueType::Export, &[defs[2].clone(), defs[2].clone()], None, false)
        .await
        .unwrap();
    assert_eq!(dup[0].id, second[1].id);
    assert_eq!(dup[1].id, second[1].id);
}

#[tokio::test]
#[ignore] // Requires database connection
async fn test_postgres_caller_group_id_advances_sequence() {
    let client = setup_postgres_client().await;
    let defs = unique_definitions("group", 2);

    let minted = client
        .enqueue(QueueType::Import, &defs[..1], None, false)
        .await
        .unwrap();
    let supplied_group = minted[0].group_id + 1_000;

    let supplied = client
        .enqueue(QueueType::Import, &defs[1..], Some(supplied_group), false)
        .await
        .unwrap();
    assert_eq!(supplied[0].group_id, supplied_group);

    let next = client
        .enqueue(QueueType::Import, &unique_definitions("group-next", 1), None, false)
        .await
        .unwrap();
    assert!(next[0].group_id > supplied_group);
}

#[tokio::test]
#[ignore] // Requires database connection
async fn test_postgres_lease_lifecycle() {
    let client = setup_postgres_client().await;
    let defs = unique_definitions("lease", 1);

    let jobs = client
        .enqueue(QueueType::Defrag, &defs, None, false)
        .await
        .unwrap();
    let job = client
        .dequeue(QueueType::Defrag, "pg-w1", 60, Some(jobs[0].id), false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.version, 1);
    assert!(job.start_date.is_some());

    assert!(!client.heartbeat(&job, Some("25%")).await.unwrap());
    let stored = client
        .get_by_id(QueueType::Defrag, job.id, true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.result.as_deref(), Some("25%"));
    assert_eq!(stored.definition.as_deref(), Some(defs[0].as_str()));

    let done = job.finish(JobStatus::Completed, Some("100%".into()));
    client.complete(&done, false).await.unwrap();
    assert!(client.complete(&done, false).await.unwrap_err().is_not_found());

    let stored = client
        .get_by_id(QueueType::Defrag, done.id, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert!(stored.definition.is_none());
    assert!(stored.end_date.is_some());
}

#[tokio::test]
#[ignore] // Requires database connection
async fn test_postgres_reclaim_bumps_version() {
    let client = setup_postgres_client().await;
    let defs = unique_definitions("reclaim", 1);

    let jobs = client
        .enqueue(QueueType::Import, &defs, None, false)
        .await
        .unwrap();
    let stale = client
        .dequeue(QueueType::Import, "pg-w1", 1, Some(jobs[0].id), false)
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

    let fresh = client
        .dequeue(QueueType::Import, "pg-w2", 1, Some(jobs[0].id), true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fresh.version, stale.version + 1);
    assert_eq!(fresh.start_date, stale.start_date);

    let err = client.heartbeat(&stale, None).await.unwrap_err();
    assert!(matches!(err, LeaseworkError::JobNotFound { .. }));
    assert!(!client.heartbeat(&fresh, None).await.unwrap());
}

#[tokio::test]
#[ignore] // Requires database connection
async fn test_postgres_failure_cascade() {
    let client = setup_postgres_client().await;
    let defs = unique_definitions("cascade", 3);

    let jobs = client
        .enqueue(QueueType::BulkDelete, &defs, None, false)
        .await
        .unwrap();
    let a = client
        .dequeue(QueueType::BulkDelete, "pg-w1", 60, Some(jobs[0].id), false)
        .await
        .unwrap()
        .unwrap();
    let b = client
        .dequeue(QueueType::BulkDelete, "pg-w2", 60, Some(jobs[1].id), false)
        .await
        .unwrap()
        .unwrap();

    client
        .complete(&a.finish(JobStatus::Failed, Some("boom".into())), true)
        .await
        .unwrap();

    let group = client
        .get_by_group_id(QueueType::BulkDelete, jobs[0].group_id, false)
        .await
        .unwrap();
    assert_eq!(group[0].status, JobStatus::Failed);
    assert_eq!(group[1].status, JobStatus::Running);
    assert!(group[1].cancel_requested);
    assert_eq!(group[2].status, JobStatus::Cancelled);

    assert!(client.heartbeat(&b, None).await.unwrap());
}

#[tokio::test]
#[ignore] // Requires database connection
async fn test_postgres_concurrent_claim_has_one_winner() {
    let client = setup_postgres_client().await;
    let defs = unique_definitions("race", 1);

    let jobs = client
        .enqueue(QueueType::BulkUpdate, &defs, None, false)
        .await
        .unwrap();
    let job_id = jobs[0].id;

    let mut handles = Vec::new();
    for i in 0..8 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            client
                .dequeue(QueueType::BulkUpdate, &format!("pg-w{}", i), 60, Some(job_id), false)
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
#[ignore] // Requires database connection
async fn test_postgres_cancel_by_group() {
    let client = setup_postgres_client().await;
    let defs = unique_definitions("cancel", 2);

    let jobs = client
        .enqueue(QueueType::Export, &defs, None, false)
        .await
        .unwrap();
    client
        .dequeue(QueueType::Export, "pg-w1", 60, Some(jobs[0].id), false)
        .await
        .unwrap()
        .unwrap();

    let summary = client
        .cancel_by_group_id(QueueType::Export, jobs[0].group_id)
        .await
        .unwrap();
    assert_eq!(summary.cancelled, 1);
    assert_eq!(summary.cancel_requested, 1);

    let stored = client
        .get_by_ids(QueueType::Export, &[jobs[0].id, jobs[1].id], false)
        .await
        .unwrap();
    assert!(stored[0].cancel_requested);
    assert_eq!(stored[1].status, JobStatus::Cancelled);
}
