//! PostgreSQL claim-layer tests.
//!
//! These need a disposable database and are `#[ignore]`d by default. Run with
//! `WATCHPOST_TEST_PG_URL=postgres://... cargo test -p watchpost-storage -- --ignored`.
//! Every test truncates the `jobs` table.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

use watchpost_core::{JobExecution, JobStatus};
use watchpost_storage::*;

// Tests share one table and must run serially.
static DB_LOCK: Mutex<()> = Mutex::const_new(());

async fn pool() -> sqlx::PgPool {
    let url = std::env::var("WATCHPOST_TEST_PG_URL")
        .expect("WATCHPOST_TEST_PG_URL must point at a disposable database");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .unwrap();
    PgStorage::from_pool(pool.clone(), "migrator").migrate().await.unwrap();
    sqlx::query("TRUNCATE jobs CASCADE").execute(&pool).await.unwrap();
    pool
}

async fn seed(admin: &PgStorage, n: usize) -> Vec<Uuid> {
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        let job = admin
            .create_job(NewJob::new(format!("job-{i}"), "* * * * * *", "GET", "http://localhost/test"))
            .await
            .unwrap();
        ids.push(job.id);
    }
    ids
}

#[tokio::test]
#[ignore]
async fn skip_locked_claims_are_exclusive() {
    let _guard = DB_LOCK.lock().await;
    let pool = pool().await;
    let a = Arc::new(PgStorage::from_pool(pool.clone(), "node-a"));
    let b = Arc::new(PgStorage::from_pool(pool.clone(), "node-b"));
    seed(&a, 100).await;

    let mut handles = Vec::new();
    for node in [a.clone(), b.clone(), a.clone(), b.clone()] {
        handles.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            for _ in 0..10 {
                ids.extend(node.available_jobs(5).await.unwrap().into_iter().map(|j| j.id));
            }
            ids
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "job {id} claimed twice");
        }
    }
    assert_eq!(seen.len(), 100);

    let owned_by_a = a.claimed_jobs("node-a", 1000, 0).await.unwrap().len();
    let owned_by_b = a.claimed_jobs("node-b", 1000, 0).await.unwrap().len();
    assert_eq!(owned_by_a + owned_by_b, 100);
}

#[tokio::test]
#[ignore]
async fn release_twice_matches_release_once() {
    let _guard = DB_LOCK.lock().await;
    let pool = pool().await;
    let node = PgStorage::from_pool(pool, "node-a");
    seed(&node, 10).await;
    let ids: Vec<Uuid> = node.available_jobs(10).await.unwrap().iter().map(|j| j.id).collect();

    node.release_all(&[]).await.unwrap();
    node.release_all(&ids).await.unwrap();
    node.release_all(&ids).await.unwrap();

    for id in ids {
        let job = node.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::PendingToBeClaimed);
        assert_eq!(job.claimed_by, None);
    }
}

#[tokio::test]
#[ignore]
async fn listener_receives_updates_after_readiness() {
    let _guard = DB_LOCK.lock().await;
    let pool = pool().await;
    let node = PgStorage::from_pool(pool, "node-listen");
    seed(&node, 1).await;
    let id = node.available_jobs(1).await.unwrap()[0].id;

    let (tx, mut rx) = mpsc::channel(8);
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    node.listen_for_changes(tx, cancel_rx).await.unwrap();

    // The subscription is live once listen_for_changes returns.
    let patch = JobPatch {
        endpoint: Some("http://localhost/test?updated=true".into()),
        ..JobPatch::default()
    };
    node.update_job(id, patch).await.unwrap();

    let notified = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
    assert_eq!(notified, Some(id));
    let updates = node.job_updates(id).await.unwrap().unwrap();
    assert_eq!(updates.endpoint, "http://localhost/test?updated=true");

    node.stop_listening_for_changes().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn write_done_records_history() {
    let _guard = DB_LOCK.lock().await;
    let pool = pool().await;
    let node = PgStorage::from_pool(pool, "node-a");
    seed(&node, 1).await;
    let mut job = node.available_jobs(1).await.unwrap().remove(0);
    job.last_status_code = Some(200);
    job.last_message = Some("ok".into());
    job.succeeded = Some(true);
    job.last_response_at = Some(chrono::Utc::now());

    let execution = JobExecution::snapshot(&job, Duration::from_millis(15));
    node.write_done(&job, &execution).await.unwrap();

    let history = node.executions(job.id, 10, 0).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status_code, 200);
    assert!(history[0].succeeded);
    assert_eq!(node.job(job.id).await.unwrap().unwrap().succeeded, Some(true));
}

#[tokio::test]
#[ignore]
async fn late_write_done_does_not_touch_a_reclaimed_row() {
    let _guard = DB_LOCK.lock().await;
    let pool = pool().await;
    let a = PgStorage::from_pool(pool.clone(), "node-a");
    let b = PgStorage::from_pool(pool, "node-b");
    seed(&a, 1).await;
    let mut job = a.available_jobs(1).await.unwrap().remove(0);
    a.release_all(&[job.id]).await.unwrap();
    b.available_jobs(1).await.unwrap();

    job.last_status_code = Some(500);
    job.succeeded = Some(false);
    let execution = JobExecution::snapshot(&job, Duration::from_millis(5));
    a.write_done(&job, &execution).await.unwrap();

    let row = b.job(job.id).await.unwrap().unwrap();
    assert_eq!(row.claimed_by.as_deref(), Some("node-b"));
    assert_eq!(row.last_status_code, None);
    assert_eq!(b.executions(job.id, 10, 0).await.unwrap().len(), 1);
}

#[tokio::test]
#[ignore]
async fn unreadable_headers_are_set_aside_at_claim() {
    let _guard = DB_LOCK.lock().await;
    let pool = pool().await;
    let node = PgStorage::from_pool(pool.clone(), "node-a");
    let ids = seed(&node, 2).await;
    sqlx::query("UPDATE jobs SET headers = '{broken' WHERE id = $1")
        .bind(ids[0])
        .execute(&pool)
        .await
        .unwrap();

    let claimed = node.available_jobs(10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, ids[1]);
    let (status,): (String,) = sqlx::query_as("SELECT status FROM jobs WHERE id = $1")
        .bind(ids[0])
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "bad headers");
}
