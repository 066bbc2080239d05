//! Worker retry/backoff scenario: a job that fails every attempt is retried
//! up to `WORKER_MAX_ATTEMPTS` times, then marked `failed`.

use chainrag::config::Config;
use chainrag::embedding::FakeEmbeddings;
use chainrag::jobs::Worker;
use chainrag::store::memory::MemoryStore;
use chainrag::store::types::{Job, JobStatus, JobType};
use chainrag::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[tokio::test]
async fn failing_crawl_job_retries_then_fails() {
    std::env::set_var("WORKER_POLL_INTERVAL_S", "0.02");
    std::env::set_var("WORKER_MAX_ATTEMPTS", "2");
    std::env::set_var("WORKER_STALE_AFTER_S", "3600");

    let config = Config::from_env(Some(0), Some("./test-data".into()));
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let embeddings = Arc::new(FakeEmbeddings::new(config.embedding.dim));
    let worker = Arc::new(Worker::new(store.clone(), embeddings, &config));

    // A crawl job missing `kb_id` always fails in `run_crawl`.
    let job_id = "crawl_retry_test".to_string();
    store.enqueue_job(Job::new(job_id.clone(), JobType::Crawl, serde_json::json!({}))).await.unwrap();

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(rx));

    // Two failed attempts at a ~20ms poll interval comfortably finish within
    // a second; poll for the terminal state instead of a fixed sleep.
    let mut final_job = None;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let job = store.get_job(&job_id).await.unwrap().unwrap();
        if job.status == JobStatus::Failed {
            final_job = Some(job);
            break;
        }
    }

    let _ = tx.send(true);
    handle.abort();

    let job = final_job.expect("job should have reached the failed state after exhausting retries");
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.attempts() >= 2);
    assert!(!job.error.is_empty());
}
