use chrono::{Duration as ChronoDuration, Utc};
use procrastinate::{
    Backoff, DeferSpec, IntoTaskResult, JobContext, JobStatus, RetryPolicy, Task, TaskError,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;

use crate::helpers::with_test_db;

mod helpers;

#[tokio::test]
async fn failed_jobs_back_off_exponentially_until_the_policy_declines() {
    #[derive(Serialize, Deserialize)]
    struct Flaky {}

    impl Task for Flaky {
        const NAME: &'static str = "flaky";

        fn retry_policy() -> RetryPolicy {
            RetryPolicy::new(3, Backoff::Exponential(Duration::from_secs(1)))
        }

        async fn run(self, _ctx: JobContext) -> impl IntoTaskResult {
            Err::<(), _>(TaskError::failure("boom"))
        }
    }

    with_test_db(|test_db| async move {
        test_db.migrate().await;
        let store = test_db.job_store();

        let job_id = store
            .defer_task(Flaky {}, DeferSpec::default())
            .await
            .expect("Failed to defer job");

        let worker = test_db
            .create_worker_options()
            .define_task::<Flaky>()
            .init()
            .await
            .expect("Failed to create worker");

        // First failure: rescheduled one second out
        let before = Utc::now();
        worker.run_once().await.expect("Failed to run worker");

        let job = test_db.get_job(job_id).await;
        assert_eq!(job.status(), &JobStatus::Todo);
        assert_eq!(job.attempts(), &1);
        let scheduled_at = job.scheduled_at().expect("Retried job must be scheduled");
        assert!(scheduled_at >= before + ChronoDuration::seconds(1));
        assert!(scheduled_at <= Utc::now() + ChronoDuration::seconds(2));

        // Second failure: two seconds out
        test_db.make_job_ready(job_id).await;
        let before = Utc::now();
        worker.run_once().await.expect("Failed to run worker");

        let job = test_db.get_job(job_id).await;
        assert_eq!(job.status(), &JobStatus::Todo);
        assert_eq!(job.attempts(), &2);
        let scheduled_at = job.scheduled_at().expect("Retried job must be scheduled");
        assert!(scheduled_at >= before + ChronoDuration::seconds(2));
        assert!(scheduled_at <= Utc::now() + ChronoDuration::seconds(3));

        // Third failure: the policy declines, the job is failed for good
        test_db.make_job_ready(job_id).await;
        worker.run_once().await.expect("Failed to run worker");

        let job = test_db.get_job(job_id).await;
        assert_eq!(job.status(), &JobStatus::Failed);
        assert_eq!(job.attempts(), &3);
    })
    .await;
}

#[tokio::test]
async fn a_task_can_explicitly_request_a_retry() {
    #[derive(Serialize, Deserialize)]
    struct PleaseRetry {}

    impl Task for PleaseRetry {
        const NAME: &'static str = "please_retry";

        fn retry_policy() -> RetryPolicy {
            RetryPolicy::new(2, Backoff::Fixed(Duration::from_secs(1)))
        }

        async fn run(self, _ctx: JobContext) -> impl IntoTaskResult {
            Err::<(), _>(TaskError::Retry)
        }
    }

    with_test_db(|test_db| async move {
        test_db.migrate().await;
        let store = test_db.job_store();

        let job_id = store
            .defer_task(PleaseRetry {}, DeferSpec::default())
            .await
            .expect("Failed to defer job");

        let worker = test_db
            .create_worker_options()
            .define_task::<PleaseRetry>()
            .init()
            .await
            .expect("Failed to create worker");

        worker.run_once().await.expect("Failed to run worker");

        let job = test_db.get_job(job_id).await;
        assert_eq!(job.status(), &JobStatus::Todo);
        assert_eq!(job.attempts(), &1);

        // The attempts budget still applies to explicit retries
        sleep(Duration::from_millis(1200)).await;
        worker.run_once().await.expect("Failed to run worker");

        let job = test_db.get_job(job_id).await;
        assert_eq!(job.status(), &JobStatus::Failed);
        assert_eq!(job.attempts(), &2);
    })
    .await;
}

#[tokio::test]
async fn an_aborted_task_fails_immediately_whatever_the_policy_says() {
    #[derive(Serialize, Deserialize)]
    struct GivesUp {}

    impl Task for GivesUp {
        const NAME: &'static str = "gives_up";

        fn retry_policy() -> RetryPolicy {
            RetryPolicy::new(25, Backoff::Fixed(Duration::from_secs(1)))
        }

        async fn run(self, _ctx: JobContext) -> impl IntoTaskResult {
            Err::<(), _>(TaskError::Abort)
        }
    }

    with_test_db(|test_db| async move {
        test_db.migrate().await;
        let store = test_db.job_store();

        let job_id = store
            .defer_task(GivesUp {}, DeferSpec::default())
            .await
            .expect("Failed to defer job");

        let worker = test_db
            .create_worker_options()
            .define_task::<GivesUp>()
            .init()
            .await
            .expect("Failed to create worker");

        worker.run_once().await.expect("Failed to run worker");

        let job = test_db.get_job(job_id).await;
        assert_eq!(job.status(), &JobStatus::Failed);
        assert_eq!(job.attempts(), &1);
    })
    .await;
}

#[tokio::test]
async fn kind_allow_list_decides_which_failures_retry() {
    #[derive(Serialize, Deserialize)]
    struct Picky {
        retryable: bool,
    }

    impl Task for Picky {
        const NAME: &'static str = "picky";

        fn retry_policy() -> RetryPolicy {
            RetryPolicy::new(5, Backoff::Fixed(Duration::from_secs(30))).retry_on(["io"])
        }

        async fn run(self, _ctx: JobContext) -> impl IntoTaskResult {
            if self.retryable {
                Err::<(), _>(TaskError::failure_with_kind("io", "socket closed"))
            } else {
                Err::<(), _>(TaskError::failure_with_kind("logic", "bad state"))
            }
        }
    }

    with_test_db(|test_db| async move {
        test_db.migrate().await;
        let store = test_db.job_store();

        let retryable_id = store
            .defer_task(Picky { retryable: true }, DeferSpec::default())
            .await
            .expect("Failed to defer job");
        let final_id = store
            .defer_task(Picky { retryable: false }, DeferSpec::default())
            .await
            .expect("Failed to defer job");

        let worker = test_db
            .create_worker_options()
            .define_task::<Picky>()
            .init()
            .await
            .expect("Failed to create worker");

        worker.run_once().await.expect("Failed to run worker");

        let retried = test_db.get_job(retryable_id).await;
        assert_eq!(retried.status(), &JobStatus::Todo);
        assert_eq!(retried.attempts(), &1);

        let failed = test_db.get_job(final_id).await;
        assert_eq!(failed.status(), &JobStatus::Failed);
        assert_eq!(failed.attempts(), &1);
    })
    .await;
}
