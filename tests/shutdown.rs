use procrastinate::{
    Backoff, DeferSpec, IntoTaskResult, JobContext, JobStatus, RetryPolicy, Task, TaskError,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::{
    task::spawn_local,
    time::{sleep, timeout, Instant},
};

use crate::helpers::{with_test_db, StaticCounter};

mod helpers;

#[tokio::test]
async fn a_worker_drains_in_flight_jobs_on_shutdown() {
    static QUICK_CALL_COUNT: StaticCounter = StaticCounter::new();

    #[derive(Serialize, Deserialize)]
    struct Quick {}

    impl Task for Quick {
        const NAME: &'static str = "quick";

        async fn run(self, _ctx: JobContext) -> impl IntoTaskResult {
            sleep(Duration::from_millis(200)).await;
            QUICK_CALL_COUNT.increment().await;
        }
    }

    with_test_db(|test_db| async move {
        test_db.migrate().await;
        let store = test_db.job_store();

        let job_id = store
            .defer_task(Quick {}, DeferSpec::default())
            .await
            .expect("Failed to defer job");

        let worker = test_db
            .create_worker_options()
            .polling_interval(Duration::from_millis(100))
            .graceful_shutdown_timeout(Duration::from_secs(2))
            .define_task::<Quick>()
            .init()
            .await
            .expect("Failed to create worker");

        let worker = std::rc::Rc::new(worker);
        let worker_2 = worker.clone();
        let worker_fut = spawn_local(async move {
            worker_2.run().await.expect("Failed to run worker");
        });

        // Let the worker pick the job up, then stop it mid-flight
        let start_time = Instant::now();
        while test_db.get_job(job_id).await.status() != &JobStatus::Doing {
            if start_time.elapsed().as_secs() > 5 {
                panic!("The job should have been fetched by now");
            }
            sleep(Duration::from_millis(20)).await;
        }
        worker.request_shutdown();

        // The worker exits cleanly and the in-flight job finished
        timeout(Duration::from_secs(5), worker_fut)
            .await
            .expect("The worker should shut down within the grace period")
            .expect("Failed to join worker");

        assert_eq!(QUICK_CALL_COUNT.get().await, 1);
        let job = test_db.get_job(job_id).await;
        assert_eq!(job.status(), &JobStatus::Succeeded);
    })
    .await;
}

#[tokio::test]
async fn a_handler_past_the_grace_period_returns_its_job_to_the_queue() {
    #[derive(Serialize, Deserialize)]
    struct Stuck {}

    impl Task for Stuck {
        const NAME: &'static str = "stuck";

        fn retry_policy() -> RetryPolicy {
            RetryPolicy::new(25, Backoff::Fixed(Duration::ZERO))
        }

        async fn run(self, ctx: JobContext) -> impl IntoTaskResult {
            // Honor cancellation; otherwise pretend to hang
            ctx.cancellation_token().cancelled().await;
            Err::<(), _>(TaskError::Retry)
        }
    }

    with_test_db(|test_db| async move {
        test_db.migrate().await;
        let store = test_db.job_store();

        let job_id = store
            .defer_task(Stuck {}, DeferSpec::default())
            .await
            .expect("Failed to defer job");

        let worker = test_db
            .create_worker_options()
            .polling_interval(Duration::from_millis(100))
            .graceful_shutdown_timeout(Duration::from_millis(200))
            .define_task::<Stuck>()
            .init()
            .await
            .expect("Failed to create worker");

        let worker = std::rc::Rc::new(worker);
        let worker_2 = worker.clone();
        let worker_fut = spawn_local(async move {
            worker_2.run().await.expect("Failed to run worker");
        });

        let start_time = Instant::now();
        while test_db.get_job(job_id).await.status() != &JobStatus::Doing {
            if start_time.elapsed().as_secs() > 5 {
                panic!("The job should have been fetched by now");
            }
            sleep(Duration::from_millis(20)).await;
        }
        worker.request_shutdown();

        timeout(Duration::from_secs(5), worker_fut)
            .await
            .expect("The worker should shut down after the grace period")
            .expect("Failed to join worker");

        // The cancelled handler asked for a retry: back to the queue
        let job = test_db.get_job(job_id).await;
        assert_eq!(job.status(), &JobStatus::Todo);
        assert_eq!(job.attempts(), &1);
    })
    .await;
}
