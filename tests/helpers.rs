#![allow(dead_code)]

use procrastinate::{Connector, Job, JobFilter, JobStore, WorkerOptions};
use sqlx::postgres::PgConnectOptions;
use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::LocalSet;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug)]
pub struct TestDatabase {
    pub source_pool: PgPool,
    pub test_pool: PgPool,
    pub name: String,
}

impl TestDatabase {
    async fn drop(&self) {
        self.test_pool.close().await;
        sqlx::query(&format!("DROP DATABASE {} WITH (FORCE)", self.name))
            .execute(&self.source_pool)
            .await
            .expect("Failed to drop test database");
    }

    pub fn create_worker_options(&self) -> WorkerOptions {
        WorkerOptions::default()
            .pg_pool(self.test_pool.clone())
            .concurrency(4)
            .polling_interval(Duration::from_millis(500))
    }

    pub fn job_store(&self) -> JobStore {
        JobStore::new(Connector::from_pool(self.test_pool.clone()), "public".into())
    }

    pub async fn migrate(&self) {
        self.job_store().migrate().await.expect("Failed to migrate");
    }

    pub async fn get_jobs(&self) -> Vec<Job> {
        self.job_store()
            .list_jobs(&JobFilter::default())
            .await
            .expect("Failed to list jobs")
    }

    pub async fn get_job(&self, job_id: i64) -> Job {
        let jobs = self
            .job_store()
            .list_jobs(&JobFilter {
                id: Some(job_id),
                ..Default::default()
            })
            .await
            .expect("Failed to list jobs");

        jobs.into_iter().next().expect("Job not found")
    }

    /// Rewind every event of a job, as if it happened `seconds` earlier.
    /// Lets janitor tests age jobs without sleeping.
    pub async fn backdate_events(&self, job_id: i64, seconds: f64) {
        sqlx::query(
            r#"
                update procrastinate_events
                    set at = at - make_interval(secs => $2::double precision)
                    where job_id = $1
            "#,
        )
        .bind(job_id)
        .bind(seconds)
        .execute(&self.test_pool)
        .await
        .expect("Failed to backdate events");
    }

    /// Make a scheduled job ready immediately.
    pub async fn make_job_ready(&self, job_id: i64) {
        sqlx::query("update procrastinate_jobs set scheduled_at = now() where id = $1")
            .bind(job_id)
            .execute(&self.test_pool)
            .await
            .expect("Failed to update job schedule");
    }
}

pub async fn create_test_database() -> TestDatabase {
    let db_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let mut pg_conn_options: PgConnectOptions =
        db_url.parse().expect("Failed to parse DATABASE_URL");
    pg_conn_options = pg_conn_options.application_name("__test_procrastinate");

    let pg_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(4)
        .connect_with(pg_conn_options.clone())
        .await
        .expect("Failed to connect to database");

    let db_id = uuid::Uuid::now_v7();
    let db_name = format!("__test_procrastinate_{}", db_id.simple());

    sqlx::query(&format!("CREATE DATABASE {}", db_name))
        .execute(&pg_pool)
        .await
        .expect("Failed to create test database");

    let test_options = pg_conn_options.database(&db_name);

    let test_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(4)
        .connect_with(test_options)
        .await
        .expect("Failed to connect to test database");

    TestDatabase {
        source_pool: pg_pool,
        test_pool,
        name: db_name,
    }
}

pub async fn with_test_db<F, Fut>(test_fn: F)
where
    F: FnOnce(TestDatabase) -> Fut + 'static,
    Fut: std::future::Future<Output = ()>,
{
    let local_set = LocalSet::new();

    local_set
        .run_until(async move {
            let test_db = create_test_database().await;
            let test_db_2 = test_db.clone();

            let result = tokio::task::spawn_local(async move {
                test_fn(test_db_2).await;
            })
            .await;

            test_db.drop().await;
            result.expect("Test failed");
        })
        .await;
}

pub struct StaticCounter {
    cell: OnceCell<Mutex<u32>>,
}
async fn init_job_count() -> Mutex<u32> {
    Mutex::new(0)
}
impl StaticCounter {
    pub const fn new() -> Self {
        Self {
            cell: OnceCell::const_new(),
        }
    }

    pub async fn increment(&self) -> u32 {
        let cell = self.cell.get_or_init(init_job_count).await;
        let mut count = cell.lock().await;
        *count += 1;
        *count
    }

    pub async fn get(&self) -> u32 {
        let cell = self.cell.get_or_init(init_job_count).await;
        *cell.lock().await
    }
}

pub async fn enable_logs() {
    static ONCE: OnceCell<()> = OnceCell::const_new();

    ONCE.get_or_init(|| async {
        let fmt_layer = tracing_subscriber::fmt::layer();
        // Log level set to debug except for sqlx set at warn (to not show all sql requests)
        let filter_layer = EnvFilter::try_new("debug,sqlx=warn").unwrap();

        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .init();
    })
    .await;
}
