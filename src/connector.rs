use getset::Getters;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::PgPool;

use crate::errors::Result;

/// Owns every database connection used by a process: a pool for SQL calls
/// and, on demand, a dedicated LISTEN connection.
///
/// The SQL layer stays generic over `impl PgExecutor`, so anything that can
/// execute a statement — the pool, one connection, a transaction — can
/// carry the protocol; the connector is just the thing that owns them.
#[derive(Clone, Getters)]
#[getset(get = "pub")]
pub struct Connector {
    pool: PgPool,
}

impl Connector {
    /// Connect a pool of `pool_size` connections to `database_url`.
    /// Configuration errors (bad DSN, failed auth) surface here.
    pub async fn connect(database_url: &str, pool_size: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A dedicated LISTEN connection subscribed to `channels`. The caller
    /// owns reconnection; `PgListener::recv` re-issues the subscriptions
    /// after a connection loss.
    pub async fn listener(&self, channels: &[String]) -> Result<PgListener> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        let channels: Vec<&str> = channels.iter().map(String::as_str).collect();
        listener.listen_all(channels).await?;

        Ok(listener)
    }

    /// Drain and release all connections.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
