use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

/// `SQLite` database handle for position synchronization state.
///
/// Owns the connection pool and runs embedded migrations at connect time.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Creates a new database connection pool.
    ///
    /// The database file is created if it does not exist.
    ///
    /// # Arguments
    ///
    /// * `database_url` - `SQLite` database path (e.g., `<sqlite://possync.db>`)
    /// * `max_connections` - connection pool size
    ///
    /// # Errors
    ///
    /// Returns error if connection fails or migrations fail.
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Creates an in-memory database for tests and ephemeral runs.
    ///
    /// Uses a single never-recycled connection so every caller shares the
    /// same in-memory instance for the pool's whole lifetime.
    ///
    /// # Errors
    ///
    /// Returns error if connection fails or migrations fail.
    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Returns the underlying pool for repository construction.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
