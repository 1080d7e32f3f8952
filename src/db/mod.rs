//! Database module for Castro.
//!
//! The engine itself only talks to the database through the synchronous
//! [`DataLayer`] trait. [`SqlDataLayer`] implements it on top of the async
//! sqlx repositories in this module.

mod catalog;
mod extension;
mod player;
mod query;
mod schema;
mod store;
mod value;

pub use catalog::{AllowedColumn, CatalogRepository, ColumnCatalog};
pub use extension::{ExtensionKind, ExtensionRecord, ExtensionRepository};
pub use player::{
    Account, AccountRepository, Guild, NewAccount, NewPlayer, Player, PlayerRepository,
    StorageValue,
};
pub use query::QueryRepository;
pub use schema::{extension_tables, MIGRATIONS};
pub use store::SqlDataLayer;
pub use value::{SqlRow, SqlValue, Statement};

use tracing::{debug, info};

use crate::Result;

#[cfg(feature = "sqlite")]
pub type Db = sqlx::Sqlite;
#[cfg(feature = "postgres")]
pub type Db = sqlx::Postgres;

/// Connection pool for the configured backend.
pub type DbPool = sqlx::Pool<Db>;
pub type DbRow = <Db as sqlx::Database>::Row;
pub(crate) type DbArguments<'q> = <Db as sqlx::Database>::Arguments<'q>;

#[cfg(feature = "sqlite")]
pub(crate) const SQL_TRUE: &str = "1";
#[cfg(feature = "postgres")]
pub(crate) const SQL_TRUE: &str = "TRUE";

/// Synchronous view of the data the engine and its scripts need.
///
/// Scripts run on blocking worker threads and call into this trait from Lua
/// callbacks, so every method blocks until the data is available.
pub trait DataLayer: Send + Sync {
    /// Enabled extensions of a kind, in merge order.
    fn enabled_extensions(&self, kind: ExtensionKind) -> Result<Vec<ExtensionRecord>>;

    fn player_by_id(&self, id: i64) -> Result<Option<Player>>;
    fn player_by_name(&self, name: &str) -> Result<Option<Player>>;
    fn account_by_id(&self, id: i64) -> Result<Option<Account>>;
    fn account_by_name(&self, name: &str) -> Result<Option<Account>>;
    fn account_player_names(&self, account_id: i64) -> Result<Vec<String>>;

    fn player_guild(&self, player_id: i64) -> Result<Option<Guild>>;
    fn set_bank_balance(&self, player_id: i64, balance: i64) -> Result<()>;
    fn is_online(&self, player_id: i64) -> Result<bool>;
    fn storage_value(&self, player_id: i64, key: i64) -> Result<Option<StorageValue>>;
    fn set_storage_value(&self, player_id: i64, key: i64, value: i64) -> Result<()>;

    /// Live column catalog of an entity table.
    fn table_columns(&self, table: &'static str) -> Result<ColumnCatalog>;
    fn custom_field(&self, column: &AllowedColumn, id: i64) -> Result<Option<String>>;
    fn set_custom_field(&self, column: &AllowedColumn, id: i64, value: &SqlValue) -> Result<u64>;

    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>>;
    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64>;
    /// Apply statements in a single transaction.
    fn execute_batch(&self, statements: &[Statement]) -> Result<u64>;
}

/// Database wrapper owning the sqlx pool.
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Connect to the database at `url` and apply pending migrations.
    #[cfg(feature = "sqlite")]
    pub async fn open(url: &str, max_connections: u32) -> Result<Self> {
        use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
        use std::str::FromStr;

        info!("Opening database at {}", url);
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Connect to the database at `url` and apply pending migrations.
    #[cfg(feature = "postgres")]
    pub async fn open(url: &str, max_connections: u32) -> Result<Self> {
        use sqlx::postgres::PgPoolOptions;

        info!("Opening database at {}", url);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Open an in-memory database for testing.
    ///
    /// A single connection that never expires keeps the in-memory database
    /// alive for the lifetime of the pool.
    #[cfg(feature = "sqlite")]
    pub async fn open_in_memory() -> Result<Self> {
        use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
        use std::str::FromStr;

        debug!("Opening in-memory database");
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Get the current schema version.
    pub async fn schema_version(&self) -> Result<i64> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version     BIGINT PRIMARY KEY,
                applied_at  BIGINT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
            .fetch_one(&self.pool)
            .await?;
        Ok(version.unwrap_or(0))
    }

    /// Apply pending migrations, each in its own transaction.
    pub async fn migrate(&self) -> Result<()> {
        let current_version = self.schema_version().await?;

        if current_version as usize >= MIGRATIONS.len() {
            debug!("Database is up to date (version {})", current_version);
            return Ok(());
        }

        info!(
            "Migrating database from version {} to {}",
            current_version,
            MIGRATIONS.len()
        );

        for (i, migration) in MIGRATIONS.iter().enumerate().skip(current_version as usize) {
            let version = (i + 1) as i64;
            let mut tx = self.pool.begin().await?;
            sqlx::raw_sql(migration).execute(&mut *tx).await?;
            sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES ($1, $2)")
                .bind(version)
                .bind(chrono::Utc::now().timestamp())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            debug!("Migration v{} applied successfully", version);
        }

        Ok(())
    }

    /// Create the extension tables for `prefix` if they do not exist yet.
    pub async fn ensure_extension_tables(&self, prefix: &str) -> Result<()> {
        sqlx::raw_sql(&extension_tables(prefix))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish()
    }
}
