//! Free-form statements issued by scripts through the `db` global.

use super::value::{bind_value, decode_row, SqlRow, SqlValue, Statement};
use super::DbPool;
use crate::Result;

/// Repository running script-supplied SQL with positional parameters.
pub struct QueryRepository<'a> {
    pool: &'a DbPool,
}

impl<'a> QueryRepository<'a> {
    pub fn new(pool: &'a DbPool) -> Self {
        Self { pool }
    }

    /// Run a query and decode every returned row.
    pub async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_value(query, param);
        }
        let rows = query.fetch_all(self.pool).await?;
        Ok(rows.iter().map(decode_row).collect())
    }

    /// Run a statement and return the number of affected rows.
    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_value(query, param);
        }
        Ok(query.execute(self.pool).await?.rows_affected())
    }

    /// Run statements atomically. Either all of them apply or none do.
    pub async fn execute_batch(&self, statements: &[Statement]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut affected = 0;
        for statement in statements {
            let mut query = sqlx::query(&statement.sql);
            for param in &statement.params {
                query = bind_value(query, param);
            }
            affected += query.execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(affected)
    }
}
