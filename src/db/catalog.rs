//! Live column catalog used as an allow-list for custom field access.
//!
//! Scripts may read and write arbitrary columns of the entity tables, but
//! only columns that actually exist in the live schema. The only way to get
//! an [`AllowedColumn`] is through a [`ColumnCatalog`] fetched from the
//! database, so no unvalidated identifier ever reaches the SQL text.

use super::value::{bind_value, SqlValue};
use super::DbPool;
use crate::Result;

#[cfg(feature = "sqlite")]
const CATALOG_SQL: &str = "SELECT name FROM pragma_table_info($1) ORDER BY cid";
#[cfg(feature = "postgres")]
const CATALOG_SQL: &str = "SELECT column_name::text FROM information_schema.columns
     WHERE table_catalog = current_database() AND table_schema = current_schema()
       AND table_name = $1
     ORDER BY ordinal_position";

/// Column names of one table, as reported by the live schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnCatalog {
    table: &'static str,
    columns: Vec<String>,
}

impl ColumnCatalog {
    pub fn new(table: &'static str, columns: Vec<String>) -> Self {
        Self { table, columns }
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Validate a column name against the catalog.
    pub fn allow(&self, name: &str) -> Option<AllowedColumn> {
        self.columns
            .iter()
            .find(|c| c.as_str() == name)
            .map(|c| AllowedColumn {
                table: self.table,
                column: c.clone(),
            })
    }
}

/// A column that was found in the live catalog of its table.
#[derive(Debug, Clone, PartialEq)]
pub struct AllowedColumn {
    table: &'static str,
    column: String,
}

impl AllowedColumn {
    pub fn table(&self) -> &'static str {
        self.table
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    fn quoted(&self) -> String {
        quote_ident(&self.column)
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Repository for catalog lookups and custom field access.
pub struct CatalogRepository<'a> {
    pool: &'a DbPool,
}

impl<'a> CatalogRepository<'a> {
    pub fn new(pool: &'a DbPool) -> Self {
        Self { pool }
    }

    /// Fetch the column catalog of a table.
    pub async fn columns(&self, table: &'static str) -> Result<ColumnCatalog> {
        let columns: Vec<String> = sqlx::query_scalar(CATALOG_SQL)
            .bind(table)
            .fetch_all(self.pool)
            .await?;
        Ok(ColumnCatalog::new(table, columns))
    }

    /// Read a column of one row as text. `None` means the row is missing or
    /// the value is NULL.
    pub async fn read_field(&self, column: &AllowedColumn, id: i64) -> Result<Option<String>> {
        let sql = format!(
            "SELECT CAST({} AS TEXT) FROM {} WHERE id = $1",
            column.quoted(),
            column.table()
        );
        let value: Option<Option<String>> = sqlx::query_scalar(&sql)
            .bind(id)
            .fetch_optional(self.pool)
            .await?;
        Ok(value.flatten())
    }

    /// Write a column of one row. Returns the number of rows changed.
    pub async fn write_field(
        &self,
        column: &AllowedColumn,
        id: i64,
        value: &SqlValue,
    ) -> Result<u64> {
        let sql = format!(
            "UPDATE {} SET {} = $1 WHERE id = $2",
            column.table(),
            column.quoted()
        );
        let query = bind_value(sqlx::query(&sql), value).bind(id);
        let result = query.execute(self.pool).await?;
        Ok(result.rows_affected())
    }
}
