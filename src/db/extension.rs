//! Persisted extension registry.
//!
//! Each extension kind has its own table, `<prefix>_extension_<kind>s`,
//! listing which extension ids are installed and whether they are enabled.

use std::fmt;
use std::str::FromStr;

use super::{DbPool, SQL_TRUE};
use crate::{CastroError, Result};

/// The kind of script tree an extension contributes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionKind {
    Page,
    Widget,
}

impl ExtensionKind {
    /// Plural directory name, also used as the virtual path prefix.
    pub fn dir_name(&self) -> &'static str {
        match self {
            ExtensionKind::Page => "pages",
            ExtensionKind::Widget => "widgets",
        }
    }

    /// Kind owning a virtual path, judged by its first segment.
    pub fn of_path(path: &str) -> Option<Self> {
        let first = path.split('/').next()?;
        if first.eq_ignore_ascii_case("pages") {
            Some(ExtensionKind::Page)
        } else if first.eq_ignore_ascii_case("widgets") {
            Some(ExtensionKind::Widget)
        } else {
            None
        }
    }

    /// Name of the persisted table for this kind.
    pub fn table_name(&self, prefix: &str) -> String {
        format!("{}_extension_{}", prefix, self.dir_name())
    }
}

impl fmt::Display for ExtensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtensionKind::Page => write!(f, "page"),
            ExtensionKind::Widget => write!(f, "widget"),
        }
    }
}

impl FromStr for ExtensionKind {
    type Err = CastroError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "page" | "pages" => Ok(ExtensionKind::Page),
            "widget" | "widgets" => Ok(ExtensionKind::Widget),
            other => Err(CastroError::Validation(format!(
                "unknown extension kind '{other}'"
            ))),
        }
    }
}

/// An installed extension.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtensionRecord {
    pub extension_id: String,
    pub kind: ExtensionKind,
    pub enabled: bool,
    /// Lower priorities are merged first; later merges win.
    pub priority: i64,
}

#[derive(sqlx::FromRow)]
struct ExtensionRow {
    extension_id: String,
    enabled: bool,
    priority: i64,
}

/// Repository for extension records.
pub struct ExtensionRepository<'a> {
    pool: &'a DbPool,
    prefix: &'a str,
}

impl<'a> ExtensionRepository<'a> {
    /// Create a new repository for tables named with `prefix`.
    pub fn new(pool: &'a DbPool, prefix: &'a str) -> Self {
        Self { pool, prefix }
    }

    /// List enabled extensions of a kind in merge order.
    ///
    /// Merge order is ascending priority, then ascending id, so the result
    /// never depends on how the database happens to return rows.
    pub async fn list_enabled(&self, kind: ExtensionKind) -> Result<Vec<ExtensionRecord>> {
        let sql = format!(
            "SELECT extension_id, enabled, priority FROM {} WHERE enabled = {} ORDER BY priority, extension_id",
            kind.table_name(self.prefix),
            SQL_TRUE
        );
        let rows: Vec<ExtensionRow> = sqlx::query_as(&sql).fetch_all(self.pool).await?;

        Ok(rows
            .into_iter()
            .map(|row| ExtensionRecord {
                extension_id: row.extension_id,
                kind,
                enabled: row.enabled,
                priority: row.priority,
            })
            .collect())
    }

    /// Install an extension, or update it if it already exists.
    pub async fn upsert(&self, record: &ExtensionRecord) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (extension_id, enabled, priority) VALUES ($1, $2, $3)
             ON CONFLICT (extension_id) DO UPDATE SET enabled = excluded.enabled, priority = excluded.priority",
            record.kind.table_name(self.prefix)
        );
        sqlx::query(&sql)
            .bind(&record.extension_id)
            .bind(record.enabled)
            .bind(record.priority)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// Enable or disable an installed extension.
    pub async fn set_enabled(
        &self,
        kind: ExtensionKind,
        extension_id: &str,
        enabled: bool,
    ) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET enabled = $1 WHERE extension_id = $2",
            kind.table_name(self.prefix)
        );
        let result = sqlx::query(&sql)
            .bind(enabled)
            .bind(extension_id)
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
