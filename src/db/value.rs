//! Backend-neutral SQL values crossing the script boundary.

use sqlx::{Column, Row};

use super::{Db, DbArguments, DbRow};

/// A single SQL value, either bound as a parameter or decoded from a row.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bool(bool),
}

impl SqlValue {
    /// Integer view of the value, if it has one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(i) => Some(*i),
            SqlValue::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    /// Text view of the value, if it is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

/// A decoded row: column names in select order with their values.
pub type SqlRow = Vec<(String, SqlValue)>;

/// A statement with its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

pub(crate) fn bind_value<'q>(
    query: sqlx::query::Query<'q, Db, DbArguments<'q>>,
    value: &SqlValue,
) -> sqlx::query::Query<'q, Db, DbArguments<'q>> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Integer(i) => query.bind(*i),
        SqlValue::Real(f) => query.bind(*f),
        SqlValue::Text(s) => query.bind(s.clone()),
        SqlValue::Bool(b) => query.bind(*b),
    }
}

/// Decode a row without knowing its shape up front.
///
/// Each column is tried as integer, real, text and boolean in that order;
/// a column matching none of them comes back as `Null`.
pub(crate) fn decode_row(row: &DbRow) -> SqlRow {
    row.columns()
        .iter()
        .map(|column| {
            let i = column.ordinal();
            (column.name().to_string(), decode_column(row, i))
        })
        .collect()
}

fn decode_column(row: &DbRow, i: usize) -> SqlValue {
    if let Ok(v) = row.try_get::<Option<i64>, _>(i) {
        return v.map(SqlValue::Integer).unwrap_or(SqlValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(i) {
        return v
            .map(|v| SqlValue::Integer(v as i64))
            .unwrap_or(SqlValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(i) {
        return v.map(SqlValue::Real).unwrap_or(SqlValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(i) {
        return v.map(SqlValue::Text).unwrap_or(SqlValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(i) {
        return v.map(SqlValue::Bool).unwrap_or(SqlValue::Null);
    }
    SqlValue::Null
}
