//! The persistence gateway seam.
//!
//! The daemon only ever talks to storage through [`Gateway`]: parameterized
//! [`Statement`]s in, rows and generated identifiers out. Any error returned
//! here is treated as transient by the session retry policy.

use loadpub_common::render::render_decimal;
use loadpub_common::util::escape_value;
use rusqlite::types::{ToSql, ToSqlOutput, Value as SqliteValue};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to prepare data directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("failed to seal secret: {0}")]
    Seal(String),

    #[error("unexpected row shape: {0}")]
    RowShape(String),
}

/// A single bound value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Literal form used by [`Statement::render`].
    fn render(&self) -> String {
        match self {
            Self::Null => "NULL".to_string(),
            Self::Integer(i) => i.to_string(),
            Self::Real(r) => render_decimal(*r),
            Self::Text(s) => format!("'{}'", escape_value(s)),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<u32> for SqlValue {
    fn from(value: u32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<u16> for SqlValue {
    fn from(value: u16) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<u64> for SqlValue {
    fn from(value: u64) -> Self {
        // Counters never approach i64::MAX; saturate rather than wrap.
        Self::Integer(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<&String> for SqlValue {
    fn from(value: &String) -> Self {
        Self::Text(value.clone())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Owned(SqliteValue::Null),
            Self::Integer(i) => ToSqlOutput::Owned(SqliteValue::Integer(*i)),
            Self::Real(r) => ToSqlOutput::Owned(SqliteValue::Real(*r)),
            Self::Text(s) => ToSqlOutput::Borrowed(s.as_str().into()),
        })
    }
}

/// One result row.
pub type Row = Vec<SqlValue>;

/// Parameterized statement: SQL text with `?` placeholders plus bound values.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Append the value for the next placeholder.
    #[must_use]
    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.params.push(value.into());
        self
    }

    /// Text form with every placeholder replaced by its escaped literal.
    ///
    /// Used for audit logs of dropped work (see [`AuditedGateway`]), never
    /// for execution.
    pub fn render(&self) -> String {
        let mut rendered = String::with_capacity(self.sql.len() + 16 * self.params.len());
        let mut params = self.params.iter();
        for c in self.sql.chars() {
            if c == '?' {
                match params.next() {
                    Some(value) => rendered.push_str(&value.render()),
                    None => rendered.push(c),
                }
            } else {
                rendered.push(c);
            }
        }
        rendered
    }
}

/// Durable store used by one session.
pub trait Gateway: Send {
    /// Whether the store is reachable right now.
    fn can_connect(&mut self) -> bool;

    fn execute(&mut self, statement: &Statement) -> Result<(), StoreError>;

    fn query(&mut self, statement: &Statement) -> Result<Vec<Row>, StoreError>;

    /// Identifier generated by the most recent insert on this gateway.
    fn last_inserted_id(&mut self) -> Result<i64, StoreError>;

    /// Execute an insert and return the identifier it generated.
    fn insert(&mut self, statement: &Statement) -> Result<i64, StoreError> {
        self.execute(statement)?;
        self.last_inserted_id()
    }
}

/// Gateway wrapper that remembers the rendered form of the last statement
/// the store rejected.
pub struct AuditedGateway<'a> {
    inner: &'a mut dyn Gateway,
    failed: Option<String>,
}

impl<'a> AuditedGateway<'a> {
    pub fn new(inner: &'a mut dyn Gateway) -> Self {
        Self {
            inner,
            failed: None,
        }
    }

    pub fn into_failed_statement(self) -> Option<String> {
        self.failed
    }

    fn audit<T>(
        &mut self,
        statement: &Statement,
        result: Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        if result.is_err() {
            self.failed = Some(statement.render());
        }
        result
    }
}

impl Gateway for AuditedGateway<'_> {
    fn can_connect(&mut self) -> bool {
        self.inner.can_connect()
    }

    fn execute(&mut self, statement: &Statement) -> Result<(), StoreError> {
        let result = self.inner.execute(statement);
        self.audit(statement, result)
    }

    fn query(&mut self, statement: &Statement) -> Result<Vec<Row>, StoreError> {
        let result = self.inner.query(statement);
        self.audit(statement, result)
    }

    fn last_inserted_id(&mut self) -> Result<i64, StoreError> {
        self.inner.last_inserted_id()
    }
}
