//! SQLite-backed [`Gateway`].

use crate::gateway::{Gateway, Row, SqlValue, Statement, StoreError};
use crate::schema::apply_result_set_schema;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, params_from_iter};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, trace};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Gateway over one result-set database file.
pub struct SqliteGateway {
    conn: Connection,
    path: PathBuf,
}

impl SqliteGateway {
    /// Open (creating if needed) the database at `path` and ensure its schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        prepare(&conn)?;
        debug!(path = %path.display(), "Opened result-set database");
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// In-memory database with the result-set schema applied.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        prepare(&conn)?;
        Ok(Self {
            conn,
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Connection setup shared by file and in-memory gateways. Dangling
/// references fail the statement.
fn prepare(conn: &Connection) -> Result<(), StoreError> {
    conn.pragma_update(None, "foreign_keys", true)?;
    apply_result_set_schema(conn)?;
    Ok(())
}

impl std::fmt::Debug for SqliteGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteGateway")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn to_sql_value(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(r) => SqlValue::Real(r),
        ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => SqlValue::Text(hex::encode(b)),
    }
}

impl Gateway for SqliteGateway {
    fn can_connect(&mut self) -> bool {
        self.conn
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }

    fn execute(&mut self, statement: &Statement) -> Result<(), StoreError> {
        trace!(sql = %statement.sql, "execute");
        self.conn
            .execute(&statement.sql, params_from_iter(statement.params.iter()))?;
        Ok(())
    }

    fn query(&mut self, statement: &Statement) -> Result<Vec<Row>, StoreError> {
        trace!(sql = %statement.sql, "query");
        let mut prepared = self.conn.prepare(&statement.sql)?;
        let columns = prepared.column_count();
        let mut rows = prepared.query(params_from_iter(statement.params.iter()))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns);
            for idx in 0..columns {
                values.push(to_sql_value(row.get_ref(idx)?));
            }
            out.push(values);
        }
        Ok(out)
    }

    fn last_inserted_id(&mut self) -> Result<i64, StoreError> {
        Ok(self.conn.last_insert_rowid())
    }
}
