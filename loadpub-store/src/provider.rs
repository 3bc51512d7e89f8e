//! Result-set provisioning: mapping a result-set id to a database.

use crate::gateway::{Gateway, StoreError};
use crate::schema::{apply_catalog_schema, apply_result_set_schema};
use crate::sqlite::SqliteGateway;
use loadpub_common::types::ResultSetId;
use rusqlite::{Connection, params};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const CATALOG_FILE: &str = "catalog.sqlite3";

/// Where a result set's data lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub result_set: ResultSetId,
    pub path: PathBuf,
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.result_set, self.path.display())
    }
}

/// Source of gateways for result sets.
pub trait StoreProvider: Send + Sync {
    /// Startup check: the store must be usable before the listener binds.
    fn check(&self) -> Result<(), StoreError>;

    /// Create (or find) the storage for `result_set`.
    fn provision(&self, result_set: &ResultSetId) -> Result<ConnectionDescriptor, StoreError>;

    /// Open a gateway on provisioned storage.
    fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Box<dyn Gateway>, StoreError>;
}

/// One SQLite database per result set under `data_dir`, plus a catalog.
#[derive(Debug, Clone)]
pub struct SqliteProvider {
    data_dir: PathBuf,
}

impl SqliteProvider {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn ensure_data_dir(&self) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.data_dir).map_err(|source| StoreError::Io {
            path: self.data_dir.clone(),
            source,
        })
    }

    fn open_catalog(&self) -> Result<Connection, StoreError> {
        self.ensure_data_dir()?;
        let conn = Connection::open(self.data_dir.join(CATALOG_FILE))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        apply_catalog_schema(&conn)?;
        Ok(conn)
    }

    /// Database path for `result_set`.
    pub fn database_path(&self, result_set: &ResultSetId) -> PathBuf {
        self.data_dir.join(database_file_name(result_set))
    }
}

/// File-system safe name, disambiguated by a digest of the raw id.
fn database_file_name(result_set: &ResultSetId) -> String {
    let sanitized: String = result_set
        .as_str()
        .chars()
        .take(64)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let digest = hex::encode(Sha256::digest(result_set.as_str().as_bytes()));
    format!("rs-{sanitized}-{}.sqlite3", &digest[..8])
}

impl StoreProvider for SqliteProvider {
    fn check(&self) -> Result<(), StoreError> {
        let conn = self.open_catalog()?;
        let one: i64 = conn.query_row("SELECT 1", [], |row| row.get(0))?;
        if one != 1 {
            return Err(StoreError::Unavailable("catalog lookup failed".to_string()));
        }
        info!(data_dir = %self.data_dir.display(), "Store reachable");
        Ok(())
    }

    fn provision(&self, result_set: &ResultSetId) -> Result<ConnectionDescriptor, StoreError> {
        let catalog = self.open_catalog()?;

        let existing: Option<String> = catalog
            .query_row(
                "SELECT path FROM result_sets WHERE result_set_id = ?1",
                params![result_set.as_str()],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let path = match existing {
            Some(path) => PathBuf::from(path),
            None => self.database_path(result_set),
        };

        let db = Connection::open(&path)?;
        apply_result_set_schema(&db)?;
        drop(db);

        catalog.execute(
            "INSERT OR IGNORE INTO result_sets(result_set_id, path, created_at) VALUES (?1, ?2, ?3)",
            params![
                result_set.as_str(),
                path.to_string_lossy(),
                chrono::Utc::now().to_rfc3339()
            ],
        )?;

        debug!(result_set = %result_set, path = %path.display(), "Provisioned result set");
        Ok(ConnectionDescriptor {
            result_set: result_set.clone(),
            path,
        })
    }

    fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Box<dyn Gateway>, StoreError> {
        Ok(Box::new(SqliteGateway::open(&descriptor.path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Statement;
    use tempfile::TempDir;

    #[test]
    fn check_creates_catalog() {
        let dir = TempDir::new().unwrap();
        let provider = SqliteProvider::new(dir.path().join("nested").join("data"));
        provider.check().unwrap();
        assert!(provider.data_dir().join(CATALOG_FILE).exists());
    }

    #[test]
    fn check_fails_when_data_dir_is_a_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("occupied");
        std::fs::write(&file, b"x").unwrap();

        let provider = SqliteProvider::new(&file);
        assert!(matches!(provider.check(), Err(StoreError::Io { .. })));
    }

    #[test]
    fn provision_is_stable_and_recorded() {
        let dir = TempDir::new().unwrap();
        let provider = SqliteProvider::new(dir.path());
        let id = ResultSetId::new("nightly/42");

        let first = provider.provision(&id).unwrap();
        let second = provider.provision(&id).unwrap();
        assert_eq!(first, second);
        assert!(first.path.exists());

        let file_name = first.path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(file_name.starts_with("rs-nightly_42-"));

        let catalog = Connection::open(dir.path().join(CATALOG_FILE)).unwrap();
        let count: i64 = catalog
            .query_row("SELECT COUNT(*) FROM result_sets", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn similar_ids_get_distinct_databases() {
        let dir = TempDir::new().unwrap();
        let provider = SqliteProvider::new(dir.path());
        let a = provider.provision(&ResultSetId::new("a/b")).unwrap();
        let b = provider.provision(&ResultSetId::new("a:b")).unwrap();
        assert_ne!(a.path, b.path);
    }

    #[test]
    fn connect_opens_provisioned_schema() {
        let dir = TempDir::new().unwrap();
        let provider = SqliteProvider::new(dir.path());
        let descriptor = provider.provision(&ResultSetId::new("rs-1")).unwrap();

        let mut gateway = provider.connect(&descriptor).unwrap();
        assert!(gateway.can_connect());
        gateway
            .execute(&Statement::new("INSERT INTO results_ready_state(state) VALUES (?)").bind("Ready"))
            .unwrap();
    }
}
