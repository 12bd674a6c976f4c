//! Durable SQLite storage for the server: transfer journal + audit stream.
//!
//! # SQLite durability settings
//! Applied at open: WAL, synchronous=FULL, wal_autocheckpoint=1000,
//! foreign_keys=ON. PRAGMA integrity_check runs at open; returns error if
//! it fails. Every mutating journal call commits before returning, so a
//! status change acknowledged to a peer is never lost to a crash.

pub mod journal;

use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

const SCHEMA_SQL: &str = include_str!("schema.sql");

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Integrity check failed: {0}")]
    IntegrityCheckFailed(String),
    #[error("transfer not found: {0}")]
    NotFound(String),
    #[error("illegal status transition {from} -> {to} for transfer {transfer_id}")]
    IllegalTransition {
        transfer_id: String,
        from: String,
        to: String,
    },
    #[error("retry refused: {0}")]
    RetryRefused(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Shared handle to the server database. Cheap to clone; all access is
/// serialized through one connection.
#[derive(Clone)]
pub struct Db {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;
             PRAGMA wal_autocheckpoint=1000;
             PRAGMA foreign_keys=ON;",
        )?;
        let result: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        if result != "ok" {
            return Err(StorageError::IntegrityCheckFailed(result));
        }
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Db {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

/// UTC timestamp in RFC 3339 with millisecond precision.
pub(crate) fn now_utc() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
