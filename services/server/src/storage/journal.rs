//! The transfer journal: persistent lifecycle records for every transfer.
//!
//! Status transitions move monotonically forward, with two sanctioned
//! exceptions: INTERRUPTED -> IN_PROGRESS on resume, and the
//! IN_PROGRESS <-> PAUSED pair for peer-coordinated suspension. Terminal
//! states (COMPLETED, FAILED, CANCELLED) never change again.

use super::{Db, StorageError, StorageResult, now_utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::fmt;
use uuid::Uuid;

/// Default retry budget for new transfers.
const DEFAULT_MAX_RETRIES: u32 = 3;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Server sends file data to the peer.
    Send,
    /// Server receives file data from the peer.
    Receive,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Send => "SEND",
            Direction::Receive => "RECEIVE",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "SEND" => Some(Direction::Send),
            "RECEIVE" => Some(Direction::Receive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Initiated,
    InProgress,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Interrupted,
    RetryPending,
}

impl TransferStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Initiated => "INITIATED",
            TransferStatus::InProgress => "IN_PROGRESS",
            TransferStatus::Paused => "PAUSED",
            TransferStatus::Completed => "COMPLETED",
            TransferStatus::Failed => "FAILED",
            TransferStatus::Cancelled => "CANCELLED",
            TransferStatus::Interrupted => "INTERRUPTED",
            TransferStatus::RetryPending => "RETRY_PENDING",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "INITIATED" => TransferStatus::Initiated,
            "IN_PROGRESS" => TransferStatus::InProgress,
            "PAUSED" => TransferStatus::Paused,
            "COMPLETED" => TransferStatus::Completed,
            "FAILED" => TransferStatus::Failed,
            "CANCELLED" => TransferStatus::Cancelled,
            "INTERRUPTED" => TransferStatus::Interrupted,
            "RETRY_PENDING" => TransferStatus::RetryPending,
            _ => return None,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }

    /// The sanctioned transition set.
    pub fn may_transition_to(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        match self {
            Initiated => matches!(next, InProgress | Failed | Cancelled | Interrupted),
            InProgress => matches!(next, Paused | Completed | Failed | Cancelled | Interrupted),
            Paused => matches!(next, InProgress | Failed | Cancelled | Interrupted),
            Interrupted => matches!(next, InProgress | RetryPending),
            RetryPending => matches!(next, InProgress | Interrupted | Cancelled),
            Completed | Failed | Cancelled => false,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transfer journal row.
#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub transfer_id: String,
    pub session_id: String,
    pub server_id: String,
    pub node_id: String,
    pub partner_id: String,
    pub filename: String,
    pub direction: Direction,
    pub status: TransferStatus,
    pub remote_address: Option<String>,
    pub local_path: Option<String>,
    pub file_size: u64,
    pub bytes_transferred: u64,
    pub last_sync_point: u64,
    pub sync_point_count: u32,
    /// Byte offset this attempt starts from (0 for fresh transfers,
    /// the parent's last sync point for retries).
    pub start_byte: u64,
    pub checksum: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub parent_transfer_id: Option<String>,
    pub started_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
    pub duration_ms: Option<u64>,
}

/// Arguments for `create_transfer`.
#[derive(Debug, Clone)]
pub struct NewTransfer<'a> {
    pub session_id: &'a str,
    pub server_id: &'a str,
    pub node_id: &'a str,
    pub partner_id: &'a str,
    pub filename: &'a str,
    pub direction: Direction,
    pub remote_address: Option<&'a str>,
}

// ---------------------------------------------------------------------------
// TransferJournal
// ---------------------------------------------------------------------------

/// Command interface over the `transfers` table. Clone freely; all clones
/// share the underlying connection.
#[derive(Clone)]
pub struct TransferJournal {
    db: Db,
}

impl TransferJournal {
    pub fn new(db: Db) -> Self {
        TransferJournal { db }
    }

    /// Insert a new record with status INITIATED and return its id.
    pub async fn create_transfer(&self, new: NewTransfer<'_>) -> StorageResult<String> {
        let transfer_id = Uuid::new_v4().to_string();
        let now = now_utc();
        let conn = self.db.conn.lock().await;
        conn.execute(
            "INSERT INTO transfers
                 (transfer_id, session_id, server_id, node_id, partner_id, filename,
                  direction, status, remote_address, max_retries, started_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
            params![
                transfer_id,
                new.session_id,
                new.server_id,
                new.node_id,
                new.partner_id,
                new.filename,
                new.direction.as_str(),
                TransferStatus::Initiated.as_str(),
                new.remote_address,
                DEFAULT_MAX_RETRIES,
                now,
            ],
        )?;
        Ok(transfer_id)
    }

    /// INITIATED -> IN_PROGRESS, recording file size and local path.
    pub async fn start_transfer(
        &self,
        transfer_id: &str,
        file_size: u64,
        local_path: Option<&str>,
    ) -> StorageResult<()> {
        let conn = self.db.conn.lock().await;
        let current = Self::status_of(&conn, transfer_id)?;
        Self::check_transition(transfer_id, current, TransferStatus::InProgress)?;
        conn.execute(
            "UPDATE transfers
             SET status = ?2, file_size = ?3, local_path = COALESCE(?4, local_path),
                 updated_at = ?5
             WHERE transfer_id = ?1",
            params![
                transfer_id,
                TransferStatus::InProgress.as_str(),
                file_size as i64,
                local_path,
                now_utc(),
            ],
        )?;
        Ok(())
    }

    /// Low-frequency progress update; callers debounce.
    pub async fn update_progress(&self, transfer_id: &str, bytes: u64) -> StorageResult<()> {
        let conn = self.db.conn.lock().await;
        conn.execute(
            "UPDATE transfers SET bytes_transferred = ?2, updated_at = ?3
             WHERE transfer_id = ?1",
            params![transfer_id, bytes as i64, now_utc()],
        )?;
        Ok(())
    }

    /// Record an acknowledged sync point and bump the counter.
    pub async fn record_sync_point(&self, transfer_id: &str, position: u64) -> StorageResult<()> {
        let conn = self.db.conn.lock().await;
        conn.execute(
            "UPDATE transfers
             SET last_sync_point = ?2, sync_point_count = sync_point_count + 1,
                 bytes_transferred = MAX(bytes_transferred, ?2), updated_at = ?3
             WHERE transfer_id = ?1",
            params![transfer_id, position as i64, now_utc()],
        )?;
        Ok(())
    }

    /// Terminal success; records checksum, final byte count, and duration.
    pub async fn complete_transfer(
        &self,
        transfer_id: &str,
        bytes: u64,
        checksum: Option<&str>,
    ) -> StorageResult<()> {
        let conn = self.db.conn.lock().await;
        let record = Self::fetch(&conn, transfer_id)?;
        Self::check_transition(transfer_id, record.status, TransferStatus::Completed)?;
        let now = now_utc();
        let duration_ms = chrono::DateTime::parse_from_rfc3339(&record.started_at)
            .ok()
            .map(|t| (chrono::Utc::now() - t.with_timezone(&chrono::Utc)).num_milliseconds().max(0));
        conn.execute(
            "UPDATE transfers
             SET status = ?2, bytes_transferred = ?3, checksum = COALESCE(?4, checksum),
                 completed_at = ?5, updated_at = ?5, duration_ms = ?6
             WHERE transfer_id = ?1",
            params![
                transfer_id,
                TransferStatus::Completed.as_str(),
                bytes as i64,
                checksum,
                now,
                duration_ms,
            ],
        )?;
        Ok(())
    }

    pub async fn fail_transfer(
        &self,
        transfer_id: &str,
        error_code: &str,
        error_message: &str,
    ) -> StorageResult<()> {
        self.terminate(transfer_id, TransferStatus::Failed, error_code, error_message)
            .await
    }

    pub async fn cancel_transfer(&self, transfer_id: &str, reason: &str) -> StorageResult<()> {
        self.terminate(transfer_id, TransferStatus::Cancelled, "CANCELLED", reason)
            .await
    }

    pub async fn interrupt_transfer(&self, transfer_id: &str, reason: &str) -> StorageResult<()> {
        self.terminate(transfer_id, TransferStatus::Interrupted, "INTERRUPTED", reason)
            .await
    }

    async fn terminate(
        &self,
        transfer_id: &str,
        status: TransferStatus,
        error_code: &str,
        error_message: &str,
    ) -> StorageResult<()> {
        let conn = self.db.conn.lock().await;
        let current = Self::status_of(&conn, transfer_id)?;
        Self::check_transition(transfer_id, current, status)?;
        let now = now_utc();
        let completed_at = if status.is_terminal() { Some(now.clone()) } else { None };
        conn.execute(
            "UPDATE transfers
             SET status = ?2, error_code = ?3, error_message = ?4,
                 completed_at = COALESCE(?5, completed_at), updated_at = ?6
             WHERE transfer_id = ?1",
            params![
                transfer_id,
                status.as_str(),
                error_code,
                error_message,
                completed_at,
                now,
            ],
        )?;
        Ok(())
    }

    /// Peer-coordinated suspension on a live session.
    pub async fn pause_transfer(&self, transfer_id: &str) -> StorageResult<()> {
        self.set_status(transfer_id, TransferStatus::Paused).await
    }

    /// Resume from PAUSED (same session) or INTERRUPTED (retry path).
    pub async fn resume_transfer(&self, transfer_id: &str) -> StorageResult<()> {
        self.set_status(transfer_id, TransferStatus::InProgress).await
    }

    async fn set_status(&self, transfer_id: &str, status: TransferStatus) -> StorageResult<()> {
        let conn = self.db.conn.lock().await;
        let current = Self::status_of(&conn, transfer_id)?;
        Self::check_transition(transfer_id, current, status)?;
        conn.execute(
            "UPDATE transfers SET status = ?2, updated_at = ?3 WHERE transfer_id = ?1",
            params![transfer_id, status.as_str(), now_utc()],
        )?;
        Ok(())
    }

    /// Startup recovery: force every IN_PROGRESS / RETRY_PENDING record
    /// owned by `node_id` to INTERRUPTED. Returns the number of rows.
    pub async fn mark_interrupted_transfers(&self, node_id: &str) -> StorageResult<usize> {
        let conn = self.db.conn.lock().await;
        let changed = conn.execute(
            "UPDATE transfers SET status = 'INTERRUPTED', updated_at = ?2
             WHERE node_id = ?1 AND status IN ('IN_PROGRESS', 'RETRY_PENDING', 'PAUSED')",
            params![node_id, now_utc()],
        )?;
        Ok(changed)
    }

    /// Shutdown path: interrupt every active transfer on one listener.
    pub async fn interrupt_active_for_server(
        &self,
        server_id: &str,
        node_id: &str,
    ) -> StorageResult<usize> {
        let conn = self.db.conn.lock().await;
        let changed = conn.execute(
            "UPDATE transfers SET status = 'INTERRUPTED',
                 error_code = 'INTERRUPTED', error_message = 'listener shutdown',
                 updated_at = ?3
             WHERE server_id = ?1 AND node_id = ?2
               AND status IN ('INITIATED', 'IN_PROGRESS', 'PAUSED')",
            params![server_id, node_id, now_utc()],
        )?;
        Ok(changed)
    }

    /// Schedule a retry of an interrupted transfer. The child inherits the
    /// parent's last sync point as its starting byte offset; the parent is
    /// moved to RETRY_PENDING.
    pub async fn retry_transfer(&self, original_id: &str) -> StorageResult<String> {
        let conn = self.db.conn.lock().await;
        let parent = Self::fetch(&conn, original_id)?;
        if parent.status.is_terminal() {
            return Err(StorageError::RetryRefused(format!(
                "transfer {} is {} and cannot be retried",
                original_id, parent.status
            )));
        }
        if !matches!(
            parent.status,
            TransferStatus::Interrupted | TransferStatus::RetryPending
        ) {
            return Err(StorageError::RetryRefused(format!(
                "transfer {} is {}; only interrupted transfers are retried",
                original_id, parent.status
            )));
        }
        if parent.retry_count >= parent.max_retries {
            return Err(StorageError::RetryRefused(format!(
                "transfer {} exhausted its retry budget ({}/{})",
                original_id, parent.retry_count, parent.max_retries
            )));
        }

        let child_id = Uuid::new_v4().to_string();
        let now = now_utc();
        conn.execute(
            "INSERT INTO transfers
                 (transfer_id, session_id, server_id, node_id, partner_id, filename,
                  direction, status, remote_address, local_path, file_size,
                  bytes_transferred, last_sync_point, start_byte, retry_count,
                  max_retries, parent_transfer_id, started_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'INITIATED', ?8, ?9, ?10,
                     ?11, ?11, ?11, ?12, ?13, ?14, ?15, ?15)",
            params![
                child_id,
                parent.session_id,
                parent.server_id,
                parent.node_id,
                parent.partner_id,
                parent.filename,
                parent.direction.as_str(),
                parent.remote_address,
                parent.local_path,
                parent.file_size as i64,
                parent.last_sync_point as i64,
                parent.retry_count + 1,
                parent.max_retries,
                original_id,
                now,
            ],
        )?;
        conn.execute(
            "UPDATE transfers SET status = 'RETRY_PENDING', updated_at = ?2
             WHERE transfer_id = ?1 AND status = 'INTERRUPTED'",
            params![original_id, now],
        )?;
        Ok(child_id)
    }

    /// Hand a pending retry record to a reconnecting session, if one exists
    /// for this (server, partner, filename). The record adopts the new
    /// session's identity.
    pub async fn claim_retry(
        &self,
        server_id: &str,
        partner_id: &str,
        filename: &str,
        session_id: &str,
        node_id: &str,
    ) -> StorageResult<Option<TransferRecord>> {
        let conn = self.db.conn.lock().await;
        let id: Option<String> = conn
            .query_row(
                "SELECT transfer_id FROM transfers
                 WHERE server_id = ?1 AND partner_id = ?2 AND filename = ?3
                   AND status = 'INITIATED' AND parent_transfer_id IS NOT NULL
                 ORDER BY started_at ASC LIMIT 1",
                params![server_id, partner_id, filename],
                |row| row.get(0),
            )
            .optional()?;
        let Some(id) = id else { return Ok(None) };
        conn.execute(
            "UPDATE transfers SET session_id = ?2, node_id = ?3, updated_at = ?4
             WHERE transfer_id = ?1",
            params![id, session_id, node_id, now_utc()],
        )?;
        Ok(Some(Self::fetch(&conn, &id)?))
    }

    /// Delete terminal records older than the cutoff. Returns rows removed.
    pub async fn prune_completed(&self, older_than_days: u32) -> StorageResult<usize> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::days(i64::from(older_than_days)))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let conn = self.db.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM transfers
             WHERE status IN ('COMPLETED', 'FAILED', 'CANCELLED')
               AND updated_at < ?1
               AND transfer_id NOT IN (
                   SELECT parent_transfer_id FROM transfers
                   WHERE parent_transfer_id IS NOT NULL
               )",
            params![cutoff],
        )?;
        Ok(deleted)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get(&self, transfer_id: &str) -> StorageResult<TransferRecord> {
        let conn = self.db.conn.lock().await;
        Self::fetch(&conn, transfer_id)
    }

    pub async fn list_by_status(&self, status: TransferStatus) -> StorageResult<Vec<TransferRecord>> {
        let conn = self.db.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM transfers WHERE status = ?1 ORDER BY started_at ASC",
            COLUMNS
        ))?;
        let rows = stmt.query_map(params![status.as_str()], map_record)?;
        let mut records = Vec::new();
        for r in rows {
            records.push(r?);
        }
        Ok(records)
    }

    pub async fn active_count_for_server(&self, server_id: &str) -> StorageResult<u64> {
        let conn = self.db.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM transfers
             WHERE server_id = ?1 AND status IN ('INITIATED', 'IN_PROGRESS', 'PAUSED')",
            params![server_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    fn status_of(conn: &Connection, transfer_id: &str) -> StorageResult<TransferStatus> {
        let s: Option<String> = conn
            .query_row(
                "SELECT status FROM transfers WHERE transfer_id = ?1",
                params![transfer_id],
                |row| row.get(0),
            )
            .optional()?;
        let s = s.ok_or_else(|| StorageError::NotFound(transfer_id.to_owned()))?;
        TransferStatus::from_str(&s).ok_or_else(|| StorageError::NotFound(transfer_id.to_owned()))
    }

    fn check_transition(
        transfer_id: &str,
        from: TransferStatus,
        to: TransferStatus,
    ) -> StorageResult<()> {
        if from == to || from.may_transition_to(to) {
            Ok(())
        } else {
            Err(StorageError::IllegalTransition {
                transfer_id: transfer_id.to_owned(),
                from: from.as_str().to_owned(),
                to: to.as_str().to_owned(),
            })
        }
    }

    fn fetch(conn: &Connection, transfer_id: &str) -> StorageResult<TransferRecord> {
        conn.query_row(
            &format!("SELECT {} FROM transfers WHERE transfer_id = ?1", COLUMNS),
            params![transfer_id],
            map_record,
        )
        .optional()?
        .ok_or_else(|| StorageError::NotFound(transfer_id.to_owned()))
    }
}

const COLUMNS: &str = "transfer_id, session_id, server_id, node_id, partner_id, filename, \
                       direction, status, remote_address, local_path, file_size, \
                       bytes_transferred, last_sync_point, sync_point_count, start_byte, \
                       checksum, error_code, error_message, retry_count, max_retries, \
                       parent_transfer_id, started_at, updated_at, completed_at, duration_ms";

fn map_record(row: &rusqlite::Row<'_>) -> Result<TransferRecord, rusqlite::Error> {
    let direction: String = row.get(6)?;
    let status: String = row.get(7)?;
    Ok(TransferRecord {
        transfer_id: row.get(0)?,
        session_id: row.get(1)?,
        server_id: row.get(2)?,
        node_id: row.get(3)?,
        partner_id: row.get(4)?,
        filename: row.get(5)?,
        direction: Direction::from_str(&direction).unwrap_or(Direction::Receive),
        status: TransferStatus::from_str(&status).unwrap_or(TransferStatus::Failed),
        remote_address: row.get(8)?,
        local_path: row.get(9)?,
        file_size: row.get::<_, i64>(10)? as u64,
        bytes_transferred: row.get::<_, i64>(11)? as u64,
        last_sync_point: row.get::<_, i64>(12)? as u64,
        sync_point_count: row.get::<_, i64>(13)? as u32,
        start_byte: row.get::<_, i64>(14)? as u64,
        checksum: row.get(15)?,
        error_code: row.get(16)?,
        error_message: row.get(17)?,
        retry_count: row.get::<_, i64>(18)? as u32,
        max_retries: row.get::<_, i64>(19)? as u32,
        parent_transfer_id: row.get(20)?,
        started_at: row.get(21)?,
        updated_at: row.get(22)?,
        completed_at: row.get(23)?,
        duration_ms: row.get::<_, Option<i64>>(24)?.map(|d| d as u64),
    })
}
