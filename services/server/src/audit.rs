//! Append-only audit stream for security-relevant events.
//!
//! Every event lands in the `audit_events` table and is mirrored as a
//! `tracing` event so operators see the stream live without querying.

use crate::storage::{Db, StorageResult, now_utc};
use rusqlite::params;
use std::fmt;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditCategory {
    Authentication,
    Authorization,
    Transfer,
    Configuration,
    Security,
    Admin,
}

impl AuditCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditCategory::Authentication => "AUTHENTICATION",
            AuditCategory::Authorization => "AUTHORIZATION",
            AuditCategory::Transfer => "TRANSFER",
            AuditCategory::Configuration => "CONFIGURATION",
            AuditCategory::Security => "SECURITY",
            AuditCategory::Admin => "ADMIN",
        }
    }
}

impl fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    Success,
    Failure,
    Denied,
}

impl AuditOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditOutcome::Success => "SUCCESS",
            AuditOutcome::Failure => "FAILURE",
            AuditOutcome::Denied => "DENIED",
        }
    }
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured audit event. Build with the fluent setters, then hand to
/// `AuditLog::record`.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub category: AuditCategory,
    pub event_type: String,
    pub outcome: AuditOutcome,
    pub username: Option<String>,
    pub partner_id: Option<String>,
    pub client_ip: Option<String>,
    pub session_id: Option<String>,
    pub transfer_id: Option<String>,
    pub filename: Option<String>,
    pub bytes_transferred: Option<u64>,
    pub duration_ms: Option<u64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl AuditEvent {
    pub fn new(category: AuditCategory, event_type: &str, outcome: AuditOutcome) -> Self {
        AuditEvent {
            category,
            event_type: event_type.to_owned(),
            outcome,
            username: None,
            partner_id: None,
            client_ip: None,
            session_id: None,
            transfer_id: None,
            filename: None,
            bytes_transferred: None,
            duration_ms: None,
            error_code: None,
            error_message: None,
        }
    }

    pub fn partner(mut self, partner_id: &str) -> Self {
        self.partner_id = Some(partner_id.to_owned());
        self
    }

    pub fn client_ip(mut self, ip: &str) -> Self {
        self.client_ip = Some(ip.to_owned());
        self
    }

    pub fn session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_owned());
        self
    }

    pub fn transfer(mut self, transfer_id: &str) -> Self {
        self.transfer_id = Some(transfer_id.to_owned());
        self
    }

    pub fn filename(mut self, filename: &str) -> Self {
        self.filename = Some(filename.to_owned());
        self
    }

    pub fn bytes(mut self, bytes: u64) -> Self {
        self.bytes_transferred = Some(bytes);
        self
    }

    pub fn duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    pub fn error(mut self, code: &str, message: &str) -> Self {
        self.error_code = Some(code.to_owned());
        self.error_message = Some(message.to_owned());
        self
    }
}

/// Handle to the audit stream. Clone freely.
#[derive(Clone)]
pub struct AuditLog {
    db: Db,
}

impl AuditLog {
    pub fn new(db: Db) -> Self {
        AuditLog { db }
    }

    pub async fn record(&self, event: AuditEvent) -> StorageResult<()> {
        info!(
            category = %event.category,
            event_type = %event.event_type,
            outcome = %event.outcome,
            partner = event.partner_id.as_deref().unwrap_or("-"),
            session = event.session_id.as_deref().unwrap_or("-"),
            error = event.error_code.as_deref().unwrap_or("-"),
            "audit"
        );
        let conn = self.db.conn.lock().await;
        conn.execute(
            "INSERT INTO audit_events
                 (timestamp, category, event_type, outcome, username, partner_id,
                  client_ip, session_id, transfer_id, filename, bytes_transferred,
                  duration_ms, error_code, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                now_utc(),
                event.category.as_str(),
                event.event_type,
                event.outcome.as_str(),
                event.username,
                event.partner_id,
                event.client_ip,
                event.session_id,
                event.transfer_id,
                event.filename,
                event.bytes_transferred.map(|b| b as i64),
                event.duration_ms.map(|d| d as i64),
                event.error_code,
                event.error_message,
            ],
        )?;
        Ok(())
    }

    /// Count events by category and outcome; used by tests and health checks.
    pub async fn count(&self, category: AuditCategory, outcome: AuditOutcome) -> StorageResult<u64> {
        let conn = self.db.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM audit_events WHERE category = ?1 AND outcome = ?2",
            params![category.as_str(), outcome.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_and_counts_events() {
        let log = AuditLog::new(Db::open_in_memory().unwrap());
        log.record(
            AuditEvent::new(AuditCategory::Authentication, "CONNECT", AuditOutcome::Failure)
                .partner("UNKNOWN")
                .client_ip("127.0.0.1")
                .error("D3_301", "unknown partner"),
        )
        .await
        .unwrap();
        log.record(AuditEvent::new(
            AuditCategory::Transfer,
            "TRANSFER_COMPLETE",
            AuditOutcome::Success,
        ))
        .await
        .unwrap();

        assert_eq!(
            log.count(AuditCategory::Authentication, AuditOutcome::Failure)
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            log.count(AuditCategory::Transfer, AuditOutcome::Success)
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            log.count(AuditCategory::Admin, AuditOutcome::Denied).await.unwrap(),
            0
        );
    }
}
