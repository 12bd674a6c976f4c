//! Protocol-error handling: invalid state transitions, malformed frames,
//! and unknown FPDU kinds all convert into ABORT with the right
//! diagnostic, and leave an audit trail.

use pesit_core::{DiagnosticCode, FpduKind};
use pesit_server::audit::{AuditCategory, AuditLog, AuditOutcome};
use pesit_server::config::*;
use pesit_server::storage::Db;
use pesit_test_utils::TestClient;
use tempfile::TempDir;

struct Harness {
    addr: std::net::SocketAddr,
    audit: AuditLog,
    _dir: TempDir,
}

fn test_config(dir: &TempDir) -> ServerConfig {
    ServerConfig {
        schema_version: 1,
        node_id: "node-a".to_owned(),
        storage: StorageConfig {
            sqlite_path: dir.path().join("server.sqlite3"),
        },
        secrets: SecretsConfig { key_file: None },
        cluster: ClusterConfig { enabled: false },
        maintenance: MaintenanceConfig {
            prune_after_days: 30,
            prune_interval_secs: 3600,
        },
        listeners: vec![ListenerConfig {
            server_id: "SRV1".to_owned(),
            port: 0,
            bind_address: "127.0.0.1".to_owned(),
            protocol_version: 2,
            max_connections: 8,
            connection_timeout_ms: 5_000,
            read_timeout_ms: 5_000,
            receive_directory: dir.path().join("in"),
            send_directory: dir.path().join("out"),
            max_entity_size: 32 * 1024,
            sync_points_enabled: true,
            sync_interval_kb: 64,
            resync_enabled: false,
            strict_partner_check: false,
            strict_file_check: false,
            auto_start: true,
            pre_connection_filter: false,
            tls: None,
        }],
        partners: vec![],
        files: vec![],
    }
}

async fn start_server() -> Harness {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let supervisor = pesit_server::bootstrap(&config, None).await.unwrap();
    supervisor.startup().await.unwrap();
    let addr = supervisor
        .status("SRV1")
        .await
        .and_then(|s| s.local_addr)
        .expect("listener should be running");
    let audit = AuditLog::new(Db::open(&config.storage.sqlite_path).unwrap());
    Harness { addr, audit, _dir: dir }
}

/// WRITE while merely connected (not transfer-ready) is the canonical
/// invalid transition: ABORT D2_203, session closes, SECURITY/FAILURE
/// audit event.
#[tokio::test]
async fn write_in_connected_state_aborts_with_d2_203() {
    let h = start_server().await;
    let mut client = TestClient::connect(&h.addr.to_string()).await.unwrap();
    client.establish("PART01", "SRV1", None).await;

    client.send(client.write_fpdu()).await.unwrap();
    let abort = client.expect(FpduKind::Abort).await;
    assert_eq!(abort.diagnostic(), Some(DiagnosticCode::INVALID_TRANSITION));
    assert!(client.expect_close().await, "session must close after ABORT");

    assert_eq!(
        h.audit
            .count(AuditCategory::Security, AuditOutcome::Failure)
            .await
            .unwrap(),
        1
    );
}

/// DTF before any CONNECT is equally illegal.
#[tokio::test]
async fn data_before_connect_aborts() {
    let h = start_server().await;
    let mut client = TestClient::connect(&h.addr.to_string()).await.unwrap();
    client.send(client.dtf_fpdu(b"premature")).await.unwrap();
    let abort = client.expect(FpduKind::Abort).await;
    assert_eq!(abort.diagnostic(), Some(DiagnosticCode::INVALID_TRANSITION));
}

/// A frame whose declared length is impossible is fatal: the server
/// answers ABORT with the malformed-FPDU diagnostic and closes.
#[tokio::test]
async fn malformed_frame_aborts_with_d2_201() {
    let h = start_server().await;
    let mut client = TestClient::connect(&h.addr.to_string()).await.unwrap();
    client.establish("PART01", "SRV1", None).await;

    // Declared length 3 is below the 6-byte FPDU header.
    client.send_raw(&[0x00, 0x03, 0x20, 0x01, 0x00]).await.unwrap();
    let abort = client.expect(FpduKind::Abort).await;
    assert_eq!(abort.diagnostic(), Some(DiagnosticCode::MALFORMED_FPDU));
    assert!(client.expect_close().await);
}

/// An unrecognized phase/type pair gets the unknown-FPDU diagnostic.
#[tokio::test]
async fn unknown_kind_aborts_with_d2_202() {
    let h = start_server().await;
    let mut client = TestClient::connect(&h.addr.to_string()).await.unwrap();
    client.establish("PART01", "SRV1", None).await;

    // Valid framing, nonexistent kind (phase 0x2F).
    client
        .send_raw(&[0x00, 0x06, 0x2F, 0x01, 0x00, 0x01, 0x0A, 0x01])
        .await
        .unwrap();
    let abort = client.expect(FpduKind::Abort).await;
    assert_eq!(abort.diagnostic(), Some(DiagnosticCode::UNKNOWN_FPDU));
}

/// The pre-connection filter consumes leading garbage ahead of CONNECT.
#[tokio::test]
async fn pre_connection_filter_skips_leading_bytes() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.listeners[0].pre_connection_filter = true;
    let supervisor = pesit_server::bootstrap(&config, None).await.unwrap();
    supervisor.startup().await.unwrap();
    let addr = supervisor
        .status("SRV1")
        .await
        .and_then(|s| s.local_addr)
        .unwrap();

    let mut client = TestClient::connect(&addr.to_string()).await.unwrap();
    client.send_raw(b"\x01\x02legacy-preamble").await.unwrap();
    client.establish("PART01", "SRV1", None).await;
    assert_ne!(client.server_connection_id, 0);
}
