//! Sync-point, interruption, and retry/resume tests.
//!
//! Scenario: a receive negotiates 1 KB sync points, acknowledges one sync
//! point at byte 1024, then the transport drops mid-stream. The record
//! must be INTERRUPTED with lastSyncPoint = 1024. A retry then resumes
//! from that offset on a fresh session and completes the file.

use pesit_core::{DiagnosticCode, FpduKind, pi};
use pesit_server::config::*;
use pesit_server::storage::Db;
use pesit_server::storage::journal::{TransferJournal, TransferRecord, TransferStatus};
use pesit_test_utils::TestClient;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    addr: std::net::SocketAddr,
    journal: TransferJournal,
    receive_dir: PathBuf,
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
            sync_interval_kb: 1,
            resync_enabled: false,
            strict_partner_check: true,
            strict_file_check: true,
            auto_start: true,
            pre_connection_filter: false,
            tls: None,
        }],
        partners: vec![PartnerConfig {
            id: "PART01".to_owned(),
            enabled: true,
            password: Some("secret".to_owned()),
            access: PartnerAccess::Both,
        }],
        files: vec![LogicalFileConfig {
            id: "BIGFILE".to_owned(),
            pattern: None,
            directory: None,
            record_format: "V".to_owned(),
            record_length: 0,
        }],
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
    let journal = TransferJournal::new(Db::open(&config.storage.sqlite_path).unwrap());
    Harness {
        addr,
        journal,
        receive_dir: config.listeners[0].receive_directory.clone(),
        _dir: dir,
    }
}

/// Poll the journal until one record reaches `status` or the deadline
/// passes.
async fn wait_for_status(journal: &TransferJournal, status: TransferStatus) -> TransferRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let records = journal.list_by_status(status).await.unwrap();
        if let Some(record) = records.into_iter().next() {
            return record;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no record reached {status} in time"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Upload 1024 bytes, sync, then 500 more and drop the transport.
async fn upload_then_drop(h: &Harness, payload: &[u8]) {
    let mut client = TestClient::connect(&h.addr.to_string()).await.unwrap();
    client.establish("PART01", "SRV1", Some("secret")).await;
    let restart = client.start_upload("BIGFILE").await;
    assert_eq!(restart, 0);

    client.send(client.dtf_fpdu(&payload[..1024])).await.unwrap();
    client.send(client.syn_fpdu(1)).await.unwrap();
    let ack = client.expect(FpduKind::AckSyn).await;
    assert_eq!(ack.param_uint(pi::SYNC_POINT_NUMBER), Some(1));

    client.send(client.dtf_fpdu(&payload[1024..1524])).await.unwrap();
    // Drop the connection without DTF_END: transport loss mid-transfer.
    drop(client);
}

#[tokio::test]
async fn interrupt_preserves_last_sync_point() {
    let h = start_server().await;
    let payload: Vec<u8> = (0..2048u32).map(|i| (i % 239) as u8).collect();
    upload_then_drop(&h, &payload).await;

    let record = wait_for_status(&h.journal, TransferStatus::Interrupted).await;
    assert_eq!(record.last_sync_point, 1024);
    assert!(record.bytes_transferred >= 1024);
    assert_eq!(record.sync_point_count, 1);

    let on_disk = tokio::fs::read(h.receive_dir.join("BIGFILE")).await.unwrap();
    assert!(on_disk.len() >= 1024, "synced bytes must survive");
}

/// Retry of the interrupted transfer: the child record starts at the
/// parent's sync point, the server offers restart-point 1024, and the
/// completed file matches the original payload exactly.
#[tokio::test]
async fn retry_resumes_from_sync_point_and_completes() {
    let h = start_server().await;
    let payload: Vec<u8> = (0..4000u32).map(|i| (i % 233) as u8).collect();
    upload_then_drop(&h, &payload).await;

    let interrupted = wait_for_status(&h.journal, TransferStatus::Interrupted).await;
    let child_id = h.journal.retry_transfer(&interrupted.transfer_id).await.unwrap();
    let child = h.journal.get(&child_id).await.unwrap();
    assert_eq!(child.start_byte, 1024);
    assert_eq!(child.parent_transfer_id.as_deref(), Some(interrupted.transfer_id.as_str()));

    // The original is parked as RETRY_PENDING.
    assert_eq!(
        h.journal.get(&interrupted.transfer_id).await.unwrap().status,
        TransferStatus::RetryPending
    );

    // Reconnect; the server hands back restart point 1024.
    let mut client = TestClient::connect(&h.addr.to_string()).await.unwrap();
    client.establish("PART01", "SRV1", Some("secret")).await;
    let restart = client.start_upload("BIGFILE").await;
    assert_eq!(restart, 1024);

    client.send(client.dtf_fpdu(&payload[1024..])).await.unwrap();
    let ack_end = client.finish_upload().await;
    assert_eq!(ack_end.diagnostic(), Some(DiagnosticCode::SUCCESS));
    assert_eq!(ack_end.param_uint(pi::BYTE_COUNT), Some(4000));
    client.teardown().await;

    let on_disk = tokio::fs::read(h.receive_dir.join("BIGFILE")).await.unwrap();
    assert_eq!(on_disk, payload, "resumed file must match the full payload");

    assert_eq!(
        h.journal.get(&child_id).await.unwrap().status,
        TransferStatus::Completed
    );
}

/// A read timeout mid-transfer interrupts the record without emitting any
/// FPDU to the unresponsive peer.
#[tokio::test]
async fn idle_timeout_interrupts_transfer() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.listeners[0].read_timeout_ms = 300;
    let supervisor = pesit_server::bootstrap(&config, None).await.unwrap();
    supervisor.startup().await.unwrap();
    let addr = supervisor
        .status("SRV1")
        .await
        .and_then(|s| s.local_addr)
        .unwrap();
    let journal = TransferJournal::new(Db::open(&config.storage.sqlite_path).unwrap());

    let mut client = TestClient::connect(&addr.to_string()).await.unwrap();
    client.establish("PART01", "SRV1", Some("secret")).await;
    client.start_upload("BIGFILE").await;
    client.send(client.dtf_fpdu(&[1u8; 100])).await.unwrap();
    // Go silent; the server must time out and interrupt.
    let record = wait_for_status(&journal, TransferStatus::Interrupted).await;
    assert_eq!(record.filename, "BIGFILE");
}
