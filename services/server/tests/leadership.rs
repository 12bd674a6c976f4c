//! Cluster leadership tests: exactly one node owns a listener name, and
//! leadership loss stops listeners, aborts sessions, and interrupts
//! in-flight transfers before the name is released.

use pesit_core::FpduKind;
use pesit_server::cluster::{ClusterEvent, ClusterProvider};
use pesit_server::config::*;
use pesit_server::storage::Db;
use pesit_server::storage::journal::{TransferJournal, TransferStatus};
use pesit_server::supervisor::Supervisor;
use pesit_test_utils::TestClient;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// A scriptable cluster provider: two nodes share one ownership table.
// ---------------------------------------------------------------------------

type Owners = Arc<Mutex<HashMap<String, String>>>;

struct ScriptedCluster {
    node: String,
    leader: AtomicBool,
    owners: Owners,
    events: broadcast::Sender<ClusterEvent>,
}

impl ScriptedCluster {
    fn new(node: &str, leader: bool, owners: Owners) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(ScriptedCluster {
            node: node.to_owned(),
            leader: AtomicBool::new(leader),
            owners,
            events,
        })
    }

    fn fire(&self, event: ClusterEvent) {
        match event {
            ClusterEvent::BecameLeader => self.leader.store(true, Ordering::SeqCst),
            ClusterEvent::LostLeadership => self.leader.store(false, Ordering::SeqCst),
            _ => {}
        }
        let _ = self.events.send(event);
    }
}

impl ClusterProvider for ScriptedCluster {
    fn is_cluster_enabled(&self) -> bool {
        true
    }

    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn node_name(&self) -> String {
        self.node.clone()
    }

    fn cluster_members(&self) -> Vec<String> {
        vec!["node-a".to_owned(), "node-b".to_owned()]
    }

    fn acquire_server_ownership(&self, name: &str) -> bool {
        let mut owners = self.owners.lock().unwrap();
        if owners.contains_key(name) {
            return false;
        }
        owners.insert(name.to_owned(), self.node.clone());
        true
    }

    fn release_server_ownership(&self, name: &str) {
        let mut owners = self.owners.lock().unwrap();
        if owners.get(name).is_some_and(|o| o == &self.node) {
            owners.remove(name);
        }
    }

    fn server_owner(&self, name: &str) -> Option<String> {
        self.owners.lock().unwrap().get(name).cloned()
    }

    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn node_config(dir: &TempDir, node: &str) -> ServerConfig {
    ServerConfig {
        schema_version: 1,
        node_id: node.to_owned(),
        storage: StorageConfig {
            sqlite_path: dir.path().join(format!("{node}.sqlite3")),
        },
        secrets: SecretsConfig { key_file: None },
        cluster: ClusterConfig { enabled: true },
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
            receive_directory: dir.path().join(format!("{node}-in")),
            send_directory: dir.path().join(format!("{node}-out")),
            max_entity_size: 32 * 1024,
            sync_points_enabled: true,
            sync_interval_kb: 1,
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

fn deadline() -> tokio::time::Instant {
    tokio::time::Instant::now() + Duration::from_secs(5)
}

async fn wait_for_running(supervisor: &Supervisor, want: bool) {
    let end = deadline();
    loop {
        if supervisor.status("SRV1").await.unwrap().running == want {
            return;
        }
        assert!(tokio::time::Instant::now() < end, "listener never reached running={want}");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// A non-leader node defers its listeners until BECAME_LEADER.
#[tokio::test]
async fn follower_defers_start_until_leadership() {
    let dir = TempDir::new().unwrap();
    let cluster = ScriptedCluster::new("node-b", false, Owners::default());
    let config = node_config(&dir, "node-b");

    let supervisor = pesit_server::bootstrap(&config, Some(cluster.clone())).await.unwrap();
    supervisor.startup().await.unwrap();
    assert!(!supervisor.status("SRV1").await.unwrap().running);

    cluster.fire(ClusterEvent::BecameLeader);
    wait_for_running(&supervisor, true).await;
}

/// Leadership loss mid-transfer: the session is aborted, the record is
/// INTERRUPTED under the losing node's id, ownership is released, and the
/// other node can then acquire the name and start.
#[tokio::test]
async fn leadership_loss_interrupts_and_hands_over() {
    let dir = TempDir::new().unwrap();
    let owners = Owners::default();

    let cluster_a = ScriptedCluster::new("node-a", true, owners.clone());
    let config_a = node_config(&dir, "node-a");
    let sup_a = pesit_server::bootstrap(&config_a, Some(cluster_a.clone())).await.unwrap();
    sup_a.startup().await.unwrap();
    let addr = sup_a.status("SRV1").await.and_then(|s| s.local_addr).unwrap();
    assert_eq!(cluster_a.server_owner("SRV1").as_deref(), Some("node-a"));

    // Start a receive and leave it mid-stream.
    let mut client = TestClient::connect(&addr.to_string()).await.unwrap();
    client.establish("PART01", "SRV1", None).await;
    client.start_upload("ANYFILE").await;
    client.send(client.dtf_fpdu(&[9u8; 256])).await.unwrap();

    cluster_a.fire(ClusterEvent::LostLeadership);

    // The active session receives an ABORT.
    let abort = client.expect(FpduKind::Abort).await;
    assert_eq!(abort.kind, FpduKind::Abort);

    // The transfer record ends up INTERRUPTED under node-a.
    let journal_a = TransferJournal::new(Db::open(&config_a.storage.sqlite_path).unwrap());
    let end = deadline();
    loop {
        let interrupted = journal_a
            .list_by_status(TransferStatus::Interrupted)
            .await
            .unwrap();
        if interrupted.iter().any(|r| r.node_id == "node-a") {
            break;
        }
        assert!(tokio::time::Instant::now() < end, "no interrupted record under node-a");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // Ownership is released once the listener is fully stopped.
    let end = deadline();
    while cluster_a.server_owner("SRV1").is_some() {
        assert!(tokio::time::Instant::now() < end, "ownership never released");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // Node B takes over the name.
    let cluster_b = ScriptedCluster::new("node-b", false, owners);
    let config_b = node_config(&dir, "node-b");
    let sup_b = pesit_server::bootstrap(&config_b, Some(cluster_b.clone())).await.unwrap();
    sup_b.startup().await.unwrap();
    cluster_b.fire(ClusterEvent::BecameLeader);

    wait_for_running(&sup_b, true).await;
    assert_eq!(cluster_b.server_owner("SRV1").as_deref(), Some("node-b"));
}

/// Two supervisors racing for one name: exactly one start succeeds and
/// the loser's error names the owner.
#[tokio::test]
async fn ownership_acquire_race_has_single_winner() {
    let dir = TempDir::new().unwrap();
    let owners = Owners::default();

    let cluster_a = ScriptedCluster::new("node-a", true, owners.clone());
    let mut config_a = node_config(&dir, "node-a");
    config_a.listeners[0].auto_start = false;
    let sup_a = pesit_server::bootstrap(&config_a, Some(cluster_a)).await.unwrap();
    sup_a.startup().await.unwrap();

    let cluster_b = ScriptedCluster::new("node-b", true, owners);
    let mut config_b = node_config(&dir, "node-b");
    config_b.listeners[0].auto_start = false;
    let sup_b = pesit_server::bootstrap(&config_b, Some(cluster_b)).await.unwrap();
    sup_b.startup().await.unwrap();

    sup_a.start("SRV1").await.unwrap();
    let err = sup_b.start("SRV1").await.unwrap_err();
    assert!(err.to_string().contains("already owned by node-a"), "{err}");
}
