//! Listener supervisor: owns the set of named listeners, their lifecycle,
//! and the cluster integration.
//!
//! Startup order: recover interrupted transfers, subscribe to cluster
//! events, then auto-start listeners when this node is (or becomes) the
//! leader. Leadership loss stops every running listener and interrupts
//! its in-flight transfers before the port is released.

use crate::audit::{AuditCategory, AuditEvent, AuditLog, AuditOutcome};
use crate::cluster::{ClusterEvent, ClusterProvider};
use crate::config::{ListenerConfig, MaintenanceConfig};
use crate::directory::DirectoryStore;
use crate::files::validate_directory;
use crate::secrets::SecretStore;
use crate::session::{SessionDeps, run_session};
use crate::storage::journal::TransferJournal;
use crate::transport::{self, TransportError, Upgrader};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Bounded wait for sessions to drain on stop before force-closing.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("listener '{0}' not found")]
    NotFound(String),
    #[error("listener '{0}' already exists")]
    Exists(String),
    #[error("listener '{0}' is running; stop it first")]
    Running(String),
    #[error("listener '{server_id}' already owned by {owner}")]
    AlreadyOwned { server_id: String, owner: String },
    #[error("PORT_IN_USE: {0}")]
    PortInUse(u16),
    #[error("receive directory invalid: {0}")]
    ReceiveDirectory(String),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("storage: {0}")]
    Storage(#[from] crate::storage::StorageError),
}

/// Externally visible listener state.
#[derive(Debug, Clone)]
pub struct ListenerStatus {
    pub server_id: String,
    pub running: bool,
    pub local_addr: Option<SocketAddr>,
    pub active_connections: usize,
    pub auto_start: bool,
}

struct ListenerRuntime {
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    local_addr: SocketAddr,
    active: Arc<AtomicUsize>,
}

struct ListenerEntry {
    config: ListenerConfig,
    runtime: Option<ListenerRuntime>,
}

struct Inner {
    node_id: String,
    journal: TransferJournal,
    audit: AuditLog,
    directory: DirectoryStore,
    secrets: Arc<dyn SecretStore>,
    cluster: Arc<dyn ClusterProvider>,
    maintenance: MaintenanceConfig,
    listeners: Mutex<HashMap<String, ListenerEntry>>,
}

/// Cluster-aware supervisor over the configured listeners.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        node_id: &str,
        journal: TransferJournal,
        audit: AuditLog,
        directory: DirectoryStore,
        secrets: Arc<dyn SecretStore>,
        cluster: Arc<dyn ClusterProvider>,
        maintenance: MaintenanceConfig,
    ) -> Self {
        Supervisor {
            inner: Arc::new(Inner {
                node_id: node_id.to_owned(),
                journal,
                audit,
                directory,
                secrets,
                cluster,
                maintenance,
                listeners: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Recover journal state, wire cluster events, auto-start when leader,
    /// and schedule maintenance.
    pub async fn startup(&self) -> Result<(), SupervisorError> {
        let recovered = self
            .inner
            .journal
            .mark_interrupted_transfers(&self.inner.node_id)
            .await?;
        if recovered > 0 {
            info!(node = %self.inner.node_id, count = recovered, "marked stale transfers interrupted");
        }

        self.spawn_cluster_listener();
        self.spawn_maintenance();

        if !self.inner.cluster.is_cluster_enabled() || self.inner.cluster.is_leader() {
            self.auto_start_all().await;
        } else {
            info!(node = %self.inner.node_id, "not leader; deferring listener start");
        }
        Ok(())
    }

    fn spawn_cluster_listener(&self) {
        let supervisor = self.clone();
        let mut events = self.inner.cluster.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    ClusterEvent::BecameLeader => {
                        info!(node = %supervisor.inner.node_id, "became leader");
                        supervisor.auto_start_all().await;
                    }
                    ClusterEvent::LostLeadership => {
                        warn!(node = %supervisor.inner.node_id, "lost leadership; stopping listeners");
                        supervisor.stop_all().await;
                    }
                    ClusterEvent::MemberJoined | ClusterEvent::MemberLeft => {
                        info!(members = ?supervisor.inner.cluster.cluster_members(), "membership changed");
                    }
                }
            }
        });
    }

    fn spawn_maintenance(&self) {
        let journal = self.inner.journal.clone();
        let maintenance = self.inner.maintenance.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(maintenance.prune_interval_secs.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so startup stays quick.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match journal.prune_completed(maintenance.prune_after_days).await {
                    Ok(0) => {}
                    Ok(n) => info!(pruned = n, "pruned old transfer records"),
                    Err(e) => error!(error = %e, "transfer record pruning failed"),
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // Listener CRUD
    // -----------------------------------------------------------------------

    pub async fn create_listener(&self, config: ListenerConfig) -> Result<(), SupervisorError> {
        let mut listeners = self.inner.listeners.lock().await;
        if listeners.contains_key(&config.server_id) {
            return Err(SupervisorError::Exists(config.server_id));
        }
        listeners.insert(
            config.server_id.clone(),
            ListenerEntry {
                config,
                runtime: None,
            },
        );
        Ok(())
    }

    /// Replace a listener's configuration; rejected while it is running.
    pub async fn update_listener(&self, config: ListenerConfig) -> Result<(), SupervisorError> {
        let mut listeners = self.inner.listeners.lock().await;
        let entry = listeners
            .get_mut(&config.server_id)
            .ok_or_else(|| SupervisorError::NotFound(config.server_id.clone()))?;
        if entry.runtime.is_some() {
            return Err(SupervisorError::Running(config.server_id));
        }
        entry.config = config;
        Ok(())
    }

    /// Remove a listener, stopping it first when needed.
    pub async fn delete_listener(&self, server_id: &str) -> Result<(), SupervisorError> {
        self.stop(server_id).await.ok();
        let mut listeners = self.inner.listeners.lock().await;
        listeners
            .remove(server_id)
            .map(|_| ())
            .ok_or_else(|| SupervisorError::NotFound(server_id.to_owned()))
    }

    pub async fn status(&self, server_id: &str) -> Option<ListenerStatus> {
        let listeners = self.inner.listeners.lock().await;
        listeners.get(server_id).map(|entry| ListenerStatus {
            server_id: server_id.to_owned(),
            running: entry.runtime.is_some(),
            local_addr: entry.runtime.as_ref().map(|r| r.local_addr),
            active_connections: entry
                .runtime
                .as_ref()
                .map(|r| r.active.load(Ordering::Relaxed))
                .unwrap_or(0),
            auto_start: entry.config.auto_start,
        })
    }

    pub async fn active_connection_count(&self, server_id: &str) -> usize {
        self.status(server_id)
            .await
            .map(|s| s.active_connections)
            .unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Start / stop
    // -----------------------------------------------------------------------

    async fn auto_start_all(&self) {
        let ids: Vec<String> = {
            let listeners = self.inner.listeners.lock().await;
            listeners
                .iter()
                .filter(|(_, e)| e.config.auto_start && e.runtime.is_none())
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in ids {
            if let Err(e) = self.start(&id).await {
                error!(listener = %id, error = %e, "auto-start failed");
            }
        }
    }

    /// Start one listener: validate directories, take cluster ownership,
    /// bind, and launch the accept loop.
    pub async fn start(&self, server_id: &str) -> Result<SocketAddr, SupervisorError> {
        let mut listeners = self.inner.listeners.lock().await;
        let entry = listeners
            .get_mut(server_id)
            .ok_or_else(|| SupervisorError::NotFound(server_id.to_owned()))?;
        if entry.runtime.is_some() {
            return Err(SupervisorError::Running(server_id.to_owned()));
        }
        let config = entry.config.clone();

        // The receive directory must be usable; a bad send directory only
        // warns because receive-only partners never touch it.
        if let Err(e) = validate_directory(&config.receive_directory).await {
            return Err(SupervisorError::ReceiveDirectory(e.to_string()));
        }
        if let Err(e) = validate_directory(&config.send_directory).await {
            warn!(listener = %server_id, error = %e, "send directory not usable");
        }

        if !self.inner.cluster.acquire_server_ownership(server_id) {
            let owner = self
                .inner
                .cluster
                .server_owner(server_id)
                .unwrap_or_else(|| "unknown".to_owned());
            return Err(SupervisorError::AlreadyOwned {
                server_id: server_id.to_owned(),
                owner,
            });
        }

        let listener = match transport::bind(&config).await {
            Ok(l) => l,
            Err(TransportError::PortInUse(port)) => {
                self.inner.cluster.release_server_ownership(server_id);
                return Err(SupervisorError::PortInUse(port));
            }
            Err(e) => {
                self.inner.cluster.release_server_ownership(server_id);
                return Err(e.into());
            }
        };
        let local_addr = listener.local_addr().map_err(TransportError::Io)?;

        let upgrader = match Upgrader::from_config(&config) {
            Ok(u) => u,
            Err(e) => {
                self.inner.cluster.release_server_ownership(server_id);
                return Err(e.into());
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let active = Arc::new(AtomicUsize::new(0));
        let accept_task = tokio::spawn(accept_loop(
            listener,
            upgrader,
            Arc::new(config),
            self.inner.clone(),
            shutdown_rx,
            active.clone(),
        ));

        entry.runtime = Some(ListenerRuntime {
            shutdown: shutdown_tx,
            accept_task,
            local_addr,
            active,
        });

        info!(listener = %server_id, addr = %local_addr, "listener started");
        let _ = self
            .inner
            .audit
            .record(AuditEvent::new(AuditCategory::Admin, "LISTENER_START", AuditOutcome::Success))
            .await;
        Ok(local_addr)
    }

    /// Stop one listener: close the accept socket, drain bounded, then
    /// force-close and interrupt what is left.
    pub async fn stop(&self, server_id: &str) -> Result<(), SupervisorError> {
        let runtime = {
            let mut listeners = self.inner.listeners.lock().await;
            let entry = listeners
                .get_mut(server_id)
                .ok_or_else(|| SupervisorError::NotFound(server_id.to_owned()))?;
            entry.runtime.take()
        };
        let Some(runtime) = runtime else {
            return Ok(());
        };

        let _ = runtime.shutdown.send(true);
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while runtime.active.load(Ordering::Relaxed) > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .is_ok();
        if !drained {
            warn!(listener = %server_id, "drain timeout; force-closing sessions");
        }
        runtime.accept_task.abort();

        // Every remaining active transfer on this listener becomes
        // INTERRUPTED before the port is released.
        match self
            .inner
            .journal
            .interrupt_active_for_server(server_id, &self.inner.node_id)
            .await
        {
            Ok(0) => {}
            Ok(n) => info!(listener = %server_id, count = n, "interrupted in-flight transfers"),
            Err(e) => error!(listener = %server_id, error = %e, "interrupt sweep failed"),
        }

        self.inner.cluster.release_server_ownership(server_id);
        info!(listener = %server_id, "listener stopped");
        let _ = self
            .inner
            .audit
            .record(AuditEvent::new(AuditCategory::Admin, "LISTENER_STOP", AuditOutcome::Success))
            .await;
        Ok(())
    }

    /// Stop every running listener (shutdown or leadership loss).
    pub async fn stop_all(&self) {
        let ids: Vec<String> = {
            let listeners = self.inner.listeners.lock().await;
            listeners
                .iter()
                .filter(|(_, e)| e.runtime.is_some())
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                error!(listener = %id, error = %e, "stop failed");
            }
        }
    }
}

/// Accept loop: bounded worker pool, one session task per connection.
async fn accept_loop(
    listener: tokio::net::TcpListener,
    upgrader: Upgrader,
    config: Arc<ListenerConfig>,
    inner: Arc<Inner>,
    shutdown: watch::Receiver<bool>,
    active: Arc<AtomicUsize>,
) {
    let pool = Arc::new(Semaphore::new(config.max_connections));
    let mut shutdown_accept = shutdown.clone();
    loop {
        // Backpressure: no accept until a worker slot is free.
        let permit = tokio::select! {
            biased;
            _ = shutdown_accept.changed() => {
                if *shutdown_accept.borrow() { break; }
                continue;
            }
            permit = pool.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        let (socket, peer) = tokio::select! {
            biased;
            _ = shutdown_accept.changed() => {
                if *shutdown_accept.borrow() { break; }
                continue;
            }
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };

        let deps = SessionDeps {
            config: config.clone(),
            directory: inner.directory.snapshot(),
            journal: inner.journal.clone(),
            audit: inner.audit.clone(),
            secrets: inner.secrets.clone(),
            node_id: inner.node_id.clone(),
        };
        let upgrader = upgrader.clone();
        let session_shutdown = shutdown.clone();
        let active = active.clone();

        active.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            let _permit = permit;
            match upgrader.upgrade(socket, peer).await {
                Ok(io) => run_session(io, peer, deps, session_shutdown).await,
                Err(e) => warn!(peer = %peer, error = %e, "transport upgrade failed"),
            }
            active.fetch_sub(1, Ordering::Relaxed);
        });
    }
}
