// pesit-server: a PeSIT-E "Hors-SIT" file-transfer server.
//
// Accepts inbound TCP (optionally TLS/mTLS) connections from partner
// systems, drives the PeSIT session state machine, streams file data with
// sync-point restart, and journals every transfer for audit and resumption.

pub mod audit;
pub mod cluster;
pub mod config;
pub mod directory;
pub mod files;
pub mod handlers;
pub mod secrets;
pub mod session;
pub mod state;
pub mod storage;
pub mod supervisor;
pub mod transport;

use crate::audit::AuditLog;
use crate::cluster::{ClusterProvider, StandaloneCluster};
use crate::config::ServerConfig;
use crate::directory::DirectoryStore;
use crate::secrets::{AesSecretStore, NullSecretStore, SecretStore};
use crate::storage::Db;
use crate::storage::journal::TransferJournal;
use crate::supervisor::Supervisor;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("storage: {0}")]
    Storage(#[from] storage::StorageError),
    #[error("secrets: {0}")]
    Secrets(#[from] secrets::SecretError),
    #[error("supervisor: {0}")]
    Supervisor(#[from] supervisor::SupervisorError),
}

/// Build the full server from a validated configuration.
///
/// `cluster` defaults to the standalone provider when the config has
/// clustering disabled; tests inject their own provider.
pub async fn bootstrap(
    config: &ServerConfig,
    cluster: Option<Arc<dyn ClusterProvider>>,
) -> Result<Supervisor, BootstrapError> {
    let db = Db::open(&config.storage.sqlite_path)?;
    let journal = TransferJournal::new(db.clone());
    let audit = AuditLog::new(db);

    let secrets: Arc<dyn SecretStore> = match &config.secrets.key_file {
        Some(path) => Arc::new(AesSecretStore::from_key_file(path)?),
        None => Arc::new(NullSecretStore),
    };

    let cluster: Arc<dyn ClusterProvider> =
        cluster.unwrap_or_else(|| Arc::new(StandaloneCluster::new(&config.node_id)));

    let directory = DirectoryStore::new(config.partners.clone(), config.files.clone());

    let supervisor = Supervisor::new(
        &config.node_id,
        journal,
        audit,
        directory,
        secrets,
        cluster,
        config.maintenance.clone(),
    );
    for listener in &config.listeners {
        supervisor.create_listener(listener.clone()).await?;
    }
    Ok(supervisor)
}
