//! Server configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/pesit/server.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `node_id`
//! - At least one `[[listeners]]` entry
//!
//! Partner and logical-file records live in the same file and are loaded
//! into an immutable snapshot; reload swaps the whole snapshot so a
//! session's view is stable for its lifetime.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Validated config types
// ---------------------------------------------------------------------------

/// Top-level server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub schema_version: u32,
    /// Cluster-wide unique name of this node.
    pub node_id: String,
    pub storage: StorageConfig,
    pub secrets: SecretsConfig,
    pub cluster: ClusterConfig,
    pub maintenance: MaintenanceConfig,
    pub listeners: Vec<ListenerConfig>,
    pub partners: Vec<PartnerConfig>,
    pub files: Vec<LogicalFileConfig>,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub sqlite_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SecretsConfig {
    /// Hex-encoded 32-byte AES key file; None disables the AES backend.
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Terminal transfer records older than this are pruned.
    pub prune_after_days: u32,
    /// How often the prune timer fires.
    pub prune_interval_secs: u64,
}

/// One listener (server instance) definition.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// At most 8 uppercase alphanumeric characters.
    pub server_id: String,
    pub port: u16,
    pub bind_address: String,
    pub protocol_version: u8,
    pub max_connections: usize,
    pub connection_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub receive_directory: PathBuf,
    pub send_directory: PathBuf,
    pub max_entity_size: usize,
    pub sync_points_enabled: bool,
    pub sync_interval_kb: u32,
    pub resync_enabled: bool,
    pub strict_partner_check: bool,
    pub strict_file_check: bool,
    pub auto_start: bool,
    /// Consume unknown leading bytes until a CONNECT header arrives.
    pub pre_connection_filter: bool,
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    /// Require and verify a client certificate chain (mTLS).
    pub require_client_auth: bool,
    /// Trust roots for client-chain verification.
    pub ca_file: Option<PathBuf>,
}

/// Access rights a partner may be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartnerAccess {
    Read,
    Write,
    Both,
}

impl PartnerAccess {
    /// Whether the requested PI_22 access type (0 read, 1 write, 2 mixed)
    /// is covered by this grant.
    pub fn allows(self, access_type: u8) -> bool {
        match access_type {
            0 => matches!(self, PartnerAccess::Read | PartnerAccess::Both),
            1 => matches!(self, PartnerAccess::Write | PartnerAccess::Both),
            2 => matches!(self, PartnerAccess::Both),
            _ => false,
        }
    }
}

/// A partner record.
#[derive(Debug, Clone)]
pub struct PartnerConfig {
    pub id: String,
    pub enabled: bool,
    /// Stored credential; plaintext or a tagged secret (`AES:v2:`…).
    /// None means no password is required.
    pub password: Option<String>,
    pub access: PartnerAccess,
}

/// A logical-file record.
#[derive(Debug, Clone)]
pub struct LogicalFileConfig {
    /// Virtual file identifier, matched against PI_12.
    pub id: String,
    /// Optional `*`-wildcard pattern matched after an exact-id miss.
    pub pattern: Option<String>,
    /// Subdirectory under the listener's receive/send directory.
    pub directory: Option<String>,
    pub record_format: String,
    pub record_length: u32,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    node_id: Option<String>,
    storage: Option<RawStorage>,
    secrets: Option<RawSecrets>,
    cluster: Option<RawCluster>,
    maintenance: Option<RawMaintenance>,
    listeners: Option<Vec<RawListener>>,
    partners: Option<Vec<RawPartner>>,
    files: Option<Vec<RawLogicalFile>>,
}

#[derive(Debug, Deserialize)]
struct RawStorage {
    sqlite_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSecrets {
    key_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCluster {
    enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawMaintenance {
    prune_after_days: Option<u32>,
    prune_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawListener {
    server_id: Option<String>,
    port: Option<u16>,
    bind_address: Option<String>,
    protocol_version: Option<u8>,
    max_connections: Option<usize>,
    connection_timeout_ms: Option<u64>,
    read_timeout_ms: Option<u64>,
    receive_directory: Option<String>,
    send_directory: Option<String>,
    max_entity_size: Option<usize>,
    sync_points_enabled: Option<bool>,
    sync_interval_kb: Option<u32>,
    resync_enabled: Option<bool>,
    strict_partner_check: Option<bool>,
    strict_file_check: Option<bool>,
    auto_start: Option<bool>,
    pre_connection_filter: Option<bool>,
    tls: Option<RawTls>,
}

#[derive(Debug, Deserialize)]
struct RawTls {
    cert_file: Option<String>,
    key_file: Option<String>,
    require_client_auth: Option<bool>,
    ca_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPartner {
    id: Option<String>,
    enabled: Option<bool>,
    password: Option<String>,
    access: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawLogicalFile {
    id: Option<String>,
    pattern: Option<String>,
    directory: Option<String>,
    record_format: Option<String>,
    record_length: Option<u32>,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO: {0}")]
    Io(String),
    #[error("Parse: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load server config from the default path `/etc/pesit/server.toml`.
pub fn load_config() -> Result<ServerConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/pesit/server.toml"))
}

pub fn load_config_from_path(path: &Path) -> Result<ServerConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

pub fn load_config_from_str(toml_str: &str) -> Result<ServerConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    let node_id = raw
        .node_id
        .ok_or_else(|| ConfigError::MissingField("node_id".to_owned()))?;
    if node_id.trim().is_empty() {
        return Err(ConfigError::InvalidValue("node_id must not be empty".to_owned()));
    }

    let storage = StorageConfig {
        sqlite_path: raw
            .storage
            .and_then(|s| s.sqlite_path)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/pesit/server.sqlite3")),
    };

    let secrets = SecretsConfig {
        key_file: raw.secrets.and_then(|s| s.key_file).map(PathBuf::from),
    };

    let cluster = ClusterConfig {
        enabled: raw.cluster.and_then(|c| c.enabled).unwrap_or(false),
    };

    let maintenance = match raw.maintenance {
        Some(m) => MaintenanceConfig {
            prune_after_days: m.prune_after_days.unwrap_or(30),
            prune_interval_secs: m.prune_interval_secs.unwrap_or(3600),
        },
        None => MaintenanceConfig {
            prune_after_days: 30,
            prune_interval_secs: 3600,
        },
    };

    let raw_listeners = raw
        .listeners
        .ok_or_else(|| ConfigError::MissingField("listeners".to_owned()))?;
    if raw_listeners.is_empty() {
        return Err(ConfigError::InvalidValue(
            "at least one [[listeners]] entry is required".to_owned(),
        ));
    }
    let mut listeners = Vec::with_capacity(raw_listeners.len());
    for (i, l) in raw_listeners.into_iter().enumerate() {
        listeners.push(validate_listener(i, l)?);
    }

    let mut partners = Vec::new();
    for (i, p) in raw.partners.unwrap_or_default().into_iter().enumerate() {
        let id = p
            .id
            .ok_or_else(|| ConfigError::MissingField(format!("partners[{}].id", i)))?;
        let access = match p.access.as_deref().unwrap_or("both") {
            "read" => PartnerAccess::Read,
            "write" => PartnerAccess::Write,
            "both" => PartnerAccess::Both,
            other => {
                return Err(ConfigError::InvalidValue(format!(
                    "partners[{}].access must be read|write|both, got '{}'",
                    i, other
                )));
            }
        };
        partners.push(PartnerConfig {
            id,
            enabled: p.enabled.unwrap_or(true),
            password: p.password,
            access,
        });
    }

    let mut files = Vec::new();
    for (i, f) in raw.files.unwrap_or_default().into_iter().enumerate() {
        files.push(LogicalFileConfig {
            id: f
                .id
                .ok_or_else(|| ConfigError::MissingField(format!("files[{}].id", i)))?,
            pattern: f.pattern,
            directory: f.directory,
            record_format: f.record_format.unwrap_or_else(|| "V".to_owned()),
            record_length: f.record_length.unwrap_or(0),
        });
    }

    Ok(ServerConfig {
        schema_version,
        node_id,
        storage,
        secrets,
        cluster,
        maintenance,
        listeners,
        partners,
        files,
    })
}

fn validate_listener(i: usize, l: RawListener) -> Result<ListenerConfig, ConfigError> {
    let server_id = l
        .server_id
        .ok_or_else(|| ConfigError::MissingField(format!("listeners[{}].server_id", i)))?;
    validate_server_id(&server_id)?;

    let port = l
        .port
        .ok_or_else(|| ConfigError::MissingField(format!("listeners[{}].port", i)))?;
    if port == 0 {
        return Err(ConfigError::InvalidValue(format!(
            "listeners[{}].port must be 1..65535",
            i
        )));
    }

    let receive_directory = l
        .receive_directory
        .ok_or_else(|| ConfigError::MissingField(format!("listeners[{}].receive_directory", i)))?;
    let send_directory = l
        .send_directory
        .ok_or_else(|| ConfigError::MissingField(format!("listeners[{}].send_directory", i)))?;

    let max_connections = l.max_connections.unwrap_or(32);
    if max_connections == 0 {
        return Err(ConfigError::InvalidValue(format!(
            "listeners[{}].max_connections must be > 0",
            i
        )));
    }
    let max_entity_size = l.max_entity_size.unwrap_or(32 * 1024);
    if max_entity_size == 0 {
        return Err(ConfigError::InvalidValue(format!(
            "listeners[{}].max_entity_size must be > 0",
            i
        )));
    }
    let sync_interval_kb = l.sync_interval_kb.unwrap_or(64);
    if sync_interval_kb == 0 {
        return Err(ConfigError::InvalidValue(format!(
            "listeners[{}].sync_interval_kb must be > 0",
            i
        )));
    }

    let tls = match l.tls {
        Some(t) => Some(TlsConfig {
            cert_file: t
                .cert_file
                .map(PathBuf::from)
                .ok_or_else(|| ConfigError::MissingField(format!("listeners[{}].tls.cert_file", i)))?,
            key_file: t
                .key_file
                .map(PathBuf::from)
                .ok_or_else(|| ConfigError::MissingField(format!("listeners[{}].tls.key_file", i)))?,
            require_client_auth: t.require_client_auth.unwrap_or(false),
            ca_file: t.ca_file.map(PathBuf::from),
        }),
        None => None,
    };
    if let Some(t) = &tls {
        if t.require_client_auth && t.ca_file.is_none() {
            return Err(ConfigError::InvalidValue(format!(
                "listeners[{}].tls.ca_file is required when require_client_auth is set",
                i
            )));
        }
    }

    Ok(ListenerConfig {
        server_id,
        port,
        bind_address: l.bind_address.unwrap_or_else(|| "0.0.0.0".to_owned()),
        protocol_version: l.protocol_version.unwrap_or(pesit_core::PROTOCOL_VERSION),
        max_connections,
        connection_timeout_ms: l.connection_timeout_ms.unwrap_or(10_000),
        read_timeout_ms: l.read_timeout_ms.unwrap_or(30_000),
        receive_directory: PathBuf::from(receive_directory),
        send_directory: PathBuf::from(send_directory),
        max_entity_size,
        sync_points_enabled: l.sync_points_enabled.unwrap_or(true),
        sync_interval_kb,
        resync_enabled: l.resync_enabled.unwrap_or(false),
        strict_partner_check: l.strict_partner_check.unwrap_or(true),
        strict_file_check: l.strict_file_check.unwrap_or(true),
        auto_start: l.auto_start.unwrap_or(true),
        pre_connection_filter: l.pre_connection_filter.unwrap_or(false),
        tls,
    })
}

/// A server id is at most 8 uppercase alphanumeric characters.
pub fn validate_server_id(id: &str) -> Result<(), ConfigError> {
    if id.is_empty() || id.len() > 8 {
        return Err(ConfigError::InvalidValue(format!(
            "server_id '{}' must be 1..8 characters",
            id
        )));
    }
    if !id.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()) {
        return Err(ConfigError::InvalidValue(format!(
            "server_id '{}' must be uppercase alphanumeric",
            id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        schema_version = 1
        node_id = "node-a"

        [[listeners]]
        server_id = "SRV1"
        port = 17617
        receive_directory = "/tmp/in"
        send_directory = "/tmp/out"
    "#;

    #[test]
    fn minimal_config_applies_defaults() {
        let cfg = load_config_from_str(MINIMAL).unwrap();
        assert_eq!(cfg.node_id, "node-a");
        let l = &cfg.listeners[0];
        assert_eq!(l.server_id, "SRV1");
        assert_eq!(l.bind_address, "0.0.0.0");
        assert_eq!(l.protocol_version, 2);
        assert_eq!(l.max_connections, 32);
        assert!(l.sync_points_enabled);
        assert!(l.strict_partner_check);
        assert!(l.auto_start);
        assert!(!l.pre_connection_filter);
        assert!(l.tls.is_none());
        assert_eq!(cfg.maintenance.prune_after_days, 30);
    }

    #[test]
    fn missing_listeners_is_an_error() {
        let err = load_config_from_str("schema_version = 1\nnode_id = \"n\"").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(f) if f == "listeners"));
    }

    #[test]
    fn server_id_shape_is_enforced() {
        assert!(validate_server_id("SRV1").is_ok());
        assert!(validate_server_id("ABCDEFGH").is_ok());
        assert!(validate_server_id("srv1").is_err());
        assert!(validate_server_id("TOOLONGID").is_err());
        assert!(validate_server_id("").is_err());
        assert!(validate_server_id("SRV-1").is_err());
    }

    #[test]
    fn partner_access_parsing() {
        let toml = format!(
            "{MINIMAL}\n[[partners]]\nid = \"PART01\"\npassword = \"secret\"\naccess = \"write\"\n"
        );
        let cfg = load_config_from_str(&toml).unwrap();
        assert_eq!(cfg.partners[0].access, PartnerAccess::Write);
        assert!(cfg.partners[0].enabled);

        let bad = format!("{MINIMAL}\n[[partners]]\nid = \"P\"\naccess = \"admin\"\n");
        assert!(load_config_from_str(&bad).is_err());
    }

    #[test]
    fn access_grants_cover_requested_types() {
        assert!(PartnerAccess::Read.allows(0));
        assert!(!PartnerAccess::Read.allows(1));
        assert!(!PartnerAccess::Read.allows(2));
        assert!(PartnerAccess::Write.allows(1));
        assert!(!PartnerAccess::Write.allows(0));
        assert!(PartnerAccess::Both.allows(0));
        assert!(PartnerAccess::Both.allows(1));
        assert!(PartnerAccess::Both.allows(2));
        assert!(!PartnerAccess::Both.allows(3));
    }

    #[test]
    fn mtls_without_ca_file_is_rejected() {
        let toml = r#"
            schema_version = 1
            node_id = "n"

            [[listeners]]
            server_id = "SRV1"
            port = 1
            receive_directory = "/tmp/in"
            send_directory = "/tmp/out"

            [listeners.tls]
            cert_file = "/etc/pesit/server.pem"
            key_file = "/etc/pesit/server.key"
            require_client_auth = true
        "#;
        assert!(matches!(
            load_config_from_str(toml).unwrap_err(),
            ConfigError::InvalidValue(_)
        ));
    }

    #[test]
    fn zero_port_is_rejected() {
        let toml = MINIMAL.replace("port = 17617", "port = 0");
        assert!(load_config_from_str(&toml).is_err());
    }
}
