//! Partner and logical-file lookup.
//!
//! Read-mostly configuration: lookups go through an immutable snapshot
//! (`Arc<Directory>`); reload swaps the whole snapshot so a session's view
//! never changes mid-flight.

use crate::config::{LogicalFileConfig, PartnerConfig};
use std::sync::{Arc, RwLock};

/// An immutable view over the configured partners and logical files.
#[derive(Debug, Clone)]
pub struct Directory {
    partners: Vec<PartnerConfig>,
    files: Vec<LogicalFileConfig>,
}

impl Directory {
    pub fn new(partners: Vec<PartnerConfig>, files: Vec<LogicalFileConfig>) -> Self {
        Directory { partners, files }
    }

    /// Exact-match lookup first; case-insensitive fallback after a miss.
    pub fn find_partner(&self, id: &str) -> Option<&PartnerConfig> {
        self.partners
            .iter()
            .find(|p| p.id == id)
            .or_else(|| self.partners.iter().find(|p| p.id.eq_ignore_ascii_case(id)))
    }

    /// Resolve a logical file: exact id, then `*`-wildcard patterns in
    /// declaration order.
    pub fn resolve_file(&self, name: &str) -> Option<&LogicalFileConfig> {
        self.files.iter().find(|f| f.id == name).or_else(|| {
            self.files.iter().find(|f| {
                f.pattern
                    .as_deref()
                    .is_some_and(|p| wildcard_match(p, name))
            })
        })
    }
}

/// Shared handle whose snapshot can be swapped atomically on reload.
#[derive(Clone)]
pub struct DirectoryStore {
    inner: Arc<RwLock<Arc<Directory>>>,
}

impl DirectoryStore {
    pub fn new(partners: Vec<PartnerConfig>, files: Vec<LogicalFileConfig>) -> Self {
        DirectoryStore {
            inner: Arc::new(RwLock::new(Arc::new(Directory::new(partners, files)))),
        }
    }

    /// The current snapshot; sessions capture this once at session start.
    pub fn snapshot(&self) -> Arc<Directory> {
        self.inner.read().expect("directory lock poisoned").clone()
    }

    /// Swap in a new snapshot; in-flight sessions keep the old one.
    pub fn reload(&self, partners: Vec<PartnerConfig>, files: Vec<LogicalFileConfig>) {
        *self.inner.write().expect("directory lock poisoned") =
            Arc::new(Directory::new(partners, files));
    }
}

/// Match `name` against a pattern where `*` matches any run of characters.
fn wildcard_match(pattern: &str, name: &str) -> bool {
    fn inner(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..])),
            (Some(pc), Some(nc)) if pc == nc => inner(&p[1..], &n[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}
