//! Persistent ban table: owner id -> reason.
//!
//! Loaded wholesale at startup and rewritten wholesale on every mutation.
//! A missing or unreadable file degrades to an empty table; bans never
//! expire on their own.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::RwLock;
use tracing::warn;

pub struct BanList {
    path: PathBuf,
    inner: RwLock<HashMap<String, String>>,
}

impl BanList {
    /// Load the table from `path`, falling back to empty on any failure.
    pub fn load(path: &Path) -> Self {
        let table = match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<HashMap<String, String>>(&raw) {
                Ok(table) => table,
                Err(e) => {
                    warn!("ban file {} is not valid JSON, starting empty: {}", path.display(), e);
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!("cannot read ban file {}, starting empty: {}", path.display(), e);
                HashMap::new()
            }
        };
        Self {
            path: path.to_path_buf(),
            inner: RwLock::new(table),
        }
    }

    pub async fn reason_for(&self, owner: &str) -> Option<String> {
        self.inner.read().await.get(owner).cloned()
    }

    /// Record a ban and persist. Returns the previous reason, if any.
    pub async fn ban(&self, owner: &str, reason: &str) -> Option<String> {
        let mut table = self.inner.write().await;
        let previous = table.insert(owner.to_string(), reason.to_string());
        self.save(&table);
        previous
    }

    /// Lift a ban and persist. Returns false if the owner was not banned.
    pub async fn unban(&self, owner: &str) -> bool {
        let mut table = self.inner.write().await;
        let removed = table.remove(owner).is_some();
        if removed {
            self.save(&table);
        }
        removed
    }

    pub async fn all(&self) -> HashMap<String, String> {
        self.inner.read().await.clone()
    }

    // Persistence is best-effort: the in-memory table stays authoritative
    // for this process even if the write fails.
    fn save(&self, table: &HashMap<String, String>) {
        let json = match serde_json::to_string_pretty(table) {
            Ok(json) => json,
            Err(e) => {
                warn!("cannot serialize ban table: {}", e);
                return;
            }
        };
        if let Err(e) = std::fs::write(&self.path, json) {
            warn!("cannot write ban file {}: {}", self.path.display(), e);
        }
    }
}
