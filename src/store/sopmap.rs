//! Persistent `incident_key → sop_id` mapping.
//!
//! The whole map lives in one JSON object replaced atomically (write temp,
//! rename) on every update. Once assigned, a mapping only changes through an
//! explicit `set`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use log::warn;
use sha1::{Digest, Sha1};
use tokio::sync::RwLock;

/// Derive the stable identifier for an unknown incident key.
pub fn derive_sop_id(incident_key: &str) -> String {
    let digest = Sha1::digest(incident_key.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("sop_{}", &hex[..12])
}

pub struct SopMap {
    path: PathBuf,
    data: RwLock<HashMap<String, String>>,
}

impl SopMap {
    /// Load the map from `path`, starting empty when the file is missing or
    /// unreadable.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating sopmap dir {}", parent.display()))?;
        }
        let data = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(map) => map,
                Err(e) => {
                    warn!("sopmap: unparseable map at {}, starting empty: {e}", path.display());
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.data.read().await.get(key).cloned()
    }

    /// Look the key up, deriving and persisting a fresh sop_id when absent.
    /// Idempotent: repeated calls return the same value and leave the file
    /// untouched.
    pub async fn get_or_create(&self, key: &str) -> Result<String> {
        if let Some(existing) = self.get(key).await {
            return Ok(existing);
        }
        let mut data = self.data.write().await;
        // Re-check under the write lock; another request may have won.
        if let Some(existing) = data.get(key) {
            return Ok(existing.clone());
        }
        let sop_id = derive_sop_id(key);
        data.insert(key.to_string(), sop_id.clone());
        persist(&self.path, &data).await?;
        Ok(sop_id)
    }

    /// Overwrite the mapping for `key` and persist.
    pub async fn set(&self, key: &str, sop_id: &str) -> Result<()> {
        if sop_id.is_empty() {
            bail!("empty sop_id");
        }
        let mut data = self.data.write().await;
        data.insert(key.to_string(), sop_id.to_string());
        persist(&self.path, &data).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Atomic replace: serialize to a sibling temp file, then rename over the
/// target.
async fn persist(path: &Path, data: &HashMap<String, String>) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(data).context("serializing sopmap")?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &bytes)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming {} into place", tmp.display()))
}
