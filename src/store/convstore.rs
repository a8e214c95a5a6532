//! Filesystem location service for per-sop conversation files.
//!
//! The store only resolves paths; the REPL's `/save` is the sole writer of
//! the file contents.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub struct ConvStore {
    root: PathBuf,
}

impl ConvStore {
    /// Ensure `root` exists and return the store.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("creating conversation root {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn path_for(&self, sop_id: &str) -> PathBuf {
        self.root.join(format!("{sop_id}.json"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
