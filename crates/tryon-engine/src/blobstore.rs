use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// Content-addressed blob directory for clean garment assets and source
/// references. Blob refs are plain paths derived from the byte digest; the
/// pipeline never deletes blobs.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store bytes under their digest; returns the blob ref. Re-uploading
    /// identical bytes is a no-op returning the same ref.
    pub fn put(&self, bytes: &[u8], label: &str, ext: &str) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let digest = hex::encode(&hasher.finalize()[..16]);
        let path = self.root.join(format!("{digest}-{label}.{ext}"));
        if !path.exists() {
            std::fs::create_dir_all(&self.root)
                .with_context(|| format!("failed creating blob dir {}", self.root.display()))?;
            std::fs::write(&path, bytes)
                .with_context(|| format!("failed writing blob {}", path.display()))?;
        }
        Ok(path.to_string_lossy().to_string())
    }

    pub fn get(&self, blob_ref: &str) -> Result<Vec<u8>> {
        std::fs::read(blob_ref).with_context(|| format!("failed reading blob {blob_ref}"))
    }
}
