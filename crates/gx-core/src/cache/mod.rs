//! Cache backends: snapshot persistence, artifact storage, and locking,
//! over either the local filesystem or an S3 bucket.

pub mod local;
pub mod s3;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;

use gx_store::{ProjectRegistry, Store};

use crate::config::Config;
use crate::errors::Result;
use crate::infra::Infra;

/// Releases an acquired cache lock.
pub type LockRelease = Box<dyn FnOnce() -> Result<()> + Send>;

/// A cached artifact on local disk.
///
/// When the file is staged (an S3 download or an uncached install), the
/// temp file rides along and is removed on drop.
pub struct ArtifactFile {
    path: PathBuf,
    meta: BTreeMap<String, String>,
    staged: Option<NamedTempFile>,
}

impl ArtifactFile {
    /// A committed artifact living at a stable path.
    pub fn persistent(path: PathBuf) -> Self {
        Self {
            path,
            meta: BTreeMap::new(),
            staged: None,
        }
    }

    /// A staged artifact backed by a temp file that dies with this value.
    pub fn staged(temp: NamedTempFile, meta: BTreeMap<String, String>) -> Self {
        Self {
            path: temp.path().to_path_buf(),
            meta,
            staged: Some(temp),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn meta(&self) -> &BTreeMap<String, String> {
        &self.meta
    }

    pub fn is_staged(&self) -> bool {
        self.staged.is_some()
    }
}

/// Access to cached collection tarballs.
pub trait ArtifactStore: Send + Sync {
    fn has(&self, key: &str) -> Result<bool>;
    fn fetch(&self, key: &str) -> Result<ArtifactFile>;
    fn temp_file(&self, prefix: &str) -> Result<NamedTempFile>;
    fn commit(
        &self,
        key: &str,
        tmp: NamedTempFile,
        meta: BTreeMap<String, String>,
    ) -> Result<ArtifactFile>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// A cache backend: snapshot I/O, artifact I/O, and locking.
pub trait Backend: Send + Sync {
    fn open(&self) -> Result<()>;
    fn close(&self) -> Result<()>;
    fn lock(&self) -> Result<LockRelease>;
    fn load_store(&self) -> Result<Store>;
    fn save_store(&self, store: &Store) -> Result<()>;
    fn clear_files(&self) -> Result<()>;
    fn record_project(&self, requirements_file: &Path, download_path: &str) -> Result<()>;
    fn load_project_registry(&self) -> Result<ProjectRegistry>;
    fn artifacts(&self) -> Arc<dyn ArtifactStore>;
}

/// Selects a backend based on the configuration.
pub fn new_backend(cfg: &Config, infra: &Infra) -> Result<Box<dyn Backend>> {
    if cfg.s3.enabled {
        let temp_dir = (infra.temp_dir)();
        return Ok(Box::new(s3::S3Backend::new(
            cfg.s3.clone(),
            infra.http.clone(),
            temp_dir,
        )?));
    }
    Ok(Box::new(local::LocalBackend::new(cfg.cache_dir.clone())))
}
