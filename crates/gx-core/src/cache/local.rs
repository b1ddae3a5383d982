//! Filesystem cache backend.
//!
//! Snapshot buckets are SQLite files in the cache directory; artifacts are
//! stored next to them under their URL-escaped tarball names, committed via
//! rename so `has` never observes a partial file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tempfile::NamedTempFile;

use gx_store::{
    acquire_lock, clear_cache_files, load_project_registry, open_dbs, record_project, Dbs,
    ProjectRegistry, Store, StoreError,
};

use crate::cache::{ArtifactFile, ArtifactStore, Backend, LockRelease};
use crate::errors::{Error, Result};

pub struct LocalBackend {
    cache_dir: PathBuf,
    dbs: Mutex<Option<Dbs>>,
    artifacts: Arc<LocalArtifacts>,
}

impl LocalBackend {
    pub fn new(cache_dir: PathBuf) -> Self {
        let artifacts = Arc::new(LocalArtifacts {
            cache_dir: cache_dir.clone(),
        });
        Self {
            cache_dir,
            dbs: Mutex::new(None),
            artifacts,
        }
    }

    fn with_dbs<T>(&self, f: impl FnOnce(&mut Dbs) -> Result<T>) -> Result<T> {
        let mut guard = self.dbs.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            if self.cache_dir.as_os_str().is_empty() {
                return Err(StoreError::CacheDirEmpty.into());
            }
            fs::create_dir_all(&self.cache_dir)?;
            *guard = Some(open_dbs(&self.cache_dir)?);
        }
        match guard.as_mut() {
            Some(dbs) => f(dbs),
            None => Err(StoreError::CacheDirEmpty.into()),
        }
    }
}

impl Backend for LocalBackend {
    fn open(&self) -> Result<()> {
        self.with_dbs(|_| Ok(()))
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.dbs.lock().unwrap_or_else(|e| e.into_inner());
        *guard = None;
        Ok(())
    }

    fn lock(&self) -> Result<LockRelease> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err(StoreError::CacheDirEmpty.into());
        }
        let lock = acquire_lock(&self.cache_dir)?;
        Ok(Box::new(move || lock.release().map_err(Error::from)))
    }

    fn load_store(&self) -> Result<Store> {
        self.with_dbs(|dbs| Ok(dbs.load()?))
    }

    fn save_store(&self, store: &Store) -> Result<()> {
        self.with_dbs(|dbs| Ok(dbs.save(store)?))
    }

    fn clear_files(&self) -> Result<()> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err(StoreError::CacheDirEmpty.into());
        }
        Ok(clear_cache_files(&self.cache_dir)?)
    }

    fn record_project(&self, requirements_file: &Path, download_path: &str) -> Result<()> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err(StoreError::CacheDirEmpty.into());
        }
        Ok(record_project(&self.cache_dir, requirements_file, download_path)?)
    }

    fn load_project_registry(&self) -> Result<ProjectRegistry> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err(StoreError::CacheDirEmpty.into());
        }
        Ok(load_project_registry(&self.cache_dir)?)
    }

    fn artifacts(&self) -> Arc<dyn ArtifactStore> {
        self.artifacts.clone()
    }
}

pub struct LocalArtifacts {
    cache_dir: PathBuf,
}

impl LocalArtifacts {
    fn path(&self, key: &str) -> Result<PathBuf> {
        if key.trim().is_empty() {
            return Err(Error::ArtifactCacheNotConfigured);
        }
        if self.cache_dir.as_os_str().is_empty() {
            return Err(StoreError::CacheDirEmpty.into());
        }
        Ok(self.cache_dir.join(key))
    }
}

impl ArtifactStore for LocalArtifacts {
    fn has(&self, key: &str) -> Result<bool> {
        let path = self.path(key)?;
        match fs::metadata(&path) {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn fetch(&self, key: &str) -> Result<ArtifactFile> {
        let path = self.path(key)?;
        fs::metadata(&path)?;
        Ok(ArtifactFile::persistent(path))
    }

    fn temp_file(&self, prefix: &str) -> Result<NamedTempFile> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err(StoreError::CacheDirEmpty.into());
        }
        fs::create_dir_all(&self.cache_dir)?;
        Ok(tempfile::Builder::new()
            .prefix(prefix)
            .tempfile_in(&self.cache_dir)?)
    }

    fn commit(
        &self,
        key: &str,
        tmp: NamedTempFile,
        _meta: BTreeMap<String, String>,
    ) -> Result<ArtifactFile> {
        let path = self.path(key)?;
        tmp.persist(&path).map_err(|err| Error::Io(err.error))?;
        Ok(ArtifactFile::persistent(path))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
