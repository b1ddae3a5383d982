//! S3 cache backend.
//!
//! The whole snapshot store lives in one gzip-compressed JSON object; the
//! project registry is a plain JSON object; artifacts are individual
//! objects carrying their SHA-256 in user metadata; and writers coordinate
//! through a lease-style lock object.

mod artifacts;
mod client;

pub use artifacts::S3Artifacts;
pub use client::{meta_from_headers, PutBody, S3Client, EMPTY_SHA256};

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::blocking::Client;
use reqwest::header::HeaderMap;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::OffsetDateTime;

use gx_store::{resolve_collections_path, ProjectRecord, ProjectRegistry, Store};

use crate::cache::{ArtifactStore, Backend, LockRelease};
use crate::config::S3CacheConfig;
use crate::errors::{Error, Result};

const STATE_PREFIX: &str = "state";
const ARTIFACTS_PREFIX: &str = "artifacts";
const LOCKS_PREFIX: &str = "locks";
const STORE_OBJECT: &str = "store.json.gz";
const PROJECTS_OBJECT: &str = "projects.json";
const LOCK_OBJECT: &str = "cache.lock";
const LOCK_TTL: Duration = Duration::from_secs(10 * 60);

pub struct S3Backend {
    client: Arc<S3Client>,
    prefix: String,
    artifacts: Arc<S3Artifacts>,
    opened: AtomicBool,
}

impl S3Backend {
    pub fn new(cfg: S3CacheConfig, http: Client, temp_dir: PathBuf) -> Result<Self> {
        let prefix = cfg.prefix.trim_matches('/').to_string();
        let client = Arc::new(S3Client::new(cfg, http)?);
        let artifacts_prefix = join_key(&prefix, &[ARTIFACTS_PREFIX]);
        let artifacts = Arc::new(S3Artifacts::new(
            client.clone(),
            artifacts_prefix,
            temp_dir,
        ));
        Ok(Self {
            client,
            prefix,
            artifacts,
            opened: AtomicBool::new(false),
        })
    }

    fn key(&self, parts: &[&str]) -> String {
        join_key(&self.prefix, parts)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.opened.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.client.ensure_bucket()?;
        self.opened.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Downloads an object, transparently inflating gzip content.
    fn read_object(&self, key: &str) -> Result<Vec<u8>> {
        let response = self.client.get_object(key)?;
        let gzip_encoded = response
            .headers()
            .get("Content-Encoding")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_lowercase().contains("gzip"))
            .unwrap_or(false)
            || key.ends_with(".gz");
        let mut raw = Vec::new();
        let mut body = response;
        body.copy_to(&mut raw)?;
        if !gzip_encoded || !is_gzip_stream(&raw) {
            return Ok(raw);
        }
        let mut inflated = Vec::new();
        GzDecoder::new(raw.as_slice()).read_to_end(&mut inflated)?;
        Ok(inflated)
    }

    fn put_lock(&self, lock_key: &str) -> Result<()> {
        let host = std::env::var("HOSTNAME").unwrap_or_default();
        let now = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        let pid = std::process::id();
        let payload = format!("pid={pid} host={host} time={now}\n");
        let meta = BTreeMap::from([
            ("pid".to_string(), pid.to_string()),
            ("host".to_string(), host),
            ("time".to_string(), now),
        ]);
        self.client.put_object(
            lock_key,
            PutBody::Bytes(payload.into_bytes()),
            "text/plain",
            "",
            &meta,
            true,
            "",
        )
    }

    fn acquire_lock(&self, lock_key: String) -> Result<LockRelease> {
        let client = self.client.clone();
        let release_key = lock_key.clone();
        let release: LockRelease = Box::new(move || client.delete_object(&release_key));

        match self.put_lock(&lock_key) {
            Ok(()) => return Ok(release),
            Err(Error::S3PreconditionFailed) => {}
            Err(err) => return Err(err),
        }
        self.handle_existing_lock(&lock_key, release)
    }

    fn handle_existing_lock(&self, lock_key: &str, release: LockRelease) -> Result<LockRelease> {
        let headers = match self.client.head_object(lock_key) {
            Ok(headers) => headers,
            Err(Error::S3NotFound) => {
                return match self.put_lock(lock_key) {
                    Ok(()) => Ok(release),
                    Err(Error::S3PreconditionFailed) => {
                        Err(Error::S3LockExists(lock_key.to_string()))
                    }
                    Err(err) => Err(err),
                };
            }
            Err(err) => return Err(err),
        };
        if !lock_expired(&headers, LOCK_TTL)? {
            return Err(Error::S3LockExists(lock_key.to_string()));
        }
        self.client.delete_object(lock_key)?;
        match self.put_lock(lock_key) {
            Ok(()) => Ok(release),
            Err(Error::S3PreconditionFailed) => Err(Error::S3LockExists(lock_key.to_string())),
            Err(err) => Err(err),
        }
    }
}

impl Backend for S3Backend {
    fn open(&self) -> Result<()> {
        self.ensure_open()
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn lock(&self) -> Result<LockRelease> {
        self.ensure_open()?;
        let lock_key = self.key(&[LOCKS_PREFIX, LOCK_OBJECT]);
        self.acquire_lock(lock_key)
    }

    fn load_store(&self) -> Result<Store> {
        self.ensure_open()?;
        let key = self.key(&[STATE_PREFIX, STORE_OBJECT]);
        let data = match self.read_object(&key) {
            Ok(data) => data,
            Err(Error::S3NotFound) => return Ok(Store::new()),
            Err(err) => return Err(err),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    fn save_store(&self, store: &Store) -> Result<()> {
        self.ensure_open()?;
        let payload = serde_json::to_vec(store)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&payload)?;
        let compressed = encoder.finish()?;
        let key = self.key(&[STATE_PREFIX, STORE_OBJECT]);
        self.client.put_object(
            &key,
            PutBody::Bytes(compressed),
            "application/json",
            "gzip",
            &BTreeMap::new(),
            false,
            "",
        )
    }

    fn clear_files(&self) -> Result<()> {
        self.ensure_open()?;
        let prefix = self.key(&[ARTIFACTS_PREFIX]);
        for key in self.client.list_objects(&prefix)? {
            self.client.delete_object(&key)?;
        }
        Ok(())
    }

    fn record_project(&self, requirements_file: &Path, download_path: &str) -> Result<()> {
        self.ensure_open()?;
        let mut registry = self.load_project_registry()?;
        let abs_req = if requirements_file.is_absolute() {
            requirements_file.to_path_buf()
        } else {
            std::env::current_dir()?.join(requirements_file)
        };
        let project_path = abs_req
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        let collections_path = resolve_collections_path(&project_path, download_path);
        registry.projects.insert(
            project_path.display().to_string(),
            ProjectRecord {
                requirements_file: abs_req.display().to_string(),
                collections_path,
                last_run: OffsetDateTime::now_utc(),
            },
        );
        let payload = serde_json::to_vec_pretty(&registry)?;
        let key = self.key(&[STATE_PREFIX, PROJECTS_OBJECT]);
        self.client.put_object(
            &key,
            PutBody::Bytes(payload),
            "application/json",
            "",
            &BTreeMap::new(),
            false,
            "",
        )
    }

    fn load_project_registry(&self) -> Result<ProjectRegistry> {
        self.ensure_open()?;
        let key = self.key(&[STATE_PREFIX, PROJECTS_OBJECT]);
        let data = match self.read_object(&key) {
            Ok(data) => data,
            Err(Error::S3NotFound) => return Ok(ProjectRegistry::default()),
            Err(err) => return Err(err),
        };
        Ok(serde_json::from_slice(&data).unwrap_or_default())
    }

    fn artifacts(&self) -> Arc<dyn ArtifactStore> {
        self.artifacts.clone()
    }
}

fn join_key(prefix: &str, parts: &[&str]) -> String {
    let mut out: Vec<&str> = Vec::with_capacity(parts.len() + 1);
    if !prefix.is_empty() {
        out.push(prefix);
    }
    out.extend_from_slice(parts);
    out.join("/")
}

fn is_gzip_stream(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

/// Reports whether the lock object is older than the lease TTL.
fn lock_expired(headers: &HeaderMap, ttl: Duration) -> Result<bool> {
    let timestamp = lock_timestamp(headers)?;
    let age = OffsetDateTime::now_utc() - timestamp;
    Ok(age > time::Duration::seconds(ttl.as_secs() as i64))
}

fn lock_timestamp(headers: &HeaderMap) -> Result<OffsetDateTime> {
    if let Some(value) = headers
        .get("x-amz-meta-time")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return OffsetDateTime::parse(value, &Rfc3339)
            .map_err(|_| Error::S3LockTimestampMissing);
    }
    if let Some(value) = headers
        .get("Last-Modified")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        let imf_fixdate = format_description!(
            "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
        );
        return time::PrimitiveDateTime::parse(value, &imf_fixdate)
            .map(time::PrimitiveDateTime::assume_utc)
            .map_err(|_| Error::S3LockTimestampMissing);
    }
    Err(Error::S3LockTimestampMissing)
}
