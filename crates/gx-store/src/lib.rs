//! Durable snapshot state for gx.
//!
//! The snapshot is a set of independently persisted buckets (meta, API
//! cache, dependency cache, installed, graph, requirements, roots, resolved,
//! versions cache). In memory the buckets live behind a single read/write
//! lock; on disk each bucket is its own SQLite database so cache-only
//! buckets can be dropped without touching durable state.

mod clear;
mod db;
mod lock;
mod projects;

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

pub use clear::clear_cache_files;
pub use db::{open_dbs, Dbs};
pub use lock::{acquire_lock, LockFile};
pub use projects::{
    load_project_registry, record_project, resolve_collections_path, ProjectRecord,
    ProjectRegistry,
};

/// Current snapshot schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Process lock file name inside the cache directory.
pub const LOCK_FILE: &str = ".gx.lock";
/// Project registry file name inside the cache directory.
pub const PROJECTS_FILE: &str = "projects.json";

pub const DB_META: &str = "gx-meta.db";
pub const DB_API_CACHE: &str = "gx-api-cache.db";
pub const DB_DEPS_CACHE: &str = "gx-deps-cache.db";
pub const DB_INSTALLED: &str = "gx-installed.db";
pub const DB_GRAPH: &str = "gx-graph.db";
pub const DB_REQUIREMENTS: &str = "gx-requirements.db";
pub const DB_ROOTS: &str = "gx-roots.db";
pub const DB_RESOLVED: &str = "gx-resolved.db";
pub const DB_VERSIONS: &str = "gx-versions.db";

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache directory is empty")]
    CacheDirEmpty,
    #[error("another instance is running (pid {0})")]
    AnotherInstanceIsRunning(u32),
    #[error("lock file exists but is invalid: {0}")]
    InvalidLockFile(#[source] serde_json::Error),
    #[error("unsupported snapshot schema version: {0}")]
    UnsupportedSchemaVersion(u32),
    #[error("invalid snapshot time: {0}")]
    InvalidSnapshotTime(String),
    #[error("invalid bucket entry {bucket}/{key}: {source}")]
    InvalidBucketEntry {
        bucket: &'static str,
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Metadata about the persisted snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub schema_version: u32,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_snapshot: Option<OffsetDateTime>,
    #[serde(default)]
    pub requirements_hash: String,
    #[serde(default)]
    pub server: String,
}

/// A cached API response with its validation data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCacheEntry {
    pub url: String,
    #[serde(default)]
    pub etag: String,
    #[serde(default)]
    pub last_modified: String,
    #[serde(with = "time::serde::rfc3339")]
    pub fetched_at: OffsetDateTime,
    #[serde(default)]
    pub ttl_secs: u64,
    #[serde(default)]
    pub body: String,
}

/// An installed collection entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledEntry {
    pub install_path: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub artifact_sha256: String,
    #[serde(with = "time::serde::rfc3339")]
    pub installed_at: OffsetDateTime,
    #[serde(default)]
    pub deps: Vec<String>,
}

/// A resolved collection version and its source server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedEntry {
    pub version: String,
    #[serde(default)]
    pub source: String,
}

/// A normalized root requirement as recorded in the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequirementSpec {
    pub constraint: String,
    pub source: String,
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<String>,
}

/// Serialized view of the store contents, one field per bucket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreData {
    pub meta: SnapshotMeta,
    #[serde(default)]
    pub api_cache: BTreeMap<String, ApiCacheEntry>,
    #[serde(default)]
    pub deps_cache: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub installed: BTreeMap<String, InstalledEntry>,
    #[serde(default)]
    pub graph: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub requirements: BTreeMap<String, RequirementSpec>,
    #[serde(default)]
    pub roots: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub resolved: BTreeMap<String, ResolvedEntry>,
    #[serde(default)]
    pub versions_cache: BTreeMap<String, Vec<String>>,
}

/// In-memory snapshot store shared between the resolver and the installer.
///
/// Read accessors clone entries out so callers never alias the guarded maps.
#[derive(Debug)]
pub struct Store {
    inner: RwLock<StoreData>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreData {
                meta: SnapshotMeta {
                    schema_version: SCHEMA_VERSION,
                    ..SnapshotMeta::default()
                },
                ..StoreData::default()
            }),
        }
    }

    pub fn from_data(data: StoreData) -> Self {
        Self {
            inner: RwLock::new(data),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StoreData> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StoreData> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get_installed(&self, key: &str) -> Option<InstalledEntry> {
        self.read().installed.get(key).cloned()
    }

    pub fn set_installed(&self, key: &str, entry: InstalledEntry) {
        self.write().installed.insert(key.to_string(), entry);
    }

    pub fn delete_installed(&self, key: &str) {
        self.write().installed.remove(key);
    }

    pub fn get_deps_cache(&self, key: &str) -> Option<BTreeMap<String, String>> {
        self.read().deps_cache.get(key).cloned()
    }

    pub fn set_deps_cache(&self, key: &str, deps: BTreeMap<String, String>) {
        self.write().deps_cache.insert(key.to_string(), deps);
    }

    pub fn delete_deps_cache(&self, key: &str) {
        self.write().deps_cache.remove(key);
    }

    pub fn get_api_cache(&self, key: &str) -> Option<ApiCacheEntry> {
        self.read().api_cache.get(key).cloned()
    }

    pub fn set_api_cache(&self, key: &str, entry: ApiCacheEntry) {
        self.write().api_cache.insert(key.to_string(), entry);
    }

    /// Empties the API, dependency, and versions caches.
    pub fn clear_caches(&self) {
        let mut data = self.write();
        data.api_cache.clear();
        data.deps_cache.clear();
        data.versions_cache.clear();
    }

    pub fn get_versions_cache(&self, key: &str) -> Option<Vec<String>> {
        self.read()
            .versions_cache
            .get(key)
            .filter(|v| !v.is_empty())
            .cloned()
    }

    pub fn set_versions_cache(&self, key: &str, versions: Vec<String>) {
        self.write()
            .versions_cache
            .insert(key.to_string(), versions);
    }

    pub fn set_resolved_all(&self, resolved: BTreeMap<String, ResolvedEntry>) {
        self.write().resolved = resolved;
    }

    pub fn resolved_snapshot(&self) -> BTreeMap<String, ResolvedEntry> {
        self.read().resolved.clone()
    }

    pub fn set_graph(&self, key: &str, deps: Vec<String>) {
        self.write().graph.insert(key.to_string(), deps);
    }

    pub fn delete_graph(&self, key: &str) {
        self.write().graph.remove(key);
    }

    pub fn set_graph_snapshot(&self, graph: BTreeMap<String, Vec<String>>) {
        self.write().graph = graph;
    }

    pub fn graph_snapshot(&self) -> BTreeMap<String, Vec<String>> {
        self.read().graph.clone()
    }

    pub fn set_requirements(&self, spec: BTreeMap<String, RequirementSpec>) {
        self.write().requirements = spec;
    }

    pub fn requirements_snapshot(&self) -> BTreeMap<String, RequirementSpec> {
        self.read().requirements.clone()
    }

    pub fn set_roots(&self, key: &str, roots: Vec<String>) {
        self.write().roots.insert(key.to_string(), roots);
    }

    pub fn roots_snapshot(&self) -> BTreeMap<String, Vec<String>> {
        self.read().roots.clone()
    }

    pub fn meta_snapshot(&self) -> SnapshotMeta {
        self.read().meta.clone()
    }

    pub fn set_meta_requirements(&self, hash: &str, server: &str) {
        let mut data = self.write();
        data.meta.requirements_hash = hash.to_string();
        data.meta.server = server.to_string();
    }

    /// Clones the full bucket contents for persistence.
    pub fn snapshot_data(&self) -> StoreData {
        self.read().clone()
    }
}

impl Serialize for Store {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.snapshot_data().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Store {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        StoreData::deserialize(deserializer).map(Store::from_data)
    }
}

/// Returns the lock file path for a cache directory.
pub fn lock_path(cache_dir: &std::path::Path) -> PathBuf {
    cache_dir.join(LOCK_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_caches_keeps_durable_buckets() {
        let store = Store::new();
        store.set_api_cache(
            "k",
            ApiCacheEntry {
                url: "https://example.com".into(),
                etag: String::new(),
                last_modified: String::new(),
                fetched_at: OffsetDateTime::now_utc(),
                ttl_secs: 0,
                body: "{}".into(),
            },
        );
        store.set_deps_cache("a.b@1.0.0", BTreeMap::new());
        store.set_versions_cache("url", vec!["1.0.0".into()]);
        store.set_installed(
            "a.b@1.0.0",
            InstalledEntry {
                install_path: "/tmp/a/b".into(),
                source: String::new(),
                artifact_sha256: "abc".into(),
                installed_at: OffsetDateTime::now_utc(),
                deps: vec![],
            },
        );

        store.clear_caches();

        assert!(store.get_api_cache("k").is_none());
        assert!(store.get_deps_cache("a.b@1.0.0").is_none());
        assert!(store.get_versions_cache("url").is_none());
        assert!(store.get_installed("a.b@1.0.0").is_some());
    }

    #[test]
    fn snapshot_accessors_clone_out() {
        let store = Store::new();
        store.set_graph("a.b@1.0.0", vec!["c.d@2.0.0".into()]);
        let mut graph = store.graph_snapshot();
        graph.insert("x.y@9.9.9".into(), vec![]);
        assert!(!store.graph_snapshot().contains_key("x.y@9.9.9"));
    }

    #[test]
    fn store_round_trips_through_json() {
        let store = Store::new();
        store.set_meta_requirements("deadbeef", "https://galaxy.example.com");
        store.set_resolved_all(BTreeMap::from([(
            "a.b".to_string(),
            ResolvedEntry {
                version: "1.0.0".into(),
                source: "https://galaxy.example.com".into(),
            },
        )]));

        let payload = serde_json::to_string(&store).unwrap();
        let restored: Store = serde_json::from_str(&payload).unwrap();
        assert_eq!(restored.meta_snapshot().requirements_hash, "deadbeef");
        assert_eq!(
            restored.resolved_snapshot().get("a.b").unwrap().version,
            "1.0.0"
        );
    }
}
