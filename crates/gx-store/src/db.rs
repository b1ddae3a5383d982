//! SQLite persistence for the snapshot buckets.
//!
//! Each bucket is a standalone database holding a single `kv` table. Saves
//! rewrite a bucket inside one IMMEDIATE transaction (delete everything,
//! then refill), so a concurrent-free reader can never observe a mix of old
//! and new entries, and the clear-files policy can drop cache-only buckets
//! by removing their files.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::{
    ResolvedEntry, Result, SnapshotMeta, Store, StoreData, StoreError, DB_API_CACHE,
    DB_DEPS_CACHE, DB_GRAPH, DB_INSTALLED, DB_META, DB_REQUIREMENTS, DB_RESOLVED, DB_ROOTS,
    DB_VERSIONS, SCHEMA_VERSION,
};

const META_SCHEMA_VERSION: &str = "schema_version";
const META_LAST_SNAPSHOT: &str = "last_snapshot";
const META_REQUIREMENTS_HASH: &str = "requirements_hash";
const META_SERVER: &str = "server";

/// Open SQLite handles for every snapshot bucket.
pub struct Dbs {
    meta: Connection,
    api_cache: Connection,
    deps_cache: Connection,
    installed: Connection,
    graph: Connection,
    requirements: Connection,
    roots: Connection,
    resolved: Connection,
    versions: Connection,
}

/// Opens (creating if needed) all bucket databases under `cache_dir`.
pub fn open_dbs(cache_dir: &Path) -> Result<Dbs> {
    Ok(Dbs {
        meta: open_bucket(&cache_dir.join(DB_META))?,
        api_cache: open_bucket(&cache_dir.join(DB_API_CACHE))?,
        deps_cache: open_bucket(&cache_dir.join(DB_DEPS_CACHE))?,
        installed: open_bucket(&cache_dir.join(DB_INSTALLED))?,
        graph: open_bucket(&cache_dir.join(DB_GRAPH))?,
        requirements: open_bucket(&cache_dir.join(DB_REQUIREMENTS))?,
        roots: open_bucket(&cache_dir.join(DB_ROOTS))?,
        resolved: open_bucket(&cache_dir.join(DB_RESOLVED))?,
        versions: open_bucket(&cache_dir.join(DB_VERSIONS))?,
    })
}

fn open_bucket(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(10))?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
    )?;
    Ok(conn)
}

impl Dbs {
    /// Materializes every bucket into a fresh in-memory store.
    pub fn load(&self) -> Result<Store> {
        let mut data = StoreData {
            meta: SnapshotMeta {
                schema_version: SCHEMA_VERSION,
                ..SnapshotMeta::default()
            },
            ..StoreData::default()
        };

        self.load_meta(&mut data.meta)?;
        if data.meta.schema_version > SCHEMA_VERSION {
            return Err(StoreError::UnsupportedSchemaVersion(
                data.meta.schema_version,
            ));
        }

        data.api_cache = load_bucket(&self.api_cache, "api_cache")?;
        data.installed = load_bucket(&self.installed, "installed")?;
        data.deps_cache = load_bucket(&self.deps_cache, "deps_cache")?;
        data.graph = load_bucket(&self.graph, "graph")?;
        data.requirements = load_bucket(&self.requirements, "requirements")?;
        data.roots = load_bucket(&self.roots, "roots")?;
        data.resolved = load_resolved(&self.resolved)?;
        data.versions_cache = load_bucket(&self.versions, "versions_cache")?;

        Ok(Store::from_data(data))
    }

    /// Persists the store, stamping the schema version and snapshot time.
    pub fn save(&mut self, store: &Store) -> Result<()> {
        let mut data = store.snapshot_data();
        data.meta.schema_version = SCHEMA_VERSION;
        data.meta.last_snapshot = Some(OffsetDateTime::now_utc());

        self.save_meta(&data.meta)?;
        save_bucket(&mut self.api_cache, &data.api_cache)?;
        save_bucket(&mut self.deps_cache, &data.deps_cache)?;
        save_bucket(&mut self.installed, &data.installed)?;
        save_bucket(&mut self.graph, &data.graph)?;
        save_bucket(&mut self.requirements, &data.requirements)?;
        save_bucket(&mut self.roots, &data.roots)?;
        save_bucket(&mut self.resolved, &data.resolved)?;
        save_bucket(&mut self.versions, &data.versions_cache)?;
        Ok(())
    }

    fn load_meta(&self, meta: &mut SnapshotMeta) -> Result<()> {
        let rows = read_rows(&self.meta)?;
        if let Some(value) = rows.get(META_SCHEMA_VERSION) {
            meta.schema_version = value
                .parse()
                .map_err(|_| StoreError::UnsupportedSchemaVersion(u32::MAX))?;
        }
        if let Some(value) = rows.get(META_LAST_SNAPSHOT) {
            let parsed = OffsetDateTime::parse(value, &Rfc3339)
                .map_err(|_| StoreError::InvalidSnapshotTime(value.clone()))?;
            meta.last_snapshot = Some(parsed);
        }
        if let Some(value) = rows.get(META_REQUIREMENTS_HASH) {
            meta.requirements_hash = value.clone();
        }
        if let Some(value) = rows.get(META_SERVER) {
            meta.server = value.clone();
        }
        Ok(())
    }

    fn save_meta(&mut self, meta: &SnapshotMeta) -> Result<()> {
        let tx = self
            .meta
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute("DELETE FROM kv", [])?;
        tx.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)",
            (META_SCHEMA_VERSION, meta.schema_version.to_string()),
        )?;
        if let Some(last) = meta.last_snapshot {
            let stamp = last
                .format(&Rfc3339)
                .map_err(|_| StoreError::InvalidSnapshotTime("unformattable".into()))?;
            tx.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)",
                (META_LAST_SNAPSHOT, stamp),
            )?;
        }
        if !meta.requirements_hash.is_empty() {
            tx.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)",
                (META_REQUIREMENTS_HASH, meta.requirements_hash.as_str()),
            )?;
        }
        if !meta.server.is_empty() {
            tx.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)",
                (META_SERVER, meta.server.as_str()),
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

fn read_rows(conn: &Connection) -> Result<BTreeMap<String, String>> {
    let mut stmt = conn.prepare("SELECT key, value FROM kv")?;
    let mut rows = stmt.query([])?;
    let mut out = BTreeMap::new();
    while let Some(row) = rows.next()? {
        out.insert(row.get::<_, String>(0)?, row.get::<_, String>(1)?);
    }
    Ok(out)
}

fn load_bucket<T: DeserializeOwned>(
    conn: &Connection,
    bucket: &'static str,
) -> Result<BTreeMap<String, T>> {
    let mut out = BTreeMap::new();
    for (key, value) in read_rows(conn)? {
        let entry = serde_json::from_str(&value).map_err(|source| StoreError::InvalidBucketEntry {
            bucket,
            key: key.clone(),
            source,
        })?;
        out.insert(key, entry);
    }
    Ok(out)
}

// Older snapshots stored resolved entries as bare version strings.
fn load_resolved(conn: &Connection) -> Result<BTreeMap<String, ResolvedEntry>> {
    let mut out = BTreeMap::new();
    for (key, value) in read_rows(conn)? {
        let entry = match serde_json::from_str::<ResolvedEntry>(&value) {
            Ok(entry) if !entry.version.is_empty() => entry,
            _ => ResolvedEntry {
                version: value,
                source: String::new(),
            },
        };
        out.insert(key, entry);
    }
    Ok(out)
}

fn save_bucket<T: Serialize>(conn: &mut Connection, data: &BTreeMap<String, T>) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute("DELETE FROM kv", [])?;
    {
        let mut stmt = tx.prepare("INSERT INTO kv (key, value) VALUES (?1, ?2)")?;
        for (key, entry) in data {
            stmt.execute((key.as_str(), serde_json::to_string(entry)?))?;
        }
    }
    tx.commit()?;
    Ok(())
}
