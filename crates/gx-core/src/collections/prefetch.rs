//! Background prefetch of version metadata and artifacts.
//!
//! While earlier topological levels install, the prefetcher pulls metadata
//! and tarballs for everything else. Failures are logged only; the
//! installer retries synchronously when it reaches the collection.

use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};

use gx_store::Store;

use crate::cache::ArtifactStore;
use crate::collections::install::{
    can_skip_install, download_collection_to_cache, install_path_for, InstallCtx,
};
use crate::collections::metadata::load_collection_metadata;
use crate::collections::{artifact_key, is_galaxy_type, Collection, CollectionCtx};
use crate::config::Config;
use crate::errors::{Error, Result};
use crate::infra::Infra;

/// Owned context shared with the prefetch worker threads.
#[derive(Clone)]
pub(crate) struct PrefetchCtx {
    pub cfg: Arc<Config>,
    pub infra: Infra,
    pub store: Arc<Store>,
    pub artifacts: Arc<dyn ArtifactStore>,
}

enum Slot {
    Pending,
    Done(Option<crate::types::VersionInfo>, Option<Error>),
}

/// Coordinates background downloads with per-key completion latches.
pub(crate) struct Prefetcher {
    slots: Mutex<HashMap<String, Slot>>,
    done: Condvar,
}

impl Prefetcher {
    fn empty() -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(HashMap::new()),
            done: Condvar::new(),
        })
    }

    fn register(&self, key: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(key.to_string()).or_insert(Slot::Pending);
    }

    fn finish(&self, key: &str, meta: Option<crate::types::VersionInfo>, err: Option<Error>) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.insert(key.to_string(), Slot::Done(meta, err));
        self.done.notify_all();
    }

    /// Blocks until prefetch for `key` completes. Returns `None` when no
    /// task was scheduled for the key.
    pub(crate) fn wait(
        &self,
        key: &str,
    ) -> Option<(Option<crate::types::VersionInfo>, Option<Error>)> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if !slots.contains_key(key) {
            return None;
        }
        loop {
            match slots.get(key) {
                Some(Slot::Done(_, _)) => break,
                Some(Slot::Pending) => {
                    slots = self
                        .done
                        .wait(slots)
                        .unwrap_or_else(|e| e.into_inner());
                }
                None => return None,
            }
        }
        match slots.remove(key) {
            Some(Slot::Done(meta, err)) => Some((meta, err)),
            _ => None,
        }
    }
}

/// Schedules prefetch tasks for every resolved collection that still needs
/// its artifact, and starts the worker pool.
pub(crate) fn start_prefetcher(
    ctx: PrefetchCtx,
    collections: &BTreeMap<String, Collection>,
) -> Arc<Prefetcher> {
    let prefetcher = Prefetcher::empty();
    if ctx.cfg.no_cache {
        return prefetcher;
    }

    let mut tasks: Vec<Collection> = Vec::new();
    for col in collections.values() {
        if !is_galaxy_type(&col.kind) {
            continue;
        }
        let install_path = install_path_for(&ctx.cfg, col);
        if can_skip_install(&ctx.cfg, col, &install_path, &ctx.store) {
            continue;
        }
        let key = artifact_key(&col.namespace, &col.name, &col.version);
        if ctx.artifacts.has(&key).unwrap_or(false) {
            continue;
        }
        prefetcher.register(&col.key());
        tasks.push(col.clone());
    }
    if tasks.is_empty() {
        return prefetcher;
    }

    let (sender, receiver) = mpsc::channel::<Collection>();
    for task in tasks {
        let _ = sender.send(task);
    }
    drop(sender);
    let receiver = Arc::new(Mutex::new(receiver));

    for _ in 0..ctx.cfg.workers.max(1) {
        let ctx = ctx.clone();
        let receiver = receiver.clone();
        let prefetcher = prefetcher.clone();
        std::thread::spawn(move || loop {
            let task = {
                let guard = receiver.lock().unwrap_or_else(|e| e.into_inner());
                guard.recv()
            };
            let Ok(col) = task else {
                break;
            };
            let outcome = prefetch_one(&ctx, &col);
            match outcome {
                Ok(meta) => prefetcher.finish(&col.key(), Some(meta), None),
                Err(err) => prefetcher.finish(&col.key(), None, Some(err)),
            }
        });
    }
    prefetcher
}

fn prefetch_one(ctx: &PrefetchCtx, col: &Collection) -> Result<crate::types::VersionInfo> {
    let collection_ctx = CollectionCtx {
        cfg: ctx.cfg.as_ref(),
        infra: &ctx.infra,
        store: Some(ctx.store.as_ref()),
    };
    let meta = load_collection_metadata(collection_ctx, col)?;

    let key = artifact_key(&col.namespace, &col.name, &col.version);
    if ctx.artifacts.has(&key)? {
        return Ok(meta);
    }
    let install_ctx = InstallCtx {
        cfg: ctx.cfg.as_ref(),
        infra: &ctx.infra,
        store: ctx.store.as_ref(),
        artifacts: ctx.artifacts.as_ref(),
    };
    download_collection_to_cache(install_ctx, &key, Some(&meta), true)?;
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_returns_none_without_task() {
        let prefetcher = Prefetcher::empty();
        assert!(prefetcher.wait("a.b@1.0.0").is_none());
    }

    #[test]
    fn wait_blocks_until_finish() {
        let prefetcher = Prefetcher::empty();
        prefetcher.register("a.b@1.0.0");

        let waiter = prefetcher.clone();
        let handle = std::thread::spawn(move || waiter.wait("a.b@1.0.0"));

        prefetcher.finish("a.b@1.0.0", None, Some(Error::MetadataUnavailable));
        let outcome = handle.join().unwrap().expect("task was registered");
        assert!(outcome.0.is_none());
        assert!(matches!(outcome.1, Some(Error::MetadataUnavailable)));
    }
}
