//! Install orchestration: lock, resolve, prefetch, level-by-level install,
//! snapshot save.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use gx_store::Store;

use crate::cache::{new_backend, ArtifactStore, Backend};
use crate::collections::install::{install_collection, InstallCtx};
use crate::collections::prefetch::{start_prefetcher, PrefetchCtx, Prefetcher};
use crate::collections::resolve::{build_install_levels, resolve_collections};
use crate::collections::{prepare_roots, Collection, CollectionCtx, RootPreparation};
use crate::config::Config;
use crate::errors::{Error, Result};
use crate::infra::Infra;
use crate::requirements::load_collections;

/// Installs collections according to the provided configuration.
pub fn run_install(cfg: &Arc<Config>, infra: &Infra) -> Result<()> {
    let result = run_install_inner(cfg, infra);
    if let Err(err) = &result {
        infra.printer.persistent(&format!("❌ Error: {err}"));
    }
    result
}

fn run_install_inner(cfg: &Arc<Config>, infra: &Infra) -> Result<()> {
    infra.printer.status("🚀 Starting installation process");
    let start = Instant::now();

    infra.printer.status("🚀 init cache backend");
    let backend = new_backend(cfg, infra)?;
    backend.open()?;
    let release = match backend.lock() {
        Ok(release) => release,
        Err(err) => {
            let _ = backend.close();
            return Err(err);
        }
    };

    let outcome = install_locked(cfg, infra, backend.as_ref(), start);
    if let Err(err) = release() {
        tracing::warn!("failed to release cache lock: {err}");
    }
    if let Err(err) = backend.close() {
        tracing::warn!("failed to close cache backend: {err}");
    }
    outcome
}

fn install_locked(
    cfg: &Arc<Config>,
    infra: &Infra,
    backend: &dyn Backend,
    start: Instant,
) -> Result<()> {
    let snapshot_start = Instant::now();
    infra.printer.status("🚀 load storage");
    let store = Arc::new(backend.load_store()?);
    tracing::debug!(elapsed = ?snapshot_start.elapsed(), "load snapshot");

    if cfg.clear_cache {
        store.clear_caches();
        backend.clear_files()?;
    }
    if let Err(err) = backend.record_project(&cfg.requirements_file, &cfg.download_path.display().to_string()) {
        infra
            .printer
            .persistent(&format!("⚠️ Failed to record project: {err}"));
    }

    let prep = load_roots(cfg, infra)?;

    let resolve_start = Instant::now();
    infra.printer.status("🧩 resolve dependencies");
    let ctx = CollectionCtx {
        cfg: cfg.as_ref(),
        infra,
        store: Some(&store),
    };
    let (resolved, graph) = resolve_collections(ctx, &prep.all_roots, true, true)?;
    tracing::debug!(elapsed = ?resolve_start.elapsed(), "resolve dependencies");

    let collections = build_collections_map(&resolved)?;
    let roots = build_root_keys(&prep, &resolved)?;
    store.set_roots("last_run", roots);

    let prefetch_start = Instant::now();
    let prefetch = start_prefetcher(
        PrefetchCtx {
            cfg: cfg.clone(),
            infra: infra.clone(),
            store: store.clone(),
            artifacts: backend.artifacts(),
        },
        &collections,
    );
    tracing::debug!(elapsed = ?prefetch_start.elapsed(), "prefetch schedule");

    let level_start = Instant::now();
    let levels = build_install_levels(&graph)?;
    tracing::debug!(elapsed = ?level_start.elapsed(), "build install levels");

    let failures = install_levels(
        cfg,
        infra,
        &store,
        backend.artifacts(),
        &collections,
        &graph,
        &levels,
        &prefetch,
    )?;

    let save_start = Instant::now();
    backend.save_store(&store)?;
    tracing::debug!(elapsed = ?save_start.elapsed(), "save snapshot");

    let took = start.elapsed().as_secs();
    if failures > 0 {
        infra.printer.persistent(&format!(
            "⚠️ Completed with errors: {failures} failed. Took {took}s"
        ));
        return Err(Error::InstallationFailed(failures));
    }
    infra
        .printer
        .persistent(&format!("🤩 All done. Took {took}s"));
    Ok(())
}

fn load_roots(cfg: &Config, infra: &Infra) -> Result<RootPreparation> {
    infra
        .printer
        .status("🗂️ load collections from requirements file");
    let (requirements, roles_found) = load_collections(&cfg.requirements_file, &cfg.server)?;
    if roles_found {
        infra
            .printer
            .persistent("⚠️ requirements.yml contains roles, but roles are not supported.");
    }
    infra.printer.status("🧩 prepare roots");
    let roots = requirements.into_iter().map(Collection::from).collect();
    prepare_roots(cfg, roots)
}

fn build_collections_map(
    resolved: &BTreeMap<String, Collection>,
) -> Result<BTreeMap<String, Collection>> {
    let mut collections = BTreeMap::new();
    for col in resolved.values() {
        let key = col.key();
        if collections.contains_key(&key) {
            return Err(Error::DuplicateCollectionKey(key));
        }
        collections.insert(key, col.clone());
    }
    Ok(collections)
}

fn build_root_keys(
    prep: &RootPreparation,
    resolved: &BTreeMap<String, Collection>,
) -> Result<Vec<String>> {
    let mut roots = Vec::with_capacity(prep.all_roots.len());
    for col in &prep.all_roots {
        let fqdn = col.fqdn();
        let resolved_col = resolved
            .get(&fqdn)
            .ok_or(Error::MissingResolvedRoot(fqdn))?;
        roots.push(resolved_col.key());
    }
    Ok(roots)
}

/// Installs each level on a bounded worker pool; the first failing level is
/// the last one scheduled.
#[allow(clippy::too_many_arguments)]
fn install_levels(
    cfg: &Config,
    infra: &Infra,
    store: &Store,
    artifacts: Arc<dyn ArtifactStore>,
    collections: &BTreeMap<String, Collection>,
    graph: &BTreeMap<String, Vec<String>>,
    levels: &[Vec<String>],
    prefetch: &Prefetcher,
) -> Result<u32> {
    let failures = AtomicU32::new(0);
    for level in levels {
        let mut batch = Vec::with_capacity(level.len());
        for key in level {
            let col = collections
                .get(key)
                .ok_or_else(|| Error::MissingCollection(key.clone()))?;
            let deps = graph.get(key).cloned().unwrap_or_default();
            batch.push((col.clone(), deps));
        }

        let workers = cfg.workers.max(1).min(batch.len().max(1));
        let queue = Mutex::new(batch.into_iter().collect::<VecDeque<_>>());
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let Some((col, deps)) =
                        queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
                    else {
                        break;
                    };
                    let meta = match prefetch.wait(&col.key()) {
                        Some((meta, Some(err))) => {
                            infra.printer.persistent(&format!(
                                "⚠️ Prefetch failed for {}: {err}",
                                col.key()
                            ));
                            meta
                        }
                        Some((meta, None)) => meta,
                        None => None,
                    };
                    let ctx = InstallCtx {
                        cfg,
                        infra,
                        store,
                        artifacts: artifacts.as_ref(),
                    };
                    match install_collection(ctx, &col, Some(deps), meta) {
                        Ok(()) => infra.printer.persistent(&format!(
                            "✅ Installed: {}.{}",
                            col.namespace, col.name
                        )),
                        Err(err) => {
                            infra.printer.persistent(&format!(
                                "❌ Failed: {}.{} error: {err}",
                                col.namespace, col.name
                            ));
                            failures.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        if failures.load(Ordering::SeqCst) > 0 {
            break;
        }
    }
    Ok(failures.load(Ordering::SeqCst))
}
