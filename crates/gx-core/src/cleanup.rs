//! Reachability-driven cleanup of unused collections.
//!
//! Every recorded project contributes an on-disk view: MANIFEST.json files
//! under its collections tree plus its current requirements. Anything not
//! reachable from a project's roots through on-disk dependency constraints
//! is removed, along with its sidecar, cached artifact, and snapshot keys.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use gx_store::{ProjectRecord, ProjectRegistry, Store};

use crate::cache::{new_backend, ArtifactStore, Backend};
use crate::collections::resolve::constraint_satisfied;
use crate::collections::{artifact_key, split_fqdn};
use crate::config::Config;
use crate::errors::Result;
use crate::infra::Infra;
use crate::requirements::load_collections;
use crate::types::Manifest;

/// An installed collection discovered on disk.
#[derive(Debug, Clone)]
struct InstalledCollection {
    key: String,
    fqdn: String,
    version: String,
    install_path: PathBuf,
    collections_dir: PathBuf,
}

/// Runs the cleanup process for unused collections.
pub fn run_cleanup(cfg: &Config, infra: &Infra) -> Result<()> {
    let result = run_cleanup_inner(cfg, infra);
    if let Err(err) = &result {
        infra.printer.persistent(&format!("❌ Error: {err}"));
    }
    result
}

fn run_cleanup_inner(cfg: &Config, infra: &Infra) -> Result<()> {
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

    let outcome = cleanup_locked(cfg, infra, backend.as_ref());
    if let Err(err) = release() {
        tracing::warn!("failed to release cache lock: {err}");
    }
    if let Err(err) = backend.close() {
        tracing::warn!("failed to close cache backend: {err}");
    }
    outcome
}

fn cleanup_locked(cfg: &Config, infra: &Infra, backend: &dyn Backend) -> Result<()> {
    infra.printer.status("🚀 load storage");
    let store = backend.load_store()?;
    infra.printer.status("🚀 load projects registry");
    let registry = backend.load_project_registry()?;
    if registry.projects.is_empty() {
        infra.printer.status("ℹ️ No projects recorded for GC.");
        return Ok(());
    }

    let (reachable, installed_by_key) = build_reachable(infra, &registry)?;
    let removed = remove_unused(
        cfg,
        infra,
        backend.artifacts().as_ref(),
        &store,
        &reachable,
        &installed_by_key,
    )?;

    if !cfg.dry_run {
        backend.save_store(&store)?;
        infra
            .printer
            .persistent(&format!("✨ Cleanup complete. Removed: {removed}"));
    } else {
        infra.printer.persistent(&format!(
            "🫡 Dry-run cleanup complete. Candidates: {removed}"
        ));
    }
    Ok(())
}

fn build_reachable(
    infra: &Infra,
    registry: &ProjectRegistry,
) -> Result<(BTreeSet<String>, BTreeMap<String, InstalledCollection>)> {
    let mut reachable = BTreeSet::new();
    let mut installed_index: BTreeMap<String, Vec<InstalledCollection>> = BTreeMap::new();
    let mut installed_by_key: BTreeMap<String, InstalledCollection> = BTreeMap::new();
    let mut deps_by_key: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();

    for (project_path, project) in &registry.projects {
        let Some(collections_path) = pick_collections_path(Path::new(project_path), project)
        else {
            continue;
        };
        scan_installed_collections(
            &collections_path,
            &mut installed_index,
            &mut installed_by_key,
            &mut deps_by_key,
        )?;

        let roots = match load_collections(Path::new(&project.requirements_file), "") {
            Ok((roots, _)) => roots,
            Err(err) => {
                infra.printer.status(&format!(
                    "⚠️ Failed to load requirements {}: {err}",
                    project.requirements_file
                ));
                continue;
            }
        };
        for root in roots {
            let fqdn = format!("{}.{}", root.namespace, root.name);
            for inst in select_installed(&installed_index, &fqdn, &root.version) {
                mark_reachable(&inst.key, &mut reachable, &deps_by_key, &installed_index);
            }
        }
    }
    Ok((reachable, installed_by_key))
}

fn remove_unused(
    cfg: &Config,
    infra: &Infra,
    artifacts: &dyn ArtifactStore,
    store: &Store,
    reachable: &BTreeSet<String>,
    installed_by_key: &BTreeMap<String, InstalledCollection>,
) -> Result<u32> {
    let mut removed = 0;
    for (key, inst) in installed_by_key {
        if reachable.contains(key) {
            continue;
        }
        removed += 1;
        if cfg.dry_run {
            infra.printer.status(&format!("🧹 remove {key}"));
            continue;
        }
        remove_installed(inst, artifacts)?;
        infra.printer.status(&format!("🧹 remove {key}"));
        store.delete_installed(key);
        store.delete_graph(key);
        store.delete_deps_cache(key);
    }
    Ok(removed)
}

/// Chooses the collections path for a project: the recorded path, then
/// `.collections`, then `collections`, whichever holds an
/// `ansible_collections` tree.
fn pick_collections_path(project_path: &Path, project: &ProjectRecord) -> Option<PathBuf> {
    let mut candidates = Vec::new();
    if !project.collections_path.is_empty() {
        candidates.push(PathBuf::from(&project.collections_path));
    }
    candidates.push(project_path.join(".collections"));
    candidates.push(project_path.join("collections"));

    candidates
        .into_iter()
        .find(|candidate| candidate.join("ansible_collections").is_dir())
}

/// Indexes every MANIFEST.json under the collections tree.
fn scan_installed_collections(
    collections_path: &Path,
    index: &mut BTreeMap<String, Vec<InstalledCollection>>,
    by_key: &mut BTreeMap<String, InstalledCollection>,
    deps: &mut BTreeMap<String, BTreeMap<String, String>>,
) -> Result<()> {
    let root = collections_path.join("ansible_collections");
    for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_dir() || entry.file_name() != "MANIFEST.json" {
            continue;
        }
        let Ok(data) = fs::read(entry.path()) else {
            continue;
        };
        let Ok(manifest) = serde_json::from_slice::<Manifest>(&data) else {
            continue;
        };
        let info = &manifest.collection_info;
        if info.namespace.is_empty() || info.name.is_empty() || info.version.is_empty() {
            continue;
        }
        let Some(install_path) = entry.path().parent() else {
            continue;
        };
        let fqdn = format!("{}.{}", info.namespace, info.name);
        let key = format!("{fqdn}@{}", info.version);
        let record = InstalledCollection {
            key: key.clone(),
            fqdn: fqdn.clone(),
            version: info.version.clone(),
            install_path: install_path.to_path_buf(),
            collections_dir: collections_path.to_path_buf(),
        };
        index.entry(fqdn).or_default().push(record.clone());
        by_key.insert(key.clone(), record);
        deps.insert(key, info.dependencies.clone());
    }
    Ok(())
}

/// Filters installed records for an FQDN by a version constraint. An
/// unparseable constraint keeps everything reachable rather than risking a
/// wrong removal.
fn select_installed<'a>(
    index: &'a BTreeMap<String, Vec<InstalledCollection>>,
    fqdn: &str,
    constraint: &str,
) -> Vec<&'a InstalledCollection> {
    let Some(items) = index.get(fqdn) else {
        return Vec::new();
    };
    let trimmed = constraint.trim();
    if trimmed.is_empty() || trimmed == "*" {
        return items.iter().collect();
    }
    let mut out = Vec::new();
    for item in items {
        match constraint_satisfied(&item.version, trimmed) {
            Ok(true) => out.push(item),
            Ok(false) => {}
            Err(_) => return items.iter().collect(),
        }
    }
    out
}

/// Marks everything reachable from `key` through on-disk dependencies.
fn mark_reachable(
    key: &str,
    reachable: &mut BTreeSet<String>,
    deps: &BTreeMap<String, BTreeMap<String, String>>,
    index: &BTreeMap<String, Vec<InstalledCollection>>,
) {
    let mut queue: VecDeque<String> = VecDeque::from([key.to_string()]);
    while let Some(current) = queue.pop_front() {
        if !reachable.insert(current.clone()) {
            continue;
        }
        let Some(dep_constraints) = deps.get(&current) else {
            continue;
        };
        for (dep_fqdn, constraint) in dep_constraints {
            for inst in select_installed(index, dep_fqdn, constraint) {
                if !reachable.contains(&inst.key) {
                    queue.push_back(inst.key.clone());
                }
            }
        }
    }
}

/// Deletes a collection's install tree, sidecar, and cached artifact.
fn remove_installed(inst: &InstalledCollection, artifacts: &dyn ArtifactStore) -> Result<()> {
    let Some((namespace, name)) = split_fqdn(&inst.fqdn) else {
        return Ok(());
    };
    if !inst.install_path.as_os_str().is_empty() {
        fs::remove_dir_all(&inst.install_path)?;
    }
    let info_dir = inst.collections_dir.join("ansible_collections").join(format!(
        "{namespace}.{name}-{}.info",
        inst.version
    ));
    let _ = fs::remove_dir_all(info_dir);

    let _ = artifacts.delete(&artifact_key(&namespace, &name, &inst.version));
    Ok(())
}
