//! Constraint-based dependency resolution with snapshot reuse.
//!
//! Resolution is a worklist over FQDNs: each round resolves the queued
//! collections in parallel, merges the discovered dependency constraints,
//! and re-enqueues any dependency whose active constraint set changed. The
//! worklist converges when no constraints move. Install ordering is a
//! separate topological pass, which is where cycles surface.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

use semver::{Version, VersionReq};
use sha2::{Digest, Sha256};

use gx_store::{RequirementSpec, ResolvedEntry, Store};

use crate::api_cache::{policy_for_constraint, Policy};
use crate::collections::metadata::{
    fetch_version_metadata_cached, load_root_metadata_cached, load_versions_list_cached,
};
use crate::collections::{split_collection_key, split_fqdn, Collection, CollectionCtx};
use crate::config::Config;
use crate::errors::{Error, Result};
use crate::types::CollectionRoot;

pub(crate) const VERSION_PAGE_LIMIT: u64 = 100;

/// A single collection resolution task.
#[derive(Debug, Clone)]
struct ResolveTask {
    fqdn: String,
    namespace: String,
    name: String,
    constraints: Vec<String>,
    source: String,
}

/// The dependencies discovered for one resolved collection.
#[derive(Debug, Clone)]
struct ResolvedOne {
    version: String,
    deps: BTreeMap<String, String>,
}

/// Resolves versions and dependencies for the given roots.
pub(crate) fn resolve_collections(
    ctx: CollectionCtx<'_>,
    roots: &[Collection],
    allow_snapshot: bool,
    record: bool,
) -> Result<(BTreeMap<String, Collection>, BTreeMap<String, Vec<String>>)> {
    if ctx.cfg.no_deps {
        return Ok(resolve_without_deps(ctx, roots, record));
    }

    let req_spec = build_requirements_spec(ctx.cfg, roots);
    let req_hash = requirements_signature_from_spec(&req_spec);

    if allow_snapshot {
        if let Some(store) = ctx.store {
            if let Some((resolved, graph)) =
                load_resolved_from_snapshot(ctx.cfg, store, roots, &req_hash)?
            {
                tracing::debug!("full snapshot reuse for {} roots", roots.len());
                return Ok((resolved, graph));
            }
            if let Some((resolved, graph)) =
                try_incremental_resolve(ctx, store, roots, &req_spec, &req_hash)?
            {
                tracing::debug!("incremental snapshot reuse for {} roots", roots.len());
                return Ok((resolved, graph));
            }
        }
    }

    let mut state = ResolverState::new(ctx.cfg, roots)?;
    state.resolve_queue(ctx)?;
    let (resolved, graph) = state.build_graph(roots)?;
    if record {
        if let Some(store) = ctx.store {
            record_resolution(store, &resolved, &graph, &req_hash, &ctx.cfg.server, &req_spec);
        }
    }
    Ok((resolved, graph))
}

fn resolve_without_deps(
    ctx: CollectionCtx<'_>,
    roots: &[Collection],
    record: bool,
) -> (BTreeMap<String, Collection>, BTreeMap<String, Vec<String>>) {
    let mut resolved = BTreeMap::new();
    let mut graph = BTreeMap::new();
    for root in roots {
        resolved.insert(root.fqdn(), root.clone());
        graph.insert(root.key(), Vec::new());
    }
    if record {
        if let Some(store) = ctx.store {
            let spec = build_requirements_spec(ctx.cfg, roots);
            let hash = requirements_signature_from_spec(&spec);
            record_resolution(store, &resolved, &graph, &hash, &ctx.cfg.server, &spec);
        }
    }
    (resolved, graph)
}

fn record_resolution(
    store: &Store,
    resolved: &BTreeMap<String, Collection>,
    graph: &BTreeMap<String, Vec<String>>,
    req_hash: &str,
    server: &str,
    req_spec: &BTreeMap<String, RequirementSpec>,
) {
    let entries = resolved
        .iter()
        .map(|(fqdn, col)| {
            (
                fqdn.clone(),
                ResolvedEntry {
                    version: col.version.clone(),
                    source: col.source.clone(),
                },
            )
        })
        .collect();
    store.set_resolved_all(entries);
    store.set_graph_snapshot(graph.clone());
    store.set_meta_requirements(req_hash, server);
    store.set_requirements(req_spec.clone());
}

struct ResolverState<'a> {
    cfg: &'a Config,
    resolved: BTreeMap<String, Collection>,
    deps_by_parent: BTreeMap<String, BTreeMap<String, String>>,
    dep_constraints: BTreeMap<String, BTreeMap<String, String>>,
    source_by_fqdn: BTreeMap<String, String>,
    queue: Vec<String>,
    queued: BTreeSet<String>,
}

impl<'a> ResolverState<'a> {
    fn new(cfg: &'a Config, roots: &[Collection]) -> Result<Self> {
        let mut state = Self {
            cfg,
            resolved: BTreeMap::new(),
            deps_by_parent: BTreeMap::new(),
            dep_constraints: BTreeMap::new(),
            source_by_fqdn: BTreeMap::new(),
            queue: Vec::with_capacity(roots.len()),
            queued: BTreeSet::new(),
        };
        state.enqueue_roots(roots)?;
        Ok(state)
    }

    fn enqueue_roots(&mut self, roots: &[Collection]) -> Result<()> {
        for root in roots {
            let fqdn = root.fqdn();
            let source = if root.source.is_empty() {
                self.cfg.server.clone()
            } else {
                root.source.clone()
            };
            self.source_by_fqdn.insert(fqdn.clone(), source);
            let constraint = if root.constraint.is_empty() {
                &root.version
            } else {
                &root.constraint
            };
            add_root_constraint(&mut self.dep_constraints, &fqdn, constraint)?;
            if self.queued.insert(fqdn.clone()) {
                self.queue.push(fqdn);
            }
        }
        Ok(())
    }

    fn resolve_queue(&mut self, ctx: CollectionCtx<'_>) -> Result<()> {
        while !self.queue.is_empty() {
            let tasks = self.build_tasks()?;
            self.queue.clear();
            self.queued.clear();
            let results = resolve_batch(ctx, tasks);
            self.apply_results(results)?;
        }
        Ok(())
    }

    fn build_tasks(&self) -> Result<Vec<ResolveTask>> {
        let mut tasks = Vec::with_capacity(self.queue.len());
        for fqdn in &self.queue {
            let (namespace, name) =
                split_fqdn(fqdn).ok_or_else(|| Error::InvalidCollectionName(fqdn.clone()))?;
            let constraints = constraints_for(&self.dep_constraints, fqdn);
            let source = self
                .source_by_fqdn
                .get(fqdn)
                .filter(|source| !source.is_empty())
                .cloned()
                .unwrap_or_else(|| self.cfg.server.clone());
            tasks.push(ResolveTask {
                fqdn: fqdn.clone(),
                namespace,
                name,
                constraints,
                source,
            });
        }
        Ok(tasks)
    }

    fn apply_results(&mut self, results: Vec<(ResolveTask, Result<ResolvedOne>)>) -> Result<()> {
        for (task, outcome) in results {
            let resolved = outcome?;
            self.apply_result(task, resolved);
        }
        Ok(())
    }

    fn apply_result(&mut self, task: ResolveTask, outcome: ResolvedOne) {
        let parent = task.fqdn.clone();
        let needs_update = self
            .resolved
            .get(&parent)
            .map(|existing| existing.version != outcome.version)
            .unwrap_or(true);
        if needs_update {
            self.resolved.insert(
                parent.clone(),
                Collection {
                    namespace: task.namespace,
                    name: task.name,
                    version: outcome.version,
                    source: task.source,
                    ..Collection::default()
                },
            );
        }

        let changed = apply_dependency_constraints(
            &parent,
            &outcome.deps,
            &mut self.dep_constraints,
            &mut self.deps_by_parent,
        );
        for dep_fqdn in outcome.deps.keys() {
            self.source_by_fqdn
                .entry(dep_fqdn.clone())
                .or_insert_with(|| self.cfg.server.clone());
        }
        for dep_fqdn in changed {
            if self.queued.insert(dep_fqdn.clone()) {
                self.queue.push(dep_fqdn);
            }
        }
    }

    fn build_graph(
        mut self,
        roots: &[Collection],
    ) -> Result<(BTreeMap<String, Collection>, BTreeMap<String, Vec<String>>)> {
        self.prune_unreachable(roots);
        let mut graph = BTreeMap::new();
        for (parent_fqdn, deps) in &self.deps_by_parent {
            let parent = self
                .resolved
                .get(parent_fqdn)
                .ok_or_else(|| Error::MissingResolvedParent(parent_fqdn.clone()))?;
            let mut dep_keys = Vec::with_capacity(deps.len());
            for dep_fqdn in deps.keys() {
                let dep = self
                    .resolved
                    .get(dep_fqdn)
                    .ok_or_else(|| Error::MissingResolvedDependency(dep_fqdn.clone()))?;
                dep_keys.push(dep.key());
            }
            graph.insert(parent.key(), dep_keys);
        }
        for col in self.resolved.values() {
            graph.entry(col.key()).or_default();
        }
        Ok((self.resolved, graph))
    }

    fn prune_unreachable(&mut self, roots: &[Collection]) {
        let reachable = collect_reachable(roots, &self.deps_by_parent);
        self.resolved.retain(|fqdn, _| reachable.contains(fqdn));
        self.deps_by_parent.retain(|parent, _| reachable.contains(parent));
        for deps in self.deps_by_parent.values_mut() {
            deps.retain(|dep, _| reachable.contains(dep));
        }
    }
}

/// Resolves a batch of tasks on a bounded worker pool.
fn resolve_batch(
    ctx: CollectionCtx<'_>,
    tasks: Vec<ResolveTask>,
) -> Vec<(ResolveTask, Result<ResolvedOne>)> {
    if tasks.is_empty() {
        return Vec::new();
    }
    let workers = ctx.cfg.workers.max(1).min(tasks.len());
    if workers == 1 {
        return tasks
            .into_iter()
            .map(|task| {
                let outcome = resolve_one(ctx, &task);
                (task, outcome)
            })
            .collect();
    }

    let queue = Mutex::new(tasks.into_iter().collect::<VecDeque<_>>());
    let results = Mutex::new(Vec::new());
    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let Some(task) = queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
                else {
                    break;
                };
                let outcome = resolve_one(ctx, &task);
                results
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push((task, outcome));
            });
        }
    });
    results.into_inner().unwrap_or_else(|e| e.into_inner())
}

/// Resolves a single collection's version and dependency constraints.
fn resolve_one(ctx: CollectionCtx<'_>, task: &ResolveTask) -> Result<ResolvedOne> {
    let start = Instant::now();
    let (version, exact) = exact_version_from_constraints(&task.constraints)?;
    let policy = policy_for_constraint(ctx.cfg, exact);

    if exact {
        if let Some(outcome) = cached_result(ctx, task, &version, policy) {
            return Ok(outcome);
        }
    }

    let col = Collection {
        namespace: task.namespace.clone(),
        name: task.name.clone(),
        source: task.source.clone(),
        ..Collection::default()
    };
    let (root_meta, versions_url) = resolve_root_metadata(ctx, &col, policy, &task.fqdn)?;

    let version = resolve_final_version(ctx, task, policy, version, exact, &root_meta, &versions_url)?;

    if let Some(outcome) = cached_result(ctx, task, &version, policy) {
        return Ok(outcome);
    }

    let info = fetch_version_metadata_cached(ctx, &task.source, &versions_url, &version, policy)?;
    let raw_deps = if !info.metadata.dependencies.is_empty() {
        info.metadata.dependencies.clone()
    } else {
        info.manifest.collection_info.dependencies.clone()
    };
    let deps = parse_dependencies(&raw_deps)?;

    if let Some(store) = ctx.store {
        if policy.write {
            let cache_key = format!("{}.{}@{version}", task.namespace, task.name);
            store.set_deps_cache(&cache_key, deps.clone());
        }
    }
    tracing::debug!(elapsed = ?start.elapsed(), "resolved {}@{version}", task.fqdn);
    Ok(ResolvedOne { version, deps })
}

fn cached_result(
    ctx: CollectionCtx<'_>,
    task: &ResolveTask,
    version: &str,
    policy: Policy,
) -> Option<ResolvedOne> {
    if !policy.read {
        return None;
    }
    let store = ctx.store?;
    let cache_key = format!("{}.{}@{version}", task.namespace, task.name);
    let deps = store.get_deps_cache(&cache_key)?;
    Some(ResolvedOne {
        version: version.to_string(),
        deps,
    })
}

fn resolve_root_metadata(
    ctx: CollectionCtx<'_>,
    col: &Collection,
    policy: Policy,
    label: &str,
) -> Result<(CollectionRoot, String)> {
    let mut versions_url = format!(
        "{}/api/v3/collections/{}/{}/versions/",
        col.source.trim_end_matches('/'),
        col.namespace,
        col.name
    );
    let root_meta = load_root_metadata_cached(ctx, col, policy)?;
    if !root_meta.versions_url.is_empty() {
        versions_url =
            super::candidates::normalize_versions_url(&col.source, &root_meta.versions_url);
        tracing::debug!("versions URL for {label}: {versions_url}");
    }
    Ok((root_meta, versions_url))
}

fn resolve_final_version(
    ctx: CollectionCtx<'_>,
    task: &ResolveTask,
    policy: Policy,
    version: String,
    exact: bool,
    root_meta: &CollectionRoot,
    versions_url: &str,
) -> Result<String> {
    if exact {
        return Ok(version);
    }
    if !root_meta.highest_version.version.is_empty()
        && constraints_satisfied_by_version(&root_meta.highest_version.version, &task.constraints)?
    {
        tracing::debug!(
            "highest_version selected for {}: {}",
            task.fqdn,
            root_meta.highest_version.version
        );
        return Ok(root_meta.highest_version.version.clone());
    }
    if !version.is_empty() {
        return Ok(version);
    }
    tracing::debug!("resolving versions list for {}", task.fqdn);
    let versions = load_versions_list_cached(ctx, versions_url, VERSION_PAGE_LIMIT, policy)?;
    select_version(&versions, &task.constraints)
}

fn parse_dependencies(deps: &BTreeMap<String, String>) -> Result<BTreeMap<String, String>> {
    let mut parsed = BTreeMap::new();
    for (dep, constraint) in deps {
        if split_fqdn(dep).is_none() {
            return Err(Error::InvalidDependencyKey(dep.clone()));
        }
        parsed.insert(dep.clone(), constraint.trim().to_string());
    }
    Ok(parsed)
}

/// Picks the highest semver-valid version that satisfies every constraint.
pub(crate) fn select_version(versions: &[String], constraints: &[String]) -> Result<String> {
    let mut candidates: Vec<(Version, &String)> = versions
        .iter()
        .filter_map(|raw| Version::parse(raw).ok().map(|parsed| (parsed, raw)))
        .collect();
    if candidates.is_empty() {
        return Err(Error::NoSemverCandidates);
    }
    candidates.sort_by(|a, b| b.0.cmp(&a.0));

    let reqs = parse_constraints(constraints)?;
    for (parsed, raw) in &candidates {
        if reqs.iter().all(|req| req.matches(parsed)) {
            return Ok((*raw).clone());
        }
    }
    Err(Error::NoVersionSatisfiesConstraints(constraints.to_vec()))
}

/// Reports whether `version` satisfies every constraint in the list.
pub(crate) fn constraints_satisfied_by_version(
    version: &str,
    constraints: &[String],
) -> Result<bool> {
    if constraints.is_empty() {
        return Ok(true);
    }
    let reqs = parse_constraints(constraints)?;
    if reqs.is_empty() {
        return Ok(true);
    }
    let parsed = Version::parse(version).map_err(|source| Error::InvalidVersion {
        value: version.to_string(),
        source,
    })?;
    Ok(reqs.iter().all(|req| req.matches(&parsed)))
}

/// Reports whether `version` satisfies a single constraint expression.
pub(crate) fn constraint_satisfied(version: &str, constraint: &str) -> Result<bool> {
    let normalized = normalize_constraint(constraint);
    if normalized.is_empty() {
        return Ok(true);
    }
    constraints_satisfied_by_version(version, &[normalized])
}

fn parse_constraints(list: &[String]) -> Result<Vec<VersionReq>> {
    let mut out = Vec::with_capacity(list.len());
    for raw in list {
        let normalized = normalize_constraint(raw);
        if normalized.is_empty() {
            continue;
        }
        out.push(parse_constraint(&normalized)?);
    }
    Ok(out)
}

// A bare version literal means exact equality; VersionReq alone would give
// it caret semantics.
fn parse_constraint(value: &str) -> Result<VersionReq> {
    let stripped = value.strip_prefix('=').map(str::trim).unwrap_or(value);
    let req_source = if is_bare_version(stripped) {
        format!("={stripped}")
    } else {
        value.to_string()
    };
    VersionReq::parse(&req_source).map_err(|source| Error::InvalidConstraint {
        value: value.to_string(),
        source,
    })
}

fn is_bare_version(value: &str) -> bool {
    !value.contains(['<', '>', '~', '^', '!', '*', '|', ' ', ','])
        && Version::parse(value).is_ok()
}

/// Trims a constraint, dropping the no-op forms `""` and `"*"`.
pub(crate) fn normalize_constraint(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed == "*" {
        return String::new();
    }
    trimmed.to_string()
}

/// Trims, sorts, and deduplicates signature strings.
pub(crate) fn normalize_signatures(signatures: &[String]) -> Vec<String> {
    let mut out: Vec<String> = signatures
        .iter()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect();
    out.sort();
    out
}

fn normalize_requirement_constraint(value: &str) -> String {
    let normalized = normalize_constraint(value);
    if normalized.is_empty() {
        return "*".to_string();
    }
    normalized
}

/// Returns a single exact version when every constraint is the same bare
/// semver literal.
pub(crate) fn exact_version_from_constraints(constraints: &[String]) -> Result<(String, bool)> {
    let mut exact = String::new();
    for raw in constraints {
        let mut normalized = normalize_constraint(raw);
        if normalized.is_empty() {
            continue;
        }
        if let Some(after) = normalized.strip_prefix('=') {
            normalized = after.trim().to_string();
        }
        if normalized.contains(['<', '>', '~', '^', '!', '*', '|', ' ']) {
            return Ok((String::new(), false));
        }
        Version::parse(&normalized).map_err(|source| Error::InvalidVersion {
            value: normalized.clone(),
            source,
        })?;
        if exact.is_empty() {
            exact = normalized;
        } else if exact != normalized {
            return Err(Error::ConflictingExactVersions(exact, normalized));
        }
    }
    if exact.is_empty() {
        return Ok((String::new(), false));
    }
    Ok((exact, true))
}

fn add_root_constraint(
    dep_constraints: &mut BTreeMap<String, BTreeMap<String, String>>,
    fqdn: &str,
    version: &str,
) -> Result<()> {
    let constraint = normalize_constraint(version);
    if constraint.is_empty() {
        return Ok(());
    }
    let entry = dep_constraints.entry(fqdn.to_string()).or_default();
    if let Some(existing) = entry.get("root") {
        if existing != &constraint {
            return Err(Error::ConflictingRootConstraints {
                fqdn: fqdn.to_string(),
                existing: existing.clone(),
                incoming: constraint,
            });
        }
    }
    entry.insert("root".to_string(), constraint);
    Ok(())
}

/// Merges a parent's dependency constraints, returning the dep FQDNs whose
/// active constraint set changed.
fn apply_dependency_constraints(
    parent_fqdn: &str,
    new_deps: &BTreeMap<String, String>,
    dep_constraints: &mut BTreeMap<String, BTreeMap<String, String>>,
    deps_by_parent: &mut BTreeMap<String, BTreeMap<String, String>>,
) -> BTreeSet<String> {
    let mut changed = BTreeSet::new();
    let old_deps = deps_by_parent.get(parent_fqdn).cloned().unwrap_or_default();

    for dep in old_deps.keys() {
        if !new_deps.contains_key(dep)
            && remove_constraint(dep_constraints, dep, parent_fqdn)
        {
            changed.insert(dep.clone());
        }
    }
    for (dep, constraint) in new_deps {
        if set_constraint(dep_constraints, dep, parent_fqdn, constraint) {
            changed.insert(dep.clone());
        }
    }

    deps_by_parent.insert(parent_fqdn.to_string(), new_deps.clone());
    changed
}

fn set_constraint(
    dep_constraints: &mut BTreeMap<String, BTreeMap<String, String>>,
    dep: &str,
    source: &str,
    constraint: &str,
) -> bool {
    let entry = dep_constraints.entry(dep.to_string()).or_default();
    if entry.get(source).map(String::as_str) == Some(constraint) {
        return false;
    }
    entry.insert(source.to_string(), constraint.to_string());
    true
}

fn remove_constraint(
    dep_constraints: &mut BTreeMap<String, BTreeMap<String, String>>,
    dep: &str,
    source: &str,
) -> bool {
    let Some(entry) = dep_constraints.get_mut(dep) else {
        return false;
    };
    if entry.remove(source).is_none() {
        return false;
    }
    if entry.is_empty() {
        dep_constraints.remove(dep);
    }
    true
}

/// Returns the active, normalized constraints for a collection.
fn constraints_for(
    dep_constraints: &BTreeMap<String, BTreeMap<String, String>>,
    fqdn: &str,
) -> Vec<String> {
    let Some(sources) = dep_constraints.get(fqdn) else {
        return Vec::new();
    };
    let mut out: Vec<String> = sources
        .values()
        .map(|c| normalize_constraint(c))
        .filter(|c| !c.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

fn collect_reachable(
    roots: &[Collection],
    deps_by_parent: &BTreeMap<String, BTreeMap<String, String>>,
) -> BTreeSet<String> {
    let mut reachable = BTreeSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    for root in roots {
        let fqdn = root.fqdn();
        if reachable.insert(fqdn.clone()) {
            queue.push_back(fqdn);
        }
    }
    while let Some(fqdn) = queue.pop_front() {
        if let Some(deps) = deps_by_parent.get(&fqdn) {
            for dep in deps.keys() {
                if reachable.insert(dep.clone()) {
                    queue.push_back(dep.clone());
                }
            }
        }
    }
    reachable
}

fn collect_graph_keys_from_keys(
    graph: &BTreeMap<String, Vec<String>>,
    roots: &[String],
) -> BTreeSet<String> {
    let mut visited = BTreeSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    for key in roots {
        if visited.insert(key.clone()) {
            queue.push_back(key.clone());
        }
    }
    while let Some(key) = queue.pop_front() {
        if let Some(deps) = graph.get(&key) {
            for dep in deps {
                if visited.insert(dep.clone()) {
                    queue.push_back(dep.clone());
                }
            }
        }
    }
    visited
}

fn same_deps(a: &[String], b: &[String]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut left = a.to_vec();
    let mut right = b.to_vec();
    left.sort();
    right.sort();
    left == right
}

/// Builds the normalized requirement spec map used for snapshot hashing.
pub(crate) fn build_requirements_spec(
    cfg: &Config,
    roots: &[Collection],
) -> BTreeMap<String, RequirementSpec> {
    let mut spec = BTreeMap::new();
    for root in roots {
        let source = if root.source.is_empty() {
            cfg.server.clone()
        } else {
            root.source.clone()
        };
        let constraint = if root.constraint.is_empty() {
            &root.version
        } else {
            &root.constraint
        };
        spec.insert(
            root.fqdn(),
            RequirementSpec {
                constraint: normalize_requirement_constraint(constraint),
                source,
                kind: root.kind.clone(),
                signatures: normalize_signatures(&root.signatures),
            },
        );
    }
    spec
}

/// Returns a stable SHA-256 signature of a requirements spec.
pub(crate) fn requirements_signature_from_spec(
    spec: &BTreeMap<String, RequirementSpec>,
) -> String {
    let mut parts: Vec<String> = spec
        .iter()
        .map(|(fqdn, entry)| {
            let constraint = if entry.constraint.is_empty() {
                "*"
            } else {
                &entry.constraint
            };
            format!(
                "{fqdn}|{constraint}|{}|{}|{}",
                entry.source,
                entry.kind,
                normalize_signatures(&entry.signatures).join(",")
            )
        })
        .collect();
    parts.sort();
    hex::encode(Sha256::digest(parts.join("\n").as_bytes()))
}

fn requirement_spec_equal(a: &RequirementSpec, b: &RequirementSpec) -> bool {
    a.constraint == b.constraint
        && a.source == b.source
        && a.kind == b.kind
        && normalize_signatures(&a.signatures) == normalize_signatures(&b.signatures)
}

/// Reuses the snapshot wholesale when the requirements hash matches and
/// every root still resolves inside it.
fn load_resolved_from_snapshot(
    cfg: &Config,
    store: &Store,
    roots: &[Collection],
    req_hash: &str,
) -> Result<Option<(BTreeMap<String, Collection>, BTreeMap<String, Vec<String>>)>> {
    let meta = store.meta_snapshot();
    if meta.requirements_hash.is_empty() || meta.requirements_hash != req_hash {
        return Ok(None);
    }
    let resolved_snap = store.resolved_snapshot();
    let graph_snap = store.graph_snapshot();
    if resolved_snap.is_empty() || graph_snap.is_empty() {
        return Ok(None);
    }
    let Some(resolved) = build_resolved_snapshot(cfg, &resolved_snap) else {
        return Ok(None);
    };
    if !roots_match_snapshot(roots, &resolved, &graph_snap)? {
        return Ok(None);
    }
    let filtered = filter_graph_snapshot(&graph_snap, &resolved);
    Ok(Some((resolved, filtered)))
}

fn build_resolved_snapshot(
    cfg: &Config,
    resolved_snap: &BTreeMap<String, ResolvedEntry>,
) -> Option<BTreeMap<String, Collection>> {
    let mut resolved = BTreeMap::new();
    for (fqdn, entry) in resolved_snap {
        if entry.version.is_empty() {
            return None;
        }
        let (namespace, name) = split_fqdn(fqdn)?;
        let source = if entry.source.is_empty() {
            cfg.server.clone()
        } else {
            entry.source.clone()
        };
        resolved.insert(
            fqdn.clone(),
            Collection {
                namespace,
                name,
                version: entry.version.clone(),
                source,
                ..Collection::default()
            },
        );
    }
    Some(resolved)
}

fn roots_match_snapshot(
    roots: &[Collection],
    resolved: &BTreeMap<String, Collection>,
    graph_snap: &BTreeMap<String, Vec<String>>,
) -> Result<bool> {
    for root in roots {
        if !super::is_galaxy_type(&root.kind) {
            return Ok(false);
        }
        let Some(col) = resolved.get(&root.fqdn()) else {
            return Ok(false);
        };
        let constraint = if root.constraint.is_empty() {
            &root.version
        } else {
            &root.constraint
        };
        match constraint_satisfied(&col.version, constraint) {
            Ok(true) => {}
            Ok(false) | Err(_) => return Ok(false),
        }
        if !graph_snap.contains_key(&col.key()) {
            return Ok(false);
        }
    }
    Ok(true)
}

fn filter_graph_snapshot(
    graph_snap: &BTreeMap<String, Vec<String>>,
    resolved: &BTreeMap<String, Collection>,
) -> BTreeMap<String, Vec<String>> {
    let valid: BTreeSet<String> = resolved.values().map(Collection::key).collect();
    let mut filtered = BTreeMap::new();
    for (key, deps) in graph_snap {
        if !valid.contains(key) {
            continue;
        }
        let kept: Vec<String> = deps
            .iter()
            .filter(|dep| valid.contains(*dep))
            .cloned()
            .collect();
        filtered.insert(key.clone(), kept);
    }
    filtered
}

/// Reuses the preserved closure of unchanged roots and resolves only the
/// changed subset, merging the two graphs when they agree.
fn try_incremental_resolve(
    ctx: CollectionCtx<'_>,
    store: &Store,
    roots: &[Collection],
    current_spec: &BTreeMap<String, RequirementSpec>,
    req_hash: &str,
) -> Result<Option<(BTreeMap<String, Collection>, BTreeMap<String, Vec<String>>)>> {
    let prev_spec = store.requirements_snapshot();
    if prev_spec.is_empty() {
        return Ok(None);
    }

    let (unchanged, changed) = split_roots_by_change(roots, current_spec, &prev_spec);
    if unchanged.is_empty() || changed.is_empty() {
        return Ok(None);
    }

    let resolved_snap = store.resolved_snapshot();
    let graph_snap = store.graph_snapshot();
    if resolved_snap.is_empty() || graph_snap.is_empty() {
        return Ok(None);
    }

    let Some((preserved_resolved, preserved_graph)) =
        build_preserved_snapshot(ctx.cfg, &unchanged, &resolved_snap, &graph_snap)
    else {
        return Ok(None);
    };

    let (resolved_new, graph_new) = resolve_collections(ctx, &changed, false, false)?;

    let Some((mut merged_resolved, mut merged_graph)) = merge_resolved_graphs(
        preserved_resolved,
        preserved_graph,
        resolved_new,
        graph_new,
    ) else {
        return Ok(None);
    };

    if !expand_graph_from_snapshot(
        ctx.cfg,
        &mut merged_resolved,
        &mut merged_graph,
        &resolved_snap,
        &graph_snap,
    ) {
        return Ok(None);
    }
    if !validate_merged_graph(&merged_resolved, &merged_graph) {
        return Ok(None);
    }

    record_resolution(
        store,
        &merged_resolved,
        &merged_graph,
        req_hash,
        &ctx.cfg.server,
        current_spec,
    );
    Ok(Some((merged_resolved, merged_graph)))
}

fn split_roots_by_change(
    roots: &[Collection],
    current_spec: &BTreeMap<String, RequirementSpec>,
    prev_spec: &BTreeMap<String, RequirementSpec>,
) -> (Vec<Collection>, Vec<Collection>) {
    let mut unchanged = Vec::new();
    let mut changed = Vec::new();
    for root in roots {
        let fqdn = root.fqdn();
        let same = match (current_spec.get(&fqdn), prev_spec.get(&fqdn)) {
            (Some(current), Some(prev)) => requirement_spec_equal(current, prev),
            _ => false,
        };
        if same {
            unchanged.push(root.clone());
        } else {
            changed.push(root.clone());
        }
    }
    (unchanged, changed)
}

fn build_preserved_snapshot(
    cfg: &Config,
    unchanged_roots: &[Collection],
    resolved_snap: &BTreeMap<String, ResolvedEntry>,
    graph_snap: &BTreeMap<String, Vec<String>>,
) -> Option<(BTreeMap<String, Collection>, BTreeMap<String, Vec<String>>)> {
    let mut root_keys = Vec::with_capacity(unchanged_roots.len());
    for root in unchanged_roots {
        let fqdn = root.fqdn();
        let entry = resolved_snap.get(&fqdn)?;
        if entry.version.is_empty() {
            return None;
        }
        root_keys.push(format!("{fqdn}@{}", entry.version));
    }

    let preserved_keys = collect_graph_keys_from_keys(graph_snap, &root_keys);
    let mut preserved_graph = BTreeMap::new();
    let mut preserved_resolved = BTreeMap::new();
    for key in &preserved_keys {
        let deps = graph_snap.get(key)?;
        preserved_graph.insert(key.clone(), deps.clone());
        let col = preserved_entry(cfg, resolved_snap, key)?;
        preserved_resolved.insert(col.fqdn(), col);
    }
    Some((preserved_resolved, preserved_graph))
}

fn preserved_entry(
    cfg: &Config,
    resolved_snap: &BTreeMap<String, ResolvedEntry>,
    key: &str,
) -> Option<Collection> {
    let (fqdn, version) = split_collection_key(key).ok()?;
    let entry = resolved_snap.get(&fqdn)?;
    if entry.version != version {
        return None;
    }
    let (namespace, name) = split_fqdn(&fqdn)?;
    let source = if entry.source.is_empty() {
        cfg.server.clone()
    } else {
        entry.source.clone()
    };
    Some(Collection {
        namespace,
        name,
        version,
        source,
        ..Collection::default()
    })
}

fn merge_resolved_graphs(
    preserved_resolved: BTreeMap<String, Collection>,
    preserved_graph: BTreeMap<String, Vec<String>>,
    resolved_new: BTreeMap<String, Collection>,
    graph_new: BTreeMap<String, Vec<String>>,
) -> Option<(BTreeMap<String, Collection>, BTreeMap<String, Vec<String>>)> {
    let mut merged_resolved = preserved_resolved;
    for (fqdn, col) in resolved_new {
        if let Some(existing) = merged_resolved.get(&fqdn) {
            if existing.version != col.version {
                return None;
            }
        }
        merged_resolved.insert(fqdn, col);
    }

    let mut merged_graph = preserved_graph;
    for (key, deps) in graph_new {
        if let Some(existing) = merged_graph.get(&key) {
            if !same_deps(existing, &deps) {
                return None;
            }
            continue;
        }
        merged_graph.insert(key, deps);
    }
    Some((merged_resolved, merged_graph))
}

fn expand_graph_from_snapshot(
    cfg: &Config,
    merged_resolved: &mut BTreeMap<String, Collection>,
    merged_graph: &mut BTreeMap<String, Vec<String>>,
    resolved_snap: &BTreeMap<String, ResolvedEntry>,
    graph_snap: &BTreeMap<String, Vec<String>>,
) -> bool {
    let mut queue: VecDeque<String> = merged_graph.keys().cloned().collect();
    while let Some(key) = queue.pop_front() {
        let deps = merged_graph.get(&key).cloned().unwrap_or_default();
        for dep in deps {
            if merged_graph.contains_key(&dep) {
                continue;
            }
            let Some(dep_deps) = graph_snap.get(&dep) else {
                return false;
            };
            merged_graph.insert(dep.clone(), dep_deps.clone());
            queue.push_back(dep.clone());
            if !ensure_resolved_from_snapshot(cfg, merged_resolved, resolved_snap, &dep) {
                return false;
            }
        }
    }
    true
}

fn ensure_resolved_from_snapshot(
    cfg: &Config,
    merged_resolved: &mut BTreeMap<String, Collection>,
    resolved_snap: &BTreeMap<String, ResolvedEntry>,
    key: &str,
) -> bool {
    let Ok((fqdn, version)) = split_collection_key(key) else {
        return false;
    };
    if let Some(existing) = merged_resolved.get(&fqdn) {
        return existing.version == version;
    }
    let Some(col) = preserved_entry(cfg, resolved_snap, key) else {
        return false;
    };
    merged_resolved.insert(fqdn, col);
    true
}

fn validate_merged_graph(
    merged_resolved: &BTreeMap<String, Collection>,
    merged_graph: &BTreeMap<String, Vec<String>>,
) -> bool {
    for key in merged_graph.keys() {
        let Ok((fqdn, version)) = split_collection_key(key) else {
            return false;
        };
        let Some(entry) = merged_resolved.get(&fqdn) else {
            return false;
        };
        if entry.version != version {
            return false;
        }
    }
    true
}

/// Groups graph nodes into install levels: each level holds the nodes whose
/// remaining dependencies are all satisfied by earlier levels. An empty
/// level with nodes remaining means the graph has a cycle.
pub(crate) fn build_install_levels(
    graph: &BTreeMap<String, Vec<String>>,
) -> Result<Vec<Vec<String>>> {
    let mut indegree: BTreeMap<String, usize> = BTreeMap::new();
    let mut reverse: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (node, deps) in graph {
        indegree.entry(node.clone()).or_insert(0);
        for dep in deps {
            *indegree.entry(node.clone()).or_insert(0) += 1;
            reverse.entry(dep.clone()).or_default().push(node.clone());
            indegree.entry(dep.clone()).or_insert(0);
        }
    }

    let mut levels = Vec::new();
    while !indegree.is_empty() {
        let level: Vec<String> = indegree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(node, _)| node.clone())
            .collect();
        if level.is_empty() {
            return Err(Error::DependencyGraphHasACycle);
        }
        for node in &level {
            indegree.remove(node);
            if let Some(children) = reverse.get(node) {
                for child in children {
                    if let Some(deg) = indegree.get_mut(child) {
                        *deg -= 1;
                    }
                }
            }
        }
        levels.push(level);
    }
    Ok(levels)
}
