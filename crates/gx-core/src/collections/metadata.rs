//! Root and version metadata fetching over the HTTP cache.

use serde_json::Value;

use crate::api_cache::{fetch_json_with_cache_policy, Policy};
use crate::collections::candidates::{normalize_versions_url, root_metadata_url_candidates};
use crate::collections::resolve::{
    exact_version_from_constraints, select_version, VERSION_PAGE_LIMIT,
};
use crate::collections::versions::parse_versions_payload;
use crate::collections::{Collection, CollectionCtx};
use crate::errors::{Error, Result};
use crate::types::{CollectionRoot, VersionInfo};

/// Resolves and fetches the version detail metadata for a collection whose
/// `version` field carries its constraint (the installer's path).
pub(crate) fn load_collection_metadata(
    ctx: CollectionCtx<'_>,
    col: &Collection,
) -> Result<VersionInfo> {
    let (version, exact) = exact_version_from_constraints(std::slice::from_ref(&col.version))?;
    let policy = crate::api_cache::policy_for_constraint(ctx.cfg, exact);

    let root = load_root_metadata_cached(ctx, col, policy)?;
    let mut versions_url = normalize_versions_url(&col.source, &root.versions_url);
    if !versions_url.ends_with('/') {
        versions_url.push('/');
    }
    tracing::debug!(
        "versions_url resolved: base={} ref={} -> {versions_url}",
        col.source,
        root.versions_url
    );

    let mut version_url = root.highest_version.href.clone();
    if exact {
        version_url = format!("{versions_url}{version}/");
    } else if col.version != "*" {
        let versions = load_versions_list_cached(ctx, &versions_url, VERSION_PAGE_LIMIT, policy)?;
        let selected = select_version(&versions, std::slice::from_ref(&col.version))?;
        version_url = format!("{versions_url}{selected}/");
    }

    let version_url = normalize_versions_url(&col.source, &version_url);
    fetch_json_with_cache_policy(ctx.infra, &version_url, ctx.store, policy)
}

/// Loads root collection metadata, probing the candidate API roots.
///
/// Without an explicit source a 404 moves on to the next candidate; with
/// one, the first failure propagates.
pub(crate) fn load_root_metadata_cached(
    ctx: CollectionCtx<'_>,
    col: &Collection,
    policy: Policy,
) -> Result<CollectionRoot> {
    let has_explicit_source = !col.source.trim().is_empty();
    let candidates = root_metadata_url_candidates(ctx.cfg, col);
    tracing::debug!(
        "root metadata candidates for {}: {}",
        col.key(),
        candidates.join(", ")
    );

    let mut last_err = None;
    for url in &candidates {
        tracing::debug!("root metadata GET {url}");
        match fetch_json_with_cache_policy::<CollectionRoot>(ctx.infra, url, ctx.store, policy) {
            Ok(root) => {
                tracing::debug!("root metadata OK {url}");
                return Ok(root);
            }
            Err(err) => {
                if has_explicit_source {
                    return Err(err);
                }
                if err.is_http_status(404) {
                    tracing::debug!("root metadata 404 {url}");
                    last_err = Some(err);
                    continue;
                }
                return Err(err);
            }
        }
    }
    Err(last_err.unwrap_or(Error::LoadMetadataFailed))
}

/// Fetches the detail metadata for a specific version.
pub(crate) fn fetch_version_metadata_cached(
    ctx: CollectionCtx<'_>,
    source: &str,
    versions_url: &str,
    version: &str,
    policy: Policy,
) -> Result<VersionInfo> {
    let version = version.trim_start_matches("= ").trim();
    let mut base = normalize_versions_url(source, versions_url);
    if !base.ends_with('/') {
        base.push('/');
    }
    let url = format!("{base}{version}/");
    fetch_json_with_cache_policy(ctx.infra, &url, ctx.store, policy)
}

/// Loads the available versions list, re-fetching once when the first page
/// reports more entries than the requested limit.
pub(crate) fn load_versions_list_cached(
    ctx: CollectionCtx<'_>,
    versions_url: &str,
    limit: u64,
    policy: Policy,
) -> Result<Vec<String>> {
    if let Some(versions) = cached_versions_list(ctx, policy, versions_url) {
        return Ok(versions);
    }
    let (versions, total) = fetch_versions_page(ctx, policy, versions_url, limit)?;
    if total > limit {
        return load_versions_list_cached(ctx, versions_url, total, policy);
    }
    if let Some(store) = ctx.store {
        if policy.write && policy.ttl.is_zero() {
            store.set_versions_cache(versions_url, versions.clone());
        }
    }
    Ok(versions)
}

// The versions bucket only serves immutable (zero-TTL) lookups.
fn cached_versions_list(
    ctx: CollectionCtx<'_>,
    policy: Policy,
    versions_url: &str,
) -> Option<Vec<String>> {
    if !policy.read || !policy.ttl.is_zero() {
        return None;
    }
    ctx.store?.get_versions_cache(versions_url)
}

fn fetch_versions_page(
    ctx: CollectionCtx<'_>,
    policy: Policy,
    versions_url: &str,
    limit: u64,
) -> Result<(Vec<String>, u64)> {
    let url = format!("{versions_url}?limit={limit}&offset=0");
    let payload: Value = fetch_json_with_cache_policy(ctx.infra, &url, ctx.store, policy)?;
    parse_versions_payload(&payload)
}
