//! Galaxy API root candidates and URL resolution.
//!
//! Servers differ in whether they live at `/api/v3`, `/api/v2`, or a bare
//! `/api`, and some return relative version URLs that drop the `/api/…`
//! prefix; the helpers here paper over both.

use url::Url;

use crate::collections::Collection;
use crate::config::Config;

/// Returns candidate base URLs for metadata lookup, explicit source first.
pub fn server_base_candidates(cfg: &Config, col: &Collection) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut add = |value: &str| {
        let trimmed = value.trim().trim_matches('"').trim_end_matches('/');
        if !trimmed.is_empty() && !out.iter().any(|existing| existing == trimmed) {
            out.push(trimmed.to_string());
        }
    };
    add(&col.source);
    add(&cfg.server);
    out
}

/// Builds candidate root-metadata URLs for a collection, in probe order.
pub fn root_metadata_url_candidates(cfg: &Config, col: &Collection) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut add = |url: String| {
        if !url.is_empty() && !out.contains(&url) {
            out.push(url);
        }
    };
    for base in server_base_candidates(cfg, col) {
        for api_root in api_root_candidates(&base) {
            let url = format!("{api_root}/collections/{}/{}/", col.namespace, col.name);
            add(url.clone());
            add(url.trim_end_matches('/').to_string());
        }
    }
    out
}

/// Derives API-root candidates from a base URL.
pub fn api_root_candidates(base: &str) -> Vec<String> {
    let trimmed = base.trim().trim_matches('"').trim_end_matches('/');
    if trimmed.is_empty() {
        return Vec::new();
    }
    let mut out: Vec<String> = Vec::new();
    let mut add = |value: String| {
        let value = value.trim_end_matches('/').to_string();
        if !out.contains(&value) {
            out.push(value);
        }
    };
    if trimmed.ends_with("/api/v3") || trimmed.ends_with("/api/v2") {
        add(trimmed.to_string());
    } else if trimmed.ends_with("/api") {
        add(format!("{trimmed}/v3"));
        add(format!("{trimmed}/v2"));
        add(trimmed.to_string());
    } else {
        add(format!("{trimmed}/api/v3"));
        add(format!("{trimmed}/api/v2"));
        add(format!("{trimmed}/api"));
    }
    out
}

/// Resolves a server-returned versions URL back to an absolute URL.
pub fn normalize_versions_url(source: &str, versions_url: &str) -> String {
    let mut base = versions_url.trim().to_string();
    if let Some(rest) = base.strip_prefix("https//") {
        base = format!("https://{rest}");
    }
    if let Some(rest) = base.strip_prefix("http//") {
        base = format!("http://{rest}");
    }
    if base.starts_with("https://") || base.starts_with("http://") {
        return base;
    }
    resolve_url(source, &base)
}

/// Resolves `reference` relative to `base`, preserving an `/api/…` prefix
/// that the server dropped from an absolute-path reference.
pub fn resolve_url(base: &str, reference: &str) -> String {
    let base = base.trim();
    let reference = reference.trim();
    if base.is_empty() {
        return reference.to_string();
    }
    let Ok(base_url) = Url::parse(base) else {
        return join_url(base, reference);
    };
    if let Ok(abs) = Url::parse(reference) {
        return abs.to_string();
    }
    if reference.starts_with('/') {
        let base_path = base_url.path().trim_end_matches('/');
        if !base_path.is_empty() && needs_base_path_merge(base_path, reference) {
            let mut merged = base_url.clone();
            merged.set_path(&format!(
                "{}/{}",
                base_path.trim_end_matches('/'),
                reference.trim_start_matches('/')
            ));
            merged.set_query(None);
            merged.set_fragment(None);
            return merged.to_string();
        }
    }
    base_url
        .join(reference)
        .map(|joined| joined.to_string())
        .unwrap_or_else(|_| join_url(base, reference))
}

fn join_url(base: &str, reference: &str) -> String {
    let base = base.trim_end_matches('/');
    let reference = reference.trim_start_matches('/');
    if base.is_empty() {
        return reference.to_string();
    }
    if reference.is_empty() {
        return base.to_string();
    }
    format!("{base}/{reference}")
}

fn needs_base_path_merge(base_path: &str, ref_path: &str) -> bool {
    if base_path.is_empty() || ref_path.is_empty() {
        return false;
    }
    if ref_path == base_path || ref_path.starts_with(&format!("{base_path}/")) {
        return false;
    }
    ref_path.starts_with("/api/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_config;

    fn galaxy_col(source: &str) -> Collection {
        Collection {
            namespace: "community".into(),
            name: "general".into(),
            source: source.into(),
            ..Collection::default()
        }
    }

    #[test]
    fn bare_base_gets_api_suffixes() {
        assert_eq!(
            api_root_candidates("https://hub.example.com"),
            vec![
                "https://hub.example.com/api/v3",
                "https://hub.example.com/api/v2",
                "https://hub.example.com/api",
            ]
        );
    }

    #[test]
    fn api_base_gets_version_suffixes() {
        assert_eq!(
            api_root_candidates("https://hub.example.com/api/"),
            vec![
                "https://hub.example.com/api/v3",
                "https://hub.example.com/api/v2",
                "https://hub.example.com/api",
            ]
        );
    }

    #[test]
    fn versioned_base_is_used_as_is() {
        assert_eq!(
            api_root_candidates("https://hub.example.com/api/v3"),
            vec!["https://hub.example.com/api/v3"]
        );
        assert_eq!(
            api_root_candidates("https://hub.example.com/api/v2/"),
            vec!["https://hub.example.com/api/v2"]
        );
    }

    #[test]
    fn candidates_prefer_explicit_source() {
        let cfg = test_config("https://galaxy.example.com");
        let col = galaxy_col("https://hub.example.com/api/v3");
        let urls = root_metadata_url_candidates(&cfg, &col);
        assert_eq!(
            urls[0],
            "https://hub.example.com/api/v3/collections/community/general/"
        );
        assert!(urls
            .iter()
            .any(|u| u == "https://galaxy.example.com/api/v3/collections/community/general/"));
    }

    #[test]
    fn normalizes_malformed_schemes() {
        assert_eq!(
            normalize_versions_url("", "https//hub.example.com/api/v3/x/"),
            "https://hub.example.com/api/v3/x/"
        );
    }

    #[test]
    fn merges_api_prefix_dropped_by_server() {
        let resolved = resolve_url(
            "https://hub.example.com/galaxy",
            "/api/v3/collections/community/general/versions/",
        );
        assert_eq!(
            resolved,
            "https://hub.example.com/galaxy/api/v3/collections/community/general/versions/"
        );
    }

    #[test]
    fn keeps_absolute_references() {
        let resolved = resolve_url(
            "https://hub.example.com/galaxy",
            "https://other.example.com/api/v3/versions/",
        );
        assert_eq!(resolved, "https://other.example.com/api/v3/versions/");
    }

    #[test]
    fn plain_absolute_path_resolves_against_host() {
        let resolved = resolve_url(
            "https://hub.example.com",
            "/api/v3/collections/a/b/versions/",
        );
        assert_eq!(
            resolved,
            "https://hub.example.com/api/v3/collections/a/b/versions/"
        );
    }
}
