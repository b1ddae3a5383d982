//! Conditional-GET JSON cache over the snapshot store.
//!
//! Cache entries are keyed by the SHA-256 of the URL and carry the response
//! body plus its validators. A fresh entry (TTL zero, or age within TTL) is
//! served directly; a stale entry is revalidated with If-None-Match /
//! If-Modified-Since, and a 304 refreshes the entry in place.

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

use gx_store::{ApiCacheEntry, Store};

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::infra::Infra;

/// TTL for "latest version" style metadata.
pub const LATEST_METADATA_TTL: Duration = Duration::from_secs(10 * 60);

/// Cache read/write behavior for one fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Policy {
    pub read: bool,
    pub write: bool,
    pub ttl: Duration,
}

/// Derives the cache policy for a constraint's exactness.
pub fn policy_for_constraint(cfg: &Config, exact: bool) -> Policy {
    if cfg.no_cache {
        return Policy::default();
    }
    if !exact {
        if cfg.refresh {
            return Policy {
                read: false,
                write: true,
                ttl: LATEST_METADATA_TTL,
            };
        }
        return Policy {
            read: true,
            write: true,
            ttl: LATEST_METADATA_TTL,
        };
    }
    Policy {
        read: true,
        write: true,
        ttl: Duration::ZERO,
    }
}

/// Generates the stable cache key for a URL.
pub fn api_cache_key(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

/// Fetches JSON honoring the cache policy and decodes it into `T`.
pub fn fetch_json_with_cache_policy<T: DeserializeOwned>(
    infra: &Infra,
    url: &str,
    store: Option<&Store>,
    policy: Policy,
) -> Result<T> {
    let Some(store) = store.filter(|_| policy.read || policy.write) else {
        let fetched = fetch_json_body(&infra.http, url, None)?;
        return Ok(serde_json::from_str(&fetched.body)?);
    };

    let key = api_cache_key(url);
    if policy.read {
        if let Some(entry) = store.get_api_cache(&key) {
            if entry.url == url && !entry.body.is_empty() {
                return serve_cached(infra, url, store, &key, entry, policy);
            }
        }
    }
    fetch_and_store(infra, url, store, &key, policy)
}

fn serve_cached<T: DeserializeOwned>(
    infra: &Infra,
    url: &str,
    store: &Store,
    key: &str,
    entry: ApiCacheEntry,
    policy: Policy,
) -> Result<T> {
    if entry_is_fresh(infra, &entry, policy) {
        return Ok(serde_json::from_str(&entry.body)?);
    }
    tracing::debug!(url, "revalidating stale cache entry");
    let fetched = fetch_json_body(&infra.http, url, Some(&entry))?;
    if fetched.not_modified {
        let refreshed = refresh_entry(infra, entry, &fetched);
        let body = refreshed.body.clone();
        if policy.write {
            store.set_api_cache(key, refreshed);
        }
        return Ok(serde_json::from_str(&body)?);
    }
    if policy.write {
        store.set_api_cache(key, new_entry(infra, url, &fetched, policy));
    }
    Ok(serde_json::from_str(&fetched.body)?)
}

fn fetch_and_store<T: DeserializeOwned>(
    infra: &Infra,
    url: &str,
    store: &Store,
    key: &str,
    policy: Policy,
) -> Result<T> {
    let fetched = fetch_json_body(&infra.http, url, None)?;
    if policy.write {
        store.set_api_cache(key, new_entry(infra, url, &fetched, policy));
    }
    Ok(serde_json::from_str(&fetched.body)?)
}

fn entry_is_fresh(infra: &Infra, entry: &ApiCacheEntry, policy: Policy) -> bool {
    if policy.ttl.is_zero() {
        return true;
    }
    let age = (infra.now)() - entry.fetched_at;
    age <= time::Duration::seconds(policy.ttl.as_secs() as i64)
}

fn new_entry(infra: &Infra, url: &str, fetched: &FetchedBody, policy: Policy) -> ApiCacheEntry {
    ApiCacheEntry {
        url: url.to_string(),
        etag: fetched.etag.clone(),
        last_modified: fetched.last_modified.clone(),
        fetched_at: (infra.now)(),
        ttl_secs: policy.ttl.as_secs(),
        body: fetched.body.clone(),
    }
}

fn refresh_entry(infra: &Infra, mut entry: ApiCacheEntry, fetched: &FetchedBody) -> ApiCacheEntry {
    entry.fetched_at = (infra.now)();
    if !fetched.etag.is_empty() {
        entry.etag = fetched.etag.clone();
    }
    if !fetched.last_modified.is_empty() {
        entry.last_modified = fetched.last_modified.clone();
    }
    entry
}

struct FetchedBody {
    body: String,
    etag: String,
    last_modified: String,
    not_modified: bool,
}

fn fetch_json_body(client: &Client, url: &str, entry: Option<&ApiCacheEntry>) -> Result<FetchedBody> {
    let mut request = client.get(url);
    if let Some(entry) = entry {
        if !entry.etag.is_empty() {
            request = request.header(IF_NONE_MATCH, entry.etag.as_str());
        }
        if !entry.last_modified.is_empty() {
            request = request.header(IF_MODIFIED_SINCE, entry.last_modified.as_str());
        }
    }
    let response = request.send()?;
    let status = response.status();
    let etag = header_string(&response, ETAG);
    let last_modified = header_string(&response, LAST_MODIFIED);

    if status == StatusCode::NOT_MODIFIED {
        return Ok(FetchedBody {
            body: String::new(),
            etag,
            last_modified,
            not_modified: true,
        });
    }
    if status != StatusCode::OK {
        return Err(Error::HttpStatus {
            url: url.to_string(),
            status: status.to_string(),
            code: status.as_u16(),
        });
    }
    Ok(FetchedBody {
        body: response.text()?,
        etag,
        last_modified,
        not_modified: false,
    })
}

fn header_string(response: &reqwest::blocking::Response, name: reqwest::header::HeaderName) -> String {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(no_cache: bool, refresh: bool) -> Config {
        let mut cfg = crate::test_support::test_config("https://galaxy.ansible.com");
        cfg.no_cache = no_cache;
        cfg.refresh = refresh;
        cfg
    }

    #[test]
    fn cache_key_is_sha256_of_url() {
        let url = "https://galaxy.ansible.com/api/v3/collections/a/b/";
        assert_eq!(api_cache_key(url), hex::encode(Sha256::digest(url)));
    }

    #[test]
    fn policy_no_cache_disables_everything() {
        let policy = policy_for_constraint(&test_config(true, false), false);
        assert_eq!(policy, Policy::default());
    }

    #[test]
    fn policy_non_exact_uses_latest_ttl() {
        let policy = policy_for_constraint(&test_config(false, false), false);
        assert!(policy.read && policy.write);
        assert_eq!(policy.ttl, LATEST_METADATA_TTL);
    }

    #[test]
    fn policy_refresh_drops_reads_for_non_exact() {
        let policy = policy_for_constraint(&test_config(false, true), false);
        assert!(!policy.read);
        assert!(policy.write);
        assert_eq!(policy.ttl, LATEST_METADATA_TTL);

        let exact = policy_for_constraint(&test_config(false, true), true);
        assert!(exact.read && exact.write);
        assert!(exact.ttl.is_zero());
    }
}
