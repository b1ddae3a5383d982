//! Collection identity and root preparation.

pub mod candidates;
pub mod install;
pub mod metadata;
pub mod prefetch;
pub mod resolve;
pub mod start;
pub mod versions;

use std::collections::BTreeMap;

use gx_store::Store;

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::infra::Infra;
use crate::requirements::CollectionRequirement;

/// Shared context for resolution and metadata fetching.
#[derive(Clone, Copy)]
pub(crate) struct CollectionCtx<'a> {
    pub cfg: &'a Config,
    pub infra: &'a Infra,
    pub store: Option<&'a Store>,
}

/// A collection under resolution or installation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collection {
    pub namespace: String,
    pub name: String,
    pub version: String,
    pub source: String,
    pub signatures: Vec<String>,
    pub constraint: String,
    pub kind: String,
}

impl Collection {
    /// Unique key of the form `namespace.name@version`.
    pub fn key(&self) -> String {
        format!("{}.{}@{}", self.namespace, self.name, self.version)
    }

    pub fn fqdn(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}

impl From<CollectionRequirement> for Collection {
    fn from(req: CollectionRequirement) -> Self {
        Collection {
            namespace: req.namespace,
            name: req.name,
            constraint: req.version.clone(),
            version: req.version,
            source: req.source,
            signatures: req.signatures,
            kind: req.kind,
        }
    }
}

/// Splits a `namespace.collection` string.
pub fn split_fqdn(value: &str) -> Option<(String, String)> {
    let mut parts = value.trim().split('.');
    let namespace = parts.next()?;
    let name = parts.next()?;
    if parts.next().is_some() || namespace.is_empty() || name.is_empty() {
        return None;
    }
    Some((namespace.to_string(), name.to_string()))
}

/// Splits a key of the form `ns.name@version`.
pub fn split_collection_key(key: &str) -> Result<(String, String)> {
    let Some((fqdn, version)) = key.split_once('@') else {
        return Err(Error::InvalidCollectionKey(key.to_string()));
    };
    if fqdn.is_empty() || version.is_empty() {
        return Err(Error::InvalidCollectionKey(key.to_string()));
    }
    Ok((fqdn.to_string(), version.to_string()))
}

/// Builds the artifact-store key for a collection tarball.
pub fn artifact_key(namespace: &str, name: &str, version: &str) -> String {
    urlencoding::encode(&format!("{namespace}-{name}-{version}.tar.gz")).into_owned()
}

pub fn normalize_type(value: &str) -> String {
    value.trim().to_lowercase()
}

pub fn is_galaxy_type(value: &str) -> bool {
    let normalized = normalize_type(value);
    normalized.is_empty() || normalized == "galaxy"
}

/// Normalized root collections ready for resolution.
#[derive(Debug, Default)]
pub struct RootPreparation {
    pub all_roots: Vec<Collection>,
}

/// Normalizes and validates root requirements.
pub fn prepare_roots(cfg: &Config, roots: Vec<Collection>) -> Result<RootPreparation> {
    let mut prep = RootPreparation::default();
    let mut seen: BTreeMap<String, Collection> = BTreeMap::new();

    for mut root in roots {
        root.kind = normalize_type(&root.kind);
        if root.kind.is_empty() {
            root.kind = "galaxy".to_string();
        }
        if !is_galaxy_type(&root.kind) {
            return Err(Error::UnsupportedCollectionType(root.kind));
        }
        if root.namespace.is_empty() || root.name.is_empty() {
            let (namespace, name) = split_fqdn(&root.name)
                .ok_or_else(|| Error::InvalidCollectionName(root.name.clone()))?;
            root.namespace = namespace;
            root.name = name;
        }
        if root.source.is_empty() {
            root.source = cfg.server.clone();
        }
        let fqdn = root.fqdn();
        if seen.contains_key(&fqdn) {
            return Err(Error::DuplicateCollectionRequirement(fqdn));
        }
        seen.insert(fqdn, root.clone());
        prep.all_roots.push(root);
    }

    Ok(prep)
}
