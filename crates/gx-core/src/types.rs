//! Galaxy API payload types.
//!
//! Fields default to empty so the decoder tolerates the differences between
//! the v2 and v3 API shapes; callers validate what they actually need.

use std::collections::BTreeMap;

use serde::Deserialize;

/// Root metadata for a collection (`…/collections/<ns>/<name>/`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CollectionRoot {
    #[serde(default)]
    pub href: String,
    #[serde(default)]
    pub versions_url: String,
    #[serde(default)]
    pub highest_version: VersionRef,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VersionRef {
    #[serde(default)]
    pub href: String,
    #[serde(default)]
    pub version: String,
}

/// Detail payload for one collection version.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VersionInfo {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub href: String,
    #[serde(default)]
    pub download_url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: NamespaceRef,
    #[serde(default)]
    pub artifact: ArtifactRef,
    #[serde(default)]
    pub metadata: VersionMetadata,
    #[serde(default)]
    pub manifest: Manifest,
    #[serde(default)]
    pub signatures: serde_json::Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NamespaceRef {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArtifactRef {
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub sha256: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VersionMetadata {
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}

/// MANIFEST.json, both inline in version payloads and on disk after extract.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub collection_info: CollectionInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CollectionInfo {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}
