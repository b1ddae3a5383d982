//! Per-collection installation: download, verify, extract, record.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use sha2::{Digest, Sha256};

use gx_store::{InstalledEntry, Store};

use crate::cache::{ArtifactFile, ArtifactStore};
use crate::collections::metadata::load_collection_metadata;
use crate::collections::{artifact_key, split_fqdn, Collection, CollectionCtx};
use crate::config::Config;
use crate::errors::{Error, Result};
use crate::infra::Infra;
use crate::types::{Manifest, VersionInfo};

/// Context for installing collections.
#[derive(Clone, Copy)]
pub(crate) struct InstallCtx<'a> {
    pub cfg: &'a Config,
    pub infra: &'a Infra,
    pub store: &'a Store,
    pub artifacts: &'a dyn ArtifactStore,
}

impl<'a> InstallCtx<'a> {
    pub(crate) fn collection_ctx(&self) -> CollectionCtx<'a> {
        CollectionCtx {
            cfg: self.cfg,
            infra: self.infra,
            store: Some(self.store),
        }
    }
}

/// Downloads, extracts, and records one collection install.
pub(crate) fn install_collection(
    ctx: InstallCtx<'_>,
    col: &Collection,
    resolved_deps: Option<Vec<String>>,
    meta_override: Option<VersionInfo>,
) -> Result<()> {
    let start = Instant::now();
    let filename = format!("{}-{}-{}.tar.gz", col.namespace, col.name, col.version);
    let install_path = install_path_for(ctx.cfg, col);

    if can_skip_install(ctx.cfg, col, &install_path, ctx.store) {
        ctx.infra.printer.status(&format!(
            "⏭️ Skipping install, already installed: {}/{}/{}",
            col.namespace, col.name, col.version
        ));
        return Ok(());
    }

    let payload = prepare_install(ctx, col, meta_override, &filename)?;

    let extract_start = Instant::now();
    extract_collection(ctx.infra, col, payload.artifact.path(), &install_path, &payload.sha256)?;
    tracing::debug!(elapsed = ?extract_start.elapsed(), "extract {}", col.key());

    let deps = resolve_install_deps(ctx, &install_path, resolved_deps, col)?;
    write_galaxy_info_if_present(ctx.infra, ctx.cfg, payload.meta.as_ref());
    record_install(ctx, col, &install_path, &payload.sha256, deps);
    tracing::debug!(elapsed = ?start.elapsed(), "install {}", col.key());
    Ok(())
}

struct InstallPayload {
    meta: Option<VersionInfo>,
    artifact: ArtifactFile,
    sha256: String,
}

fn prepare_install(
    ctx: InstallCtx<'_>,
    col: &Collection,
    meta_override: Option<VersionInfo>,
    filename: &str,
) -> Result<InstallPayload> {
    let use_cache = !ctx.cfg.no_cache;
    let key = artifact_key(&col.namespace, &col.name, &col.version);
    let cache_hit = use_cache && ctx.artifacts.has(&key).unwrap_or(false);

    if cache_hit && meta_override.is_none() {
        ctx.infra
            .printer
            .status(&format!("📦 Using cached {filename}"));
    }

    let meta = resolve_metadata(ctx, col, meta_override, cache_hit)?;
    let (artifact, download_sha) = fetch_artifact(ctx, col, meta.as_ref(), cache_hit, use_cache)?;
    let sha256 = resolve_artifact_sha(
        artifact.path(),
        meta.as_ref(),
        artifact.meta(),
        download_sha.as_deref(),
    )?;
    Ok(InstallPayload {
        meta,
        artifact,
        sha256,
    })
}

fn resolve_metadata(
    ctx: InstallCtx<'_>,
    col: &Collection,
    meta_override: Option<VersionInfo>,
    cache_hit: bool,
) -> Result<Option<VersionInfo>> {
    if meta_override.is_some() {
        return Ok(meta_override);
    }
    let meta_start = Instant::now();
    let loaded = load_collection_metadata(ctx.collection_ctx(), col);
    tracing::debug!(elapsed = ?meta_start.elapsed(), "metadata {}", col.key());
    match loaded {
        Ok(meta) => Ok(Some(meta)),
        Err(err) => {
            if cache_hit {
                ctx.infra.printer.persistent(&format!(
                    "⚠️ Failed to load metadata for {}: {err}",
                    col.key()
                ));
                return Ok(None);
            }
            Err(err)
        }
    }
}

fn fetch_artifact(
    ctx: InstallCtx<'_>,
    col: &Collection,
    meta: Option<&VersionInfo>,
    cache_hit: bool,
    use_cache: bool,
) -> Result<(ArtifactFile, Option<String>)> {
    let key = artifact_key(&col.namespace, &col.name, &col.version);
    if !cache_hit {
        let download_start = Instant::now();
        let (artifact, sha) = download_collection_to_cache(ctx, &key, meta, use_cache)?;
        tracing::debug!(elapsed = ?download_start.elapsed(), "download {}", col.key());
        return Ok((artifact, Some(sha)));
    }
    let cached = ctx.artifacts.fetch(&key)?;
    Ok((cached, None))
}

fn resolve_artifact_sha(
    path: &Path,
    meta: Option<&VersionInfo>,
    artifact_meta: &BTreeMap<String, String>,
    download_sha: Option<&str>,
) -> Result<String> {
    if let Some(sha) = download_sha.map(str::trim).filter(|s| !s.is_empty()) {
        return Ok(sha.to_string());
    }
    if let Some(sha) = meta
        .map(|m| m.artifact.sha256.trim())
        .filter(|s| !s.is_empty())
    {
        return Ok(sha.to_string());
    }
    if let Some(sha) = artifact_meta.get("sha256").map(|s| s.trim()).filter(|s| !s.is_empty()) {
        return Ok(sha.to_string());
    }
    Ok(gx_archive::file_hash_sha256(path)?)
}

/// Skip when the snapshot, the extract-done marker, and the GALAXY.yml
/// sidecar all agree the collection is fully installed at this path.
pub(crate) fn can_skip_install(
    cfg: &Config,
    col: &Collection,
    install_path: &Path,
    store: &Store,
) -> bool {
    let Some(entry) = store.get_installed(&col.key()) else {
        return false;
    };
    if entry.install_path.is_empty()
        || Path::new(&entry.install_path) != install_path
        || entry.artifact_sha256.is_empty()
    {
        return false;
    }
    let marker = install_path.join(format!(".extract-done.{}", entry.artifact_sha256));
    if !marker.exists() {
        return false;
    }
    let info_dir = cfg.download_path.join("ansible_collections").join(format!(
        "{}.{}-{}.info",
        col.namespace, col.name, col.version
    ));
    info_dir.join("GALAXY.yml").exists()
}

/// Downloads an artifact to a staging file, hashing while streaming, and
/// commits it to the artifact store when caching is enabled.
pub(crate) fn download_collection_to_cache(
    ctx: InstallCtx<'_>,
    key: &str,
    meta: Option<&VersionInfo>,
    use_cache: bool,
) -> Result<(ArtifactFile, String)> {
    let Some(meta) = meta else {
        return Err(Error::MetadataUnavailable);
    };
    if meta.download_url.is_empty() {
        return Err(Error::MissingDownloadUrl);
    }

    ctx.infra
        .printer
        .status(&format!("🌐 Downloading {}", meta.download_url));
    let mut response = ctx.infra.http.get(&meta.download_url).send()?;
    if response.status().as_u16() != 200 {
        return Err(Error::DownloadFailed {
            url: meta.download_url.clone(),
            status: response.status().to_string(),
        });
    }

    let mut tmp = ctx.artifacts.temp_file(".download-")?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = response.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        tmp.as_file_mut().write_all(&buffer[..read])?;
    }
    tmp.as_file_mut().flush()?;
    let sha = hex::encode(hasher.finalize());

    let expected = meta.artifact.sha256.trim();
    if !expected.is_empty() && expected != sha {
        // Dropping the staging file removes it.
        return Err(Error::Sha256Mismatch {
            expected: expected.to_string(),
            actual: sha,
        });
    }

    if use_cache {
        let meta_map = BTreeMap::from([("sha256".to_string(), sha.clone())]);
        let artifact = ctx.artifacts.commit(key, tmp, meta_map)?;
        return Ok((artifact, sha));
    }
    let meta_map = BTreeMap::from([("sha256".to_string(), sha.clone())]);
    Ok((ArtifactFile::staged(tmp, meta_map), sha))
}

/// Unpacks a collection tarball into the install path, guarded by the
/// extract-done marker.
pub(crate) fn extract_collection(
    infra: &Infra,
    col: &Collection,
    tar_path: &Path,
    install_path: &Path,
    artifact_sha: &str,
) -> Result<()> {
    let sha = if artifact_sha.is_empty() {
        gx_archive::file_hash_sha256(tar_path)?
    } else {
        artifact_sha.to_string()
    };
    let marker = install_path.join(format!(".extract-done.{sha}"));
    if marker.exists() {
        infra.printer.status(&format!(
            "⏭️ Skipping extraction, already done: {}/{}",
            col.namespace, col.name
        ));
        return Ok(());
    }

    let _ = fs::remove_dir_all(install_path);
    fs::create_dir_all(install_path)?;
    gx_archive::extract_tar_gz(tar_path, install_path)?;
    fs::write(&marker, b"ok")?;
    Ok(())
}

fn resolve_install_deps(
    ctx: InstallCtx<'_>,
    install_path: &Path,
    resolved_deps: Option<Vec<String>>,
    col: &Collection,
) -> Result<Option<Vec<String>>> {
    if resolved_deps.is_some() || ctx.cfg.no_deps {
        return Ok(resolved_deps);
    }
    let deps_start = Instant::now();
    let deps = install_manifest_dependencies(ctx, install_path)?;
    tracing::debug!(elapsed = ?deps_start.elapsed(), "deps {}", col.key());
    Ok(deps)
}

/// Fallback path: installs the dependencies declared by the extracted
/// MANIFEST.json. Individual failures warn and continue.
fn install_manifest_dependencies(
    ctx: InstallCtx<'_>,
    install_path: &Path,
) -> Result<Option<Vec<String>>> {
    let manifest_path = install_path.join("MANIFEST.json");
    let data = match fs::read(&manifest_path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let manifest: Manifest = serde_json::from_slice(&data)?;

    let mut deps = Vec::new();
    for (fqdn, constraint) in &manifest.collection_info.dependencies {
        let Some((namespace, name)) = split_fqdn(fqdn) else {
            ctx.infra
                .printer
                .status(&format!("⚠️ Skipping invalid dependency: {fqdn}"));
            continue;
        };
        let dep = Collection {
            namespace,
            name,
            version: constraint.clone(),
            source: ctx.cfg.server.clone(),
            ..Collection::default()
        };
        deps.push(dep.key());
        ctx.infra
            .printer
            .status(&format!("🔁 Installing dependency: {fqdn} {constraint}"));
        if let Err(err) = install_collection(ctx, &dep, None, None) {
            ctx.infra
                .printer
                .persistent(&format!("⚠️ Failed to install dependency: {fqdn}: {err}"));
        }
    }
    Ok(Some(deps))
}

#[derive(Serialize)]
struct GalaxyYaml<'a> {
    download_url: &'a str,
    format_version: &'a str,
    name: &'a str,
    namespace: &'a str,
    server: &'a str,
    signatures: &'a serde_json::Value,
    version: &'a str,
    version_url: &'a str,
}

fn write_galaxy_info_if_present(infra: &Infra, cfg: &Config, meta: Option<&VersionInfo>) {
    if let Err(err) = write_galaxy_info(cfg, meta) {
        infra
            .printer
            .status(&format!("⚠️ Failed to write GALAXY.yml: {err}"));
    }
}

/// Writes the GALAXY.yml sidecar for an installed collection.
pub(crate) fn write_galaxy_info(cfg: &Config, meta: Option<&VersionInfo>) -> Result<()> {
    let Some(meta) = meta else {
        return Ok(());
    };
    let info_dir = cfg.download_path.join("ansible_collections").join(format!(
        "{}.{}-{}.info",
        meta.namespace.name, meta.name, meta.version
    ));
    fs::create_dir_all(&info_dir)?;

    let sidecar = GalaxyYaml {
        download_url: &meta.download_url,
        format_version: "1.0.0",
        name: &meta.name,
        namespace: &meta.namespace.name,
        server: &cfg.server,
        signatures: &meta.signatures,
        version: &meta.version,
        version_url: &meta.href,
    };
    let payload = serde_yaml::to_string(&sidecar)?;
    fs::write(info_dir.join("GALAXY.yml"), payload)?;
    Ok(())
}

fn record_install(
    ctx: InstallCtx<'_>,
    col: &Collection,
    install_path: &Path,
    sha256: &str,
    deps: Option<Vec<String>>,
) {
    ctx.store.set_installed(
        &col.key(),
        InstalledEntry {
            install_path: install_path.display().to_string(),
            source: col.source.clone(),
            artifact_sha256: sha256.to_string(),
            installed_at: (ctx.infra.now)(),
            deps: deps.clone().unwrap_or_default(),
        },
    );
    if let Some(deps) = deps {
        ctx.store.set_graph(&col.key(), deps);
    }
}

/// Returns the install path for a collection under the download path.
pub(crate) fn install_path_for(cfg: &Config, col: &Collection) -> PathBuf {
    cfg.download_path
        .join("ansible_collections")
        .join(&col.namespace)
        .join(&col.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_config;
    use time::OffsetDateTime;

    fn sample_collection() -> Collection {
        Collection {
            namespace: "community".into(),
            name: "general".into(),
            version: "11.1.0".into(),
            source: "https://galaxy.example.com".into(),
            ..Collection::default()
        }
    }

    #[test]
    fn sha_resolution_prefers_download_hash() {
        let temp = tempfile::tempdir().unwrap();
        let blob = temp.path().join("a.tar.gz");
        fs::write(&blob, b"data").unwrap();

        let mut meta = VersionInfo::default();
        meta.artifact.sha256 = "from-meta".into();
        let artifact_meta = BTreeMap::from([("sha256".to_string(), "from-store".to_string())]);

        let sha = resolve_artifact_sha(&blob, Some(&meta), &artifact_meta, Some("from-download"))
            .unwrap();
        assert_eq!(sha, "from-download");

        let sha = resolve_artifact_sha(&blob, Some(&meta), &artifact_meta, None).unwrap();
        assert_eq!(sha, "from-meta");

        let sha = resolve_artifact_sha(&blob, None, &artifact_meta, None).unwrap();
        assert_eq!(sha, "from-store");

        let sha = resolve_artifact_sha(&blob, None, &BTreeMap::new(), None).unwrap();
        assert_eq!(sha, hex::encode(Sha256::digest(b"data")));
    }

    #[test]
    fn skip_requires_marker_and_sidecar() {
        let temp = tempfile::tempdir().unwrap();
        let mut cfg = test_config("https://galaxy.example.com");
        cfg.download_path = temp.path().to_path_buf();

        let col = sample_collection();
        let install_path = install_path_for(&cfg, &col);
        let store = Store::new();

        assert!(!can_skip_install(&cfg, &col, &install_path, &store));

        store.set_installed(
            &col.key(),
            InstalledEntry {
                install_path: install_path.display().to_string(),
                source: col.source.clone(),
                artifact_sha256: "abc123".into(),
                installed_at: OffsetDateTime::now_utc(),
                deps: vec![],
            },
        );
        assert!(!can_skip_install(&cfg, &col, &install_path, &store));

        fs::create_dir_all(&install_path).unwrap();
        fs::write(install_path.join(".extract-done.abc123"), b"ok").unwrap();
        assert!(!can_skip_install(&cfg, &col, &install_path, &store));

        let info_dir = cfg
            .download_path
            .join("ansible_collections")
            .join("community.general-11.1.0.info");
        fs::create_dir_all(&info_dir).unwrap();
        fs::write(info_dir.join("GALAXY.yml"), b"format_version: 1.0.0\n").unwrap();
        assert!(can_skip_install(&cfg, &col, &install_path, &store));
    }

    #[test]
    fn sidecar_carries_version_metadata() {
        let temp = tempfile::tempdir().unwrap();
        let mut cfg = test_config("https://galaxy.example.com");
        cfg.download_path = temp.path().to_path_buf();

        let mut meta = VersionInfo::default();
        meta.namespace.name = "community".into();
        meta.name = "general".into();
        meta.version = "11.1.0".into();
        meta.download_url = "https://galaxy.example.com/api/v3/artifacts/x.tar.gz".into();
        meta.href = "https://galaxy.example.com/api/v3/collections/community/general/versions/11.1.0/".into();

        write_galaxy_info(&cfg, Some(&meta)).unwrap();

        let sidecar = fs::read_to_string(
            cfg.download_path
                .join("ansible_collections")
                .join("community.general-11.1.0.info")
                .join("GALAXY.yml"),
        )
        .unwrap();
        assert!(sidecar.contains("format_version: 1.0.0"));
        assert!(sidecar.contains("namespace: community"));
        assert!(sidecar.contains("version: 11.1.0"));
        assert!(sidecar.contains("download_url: https://galaxy.example.com/api/v3/artifacts/x.tar.gz"));
    }
}
