//! Runtime configuration assembled from CLI options and ansible.cfg.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::errors::{Error, Result};
use crate::fetch::DEFAULT_TIMEOUT;

pub const DEFAULT_SERVER: &str = "https://galaxy.ansible.com";
pub const DEFAULT_COLLECTIONS_PATH: &str = ".collections";
pub const DEFAULT_REQUIREMENTS_FILE: &str = "requirements.yml";
pub const DEFAULT_ANSIBLE_CONFIG: &str = "ansible.cfg";

/// Runtime settings for install and cleanup operations.
#[derive(Debug, Clone)]
pub struct Config {
    pub verbose: bool,
    pub quiet: bool,
    pub requirements_file: PathBuf,
    pub cache_dir: PathBuf,
    pub download_path: PathBuf,
    pub server: String,
    pub s3: S3CacheConfig,
    pub clear_cache: bool,
    pub no_cache: bool,
    pub refresh: bool,
    pub no_deps: bool,
    pub dry_run: bool,
    pub timeout: Duration,
    pub workers: usize,
    pub ansible_config_path: Option<PathBuf>,
    pub ansible_collections_path_used: bool,
    pub ansible_cache_dir_used: bool,
    pub ansible_server_used: bool,
}

/// Configuration for the S3 cache backend.
#[derive(Debug, Clone, Default)]
pub struct S3CacheConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub prefix: String,
    pub access_key: String,
    pub secret_key: String,
    pub session_token: String,
    pub path_style: bool,
}

/// Raw option values as collected by the CLI layer.
#[derive(Debug, Clone, Default)]
pub struct CliOptions {
    pub verbose: bool,
    pub quiet: bool,
    pub dry_run: bool,
    pub requirements_file: String,
    pub download_path: String,
    pub server: String,
    pub cache_dir: String,
    pub ansible_config: String,
    pub timeout_secs: u64,
    pub workers: usize,
    pub no_cache: bool,
    pub refresh: bool,
    pub clear_cache: bool,
    pub no_deps: bool,
    pub s3_bucket: String,
    pub s3_region: String,
    pub s3_prefix: String,
    pub s3_access_key: String,
    pub s3_secret_key: String,
    pub s3_endpoint: String,
    pub s3_session_token: String,
    pub s3_path_style_disabled: bool,
}

/// Builds a [`Config`] from CLI options merged with the ansible.cfg subset.
pub fn build_config(opts: &CliOptions) -> Result<Config> {
    let (ansible, ansible_path) = load_ansible_config(Path::new(&opts.ansible_config))?;

    let workers = if opts.workers < 1 {
        std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1)
    } else {
        opts.workers
    };

    let download_path = if ansible.defaults.collections_path.is_empty() {
        opts.download_path.clone()
    } else {
        ansible.defaults.collections_path.clone()
    };
    let cache_dir = if ansible.galaxy.cache_dir.is_empty() {
        opts.cache_dir.clone()
    } else {
        ansible.galaxy.cache_dir.clone()
    };
    let server = if ansible.galaxy.server.is_empty() {
        opts.server.clone()
    } else {
        ansible.galaxy.server.clone()
    };

    Ok(Config {
        verbose: opts.verbose,
        quiet: !opts.verbose && opts.quiet,
        requirements_file: PathBuf::from(&opts.requirements_file),
        cache_dir: PathBuf::from(cache_dir),
        download_path: PathBuf::from(download_path),
        server,
        s3: build_s3_config(opts)?,
        clear_cache: opts.clear_cache,
        no_cache: opts.no_cache,
        refresh: opts.refresh,
        no_deps: opts.no_deps,
        dry_run: opts.dry_run,
        timeout: Duration::from_secs(opts.timeout_secs).max(DEFAULT_TIMEOUT),
        workers,
        ansible_config_path: ansible_path,
        ansible_collections_path_used: !ansible.defaults.collections_path.is_empty(),
        ansible_cache_dir_used: !ansible.galaxy.cache_dir.is_empty(),
        ansible_server_used: !ansible.galaxy.server.is_empty(),
    })
}

fn build_s3_config(opts: &CliOptions) -> Result<S3CacheConfig> {
    let mut cfg = S3CacheConfig {
        enabled: false,
        endpoint: opts.s3_endpoint.clone(),
        region: opts.s3_region.clone(),
        bucket: opts.s3_bucket.clone(),
        prefix: opts.s3_prefix.clone(),
        access_key: opts.s3_access_key.clone(),
        secret_key: opts.s3_secret_key.clone(),
        session_token: opts.s3_session_token.clone(),
        path_style: !opts.s3_path_style_disabled,
    };
    if cfg.bucket.is_empty() {
        return Ok(cfg);
    }
    cfg.enabled = true;
    if cfg.access_key.is_empty() || cfg.secret_key.is_empty() {
        return Err(Error::S3EmptyCreds);
    }
    Ok(cfg)
}

#[derive(Debug, Default, Deserialize)]
struct AnsibleConfig {
    #[serde(default)]
    defaults: AnsibleDefaults,
    #[serde(default)]
    galaxy: AnsibleGalaxy,
}

#[derive(Debug, Default, Deserialize)]
struct AnsibleDefaults {
    #[serde(default)]
    collections_path: String,
}

#[derive(Debug, Default, Deserialize)]
struct AnsibleGalaxy {
    #[serde(default)]
    cache_dir: String,
    #[serde(default)]
    server: String,
}

fn load_ansible_config(path: &Path) -> Result<(AnsibleConfig, Option<PathBuf>)> {
    if path.as_os_str().is_empty() || !path.exists() {
        return Ok((AnsibleConfig::default(), None));
    }
    let data = fs::read_to_string(path)?;
    let config: AnsibleConfig =
        toml::from_str(&data).map_err(|err| Error::AnsibleConfig(err.to_string()))?;
    Ok((config, Some(path.to_path_buf())))
}

/// Returns the default cache directory under the user's home.
pub fn default_cache_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/root"))
        .join(".cache/gx")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn base_options() -> CliOptions {
        CliOptions {
            requirements_file: DEFAULT_REQUIREMENTS_FILE.into(),
            download_path: DEFAULT_COLLECTIONS_PATH.into(),
            server: DEFAULT_SERVER.into(),
            cache_dir: "/tmp/gx-cache".into(),
            ansible_config: "does-not-exist.cfg".into(),
            timeout_secs: 30,
            workers: 4,
            ..CliOptions::default()
        }
    }

    #[test]
    fn ansible_cfg_overrides_paths_and_server() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[defaults]\ncollections_path = \"/srv/collections\"\n\n[galaxy]\ncache_dir = \"/srv/cache\"\nserver = \"https://hub.example.com\"\n"
        )
        .unwrap();

        let mut opts = base_options();
        opts.ansible_config = file.path().display().to_string();
        let cfg = build_config(&opts).unwrap();

        assert_eq!(cfg.download_path, PathBuf::from("/srv/collections"));
        assert_eq!(cfg.cache_dir, PathBuf::from("/srv/cache"));
        assert_eq!(cfg.server, "https://hub.example.com");
        assert!(cfg.ansible_collections_path_used);
        assert!(cfg.ansible_cache_dir_used);
        assert!(cfg.ansible_server_used);
    }

    #[test]
    fn missing_ansible_cfg_uses_cli_values() {
        let cfg = build_config(&base_options()).unwrap();
        assert_eq!(cfg.server, DEFAULT_SERVER);
        assert!(cfg.ansible_config_path.is_none());
        assert!(!cfg.ansible_server_used);
    }

    #[test]
    fn timeout_only_raises() {
        let mut opts = base_options();
        opts.timeout_secs = 5;
        let cfg = build_config(&opts).unwrap();
        assert_eq!(cfg.timeout, DEFAULT_TIMEOUT);

        opts.timeout_secs = 120;
        let cfg = build_config(&opts).unwrap();
        assert_eq!(cfg.timeout, Duration::from_secs(120));
    }

    #[test]
    fn s3_requires_credentials() {
        let mut opts = base_options();
        opts.s3_bucket = "bucket".into();
        assert!(matches!(build_config(&opts), Err(Error::S3EmptyCreds)));

        opts.s3_access_key = "ak".into();
        opts.s3_secret_key = "sk".into();
        let cfg = build_config(&opts).unwrap();
        assert!(cfg.s3.enabled);
        assert!(cfg.s3.path_style);

        opts.s3_path_style_disabled = true;
        let cfg = build_config(&opts).unwrap();
        assert!(!cfg.s3.path_style);
    }
}
