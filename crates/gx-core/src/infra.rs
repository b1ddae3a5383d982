//! Runtime dependency bundle.
//!
//! Carries the HTTP client, the output sink, and the time/tempdir functions
//! so tests can inject deterministic versions.

use std::path::PathBuf;
use std::sync::Arc;

use reqwest::blocking::Client;
use time::OffsetDateTime;

use crate::config::Config;
use crate::progress::Printer;

#[derive(Clone)]
pub struct Infra {
    pub printer: Arc<dyn Printer>,
    pub http: Client,
    pub now: fn() -> OffsetDateTime,
    pub temp_dir: fn() -> PathBuf,
}

impl Infra {
    pub fn new(printer: Arc<dyn Printer>, http: Client) -> Self {
        Self {
            printer,
            http,
            now: OffsetDateTime::now_utc,
            temp_dir: std::env::temp_dir,
        }
    }

    /// Logs which settings were sourced from ansible.cfg.
    pub fn debug_ansible_config(&self, cfg: &Config) {
        let Some(path) = &cfg.ansible_config_path else {
            return;
        };
        if cfg.ansible_collections_path_used {
            tracing::debug!(
                "ansible.cfg {}: defaults.collections_path={}",
                path.display(),
                cfg.download_path.display()
            );
        }
        if cfg.ansible_cache_dir_used {
            tracing::debug!(
                "ansible.cfg {}: galaxy.cache_dir={}",
                path.display(),
                cfg.cache_dir.display()
            );
        }
        if cfg.ansible_server_used {
            tracing::debug!("ansible.cfg {}: galaxy.server={}", path.display(), cfg.server);
        }
    }
}
