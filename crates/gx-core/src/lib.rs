//! Core engine for gx: resolver, installer, cache backends, and cleanup.

pub mod api_cache;
pub mod cache;
pub mod cleanup;
pub mod collections;
pub mod config;
pub mod errors;
pub mod fetch;
pub mod infra;
pub mod progress;
pub mod requirements;
pub mod types;

pub use cleanup::run_cleanup;
pub use collections::start::run_install;
pub use config::{build_config, default_cache_dir, CliOptions, Config, S3CacheConfig};
pub use errors::{Error, Result};
pub use fetch::{new_client, DEFAULT_TIMEOUT};
pub use infra::Infra;
pub use progress::{MemoryPrinter, PlainPrinter, Printer, QuietPrinter, SpinnerPrinter};

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::Config;
    use crate::infra::Infra;
    use crate::progress::MemoryPrinter;

    pub(crate) fn test_config(server: &str) -> Config {
        Config {
            verbose: false,
            quiet: false,
            requirements_file: "requirements.yml".into(),
            cache_dir: "/tmp/gx-test-cache".into(),
            download_path: ".collections".into(),
            server: server.to_string(),
            s3: Default::default(),
            clear_cache: false,
            no_cache: false,
            refresh: false,
            no_deps: false,
            dry_run: false,
            timeout: Duration::from_secs(30),
            workers: 2,
            ansible_config_path: None,
            ansible_collections_path_used: false,
            ansible_cache_dir_used: false,
            ansible_server_used: false,
        }
    }

    pub(crate) fn test_infra() -> (Infra, Arc<MemoryPrinter>) {
        let printer = Arc::new(MemoryPrinter::new());
        let infra = Infra::new(
            printer.clone(),
            reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("test http client"),
        );
        (infra, printer)
    }
}
