use clap::{Args, Parser, Subcommand};

use gx_core::default_cache_dir;

pub const DEFAULT_SERVER: &str = "https://galaxy.ansible.com";

#[derive(Parser, Debug)]
#[command(
    name = "gx",
    version,
    about = "Galaxy Collection Manager for CI",
    disable_help_subcommand = true
)]
pub struct GxCli {
    #[command(subcommand)]
    pub command: CommandCli,
}

#[derive(Subcommand, Debug)]
pub enum CommandCli {
    #[command(
        about = "Install collections from requirements file",
        visible_alias = "i"
    )]
    Install(InstallArgs),
    #[command(
        about = "Cleanup unused cached collections across all projects",
        visible_alias = "c"
    )]
    Cleanup(CleanupArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    #[arg(long, help = "Verbose output", env = "GX_VERBOSE")]
    pub verbose: bool,
    #[arg(
        short,
        long,
        help = "Quiet mode, not working with verbose",
        env = "GX_QUIET"
    )]
    pub quiet: bool,
    #[arg(long, help = "Enable dry-run mode")]
    pub dry_run: bool,
    #[arg(
        long,
        help = "Local cache directory",
        env = "GX_CACHE_DIR",
        default_value_t = default_cache_dir_value()
    )]
    pub cache_dir: String,
}

#[derive(Args, Debug, Clone)]
pub struct InstallArgs {
    #[command(flatten)]
    pub common: CommonArgs,
    #[arg(
        long,
        help = "Galaxy server URL",
        env = "GX_SERVER",
        default_value_t = default_server_value()
    )]
    pub server: String,
    #[arg(
        long,
        help = "HTTP timeout in seconds",
        env = "GX_SERVER_TIMEOUT",
        default_value_t = 30
    )]
    pub timeout: u64,
    #[arg(
        short = 'p',
        long,
        help = "Path to download collections to",
        env = "GX_COLLECTIONS_PATH",
        default_value_t = default_collections_path_value()
    )]
    pub download_path: String,
    #[arg(
        short = 'r',
        long,
        help = "Path to requirements.yml file",
        env = "GX_REQUIREMENTS_FILE",
        default_value_t = default_requirements_file_value()
    )]
    pub requirements_file: String,
    #[arg(
        long,
        help = "Path to ansible.cfg file",
        env = "GX_ANSIBLE_CONFIG",
        default_value_t = default_ansible_config_value()
    )]
    pub ansible_config: String,
    #[arg(
        long,
        help = "Number of concurrent workers",
        env = "GX_WORKERS",
        default_value_t = default_workers_value()
    )]
    pub workers: usize,
    #[arg(long, help = "Disable local caching", env = "GX_NO_CACHE")]
    pub no_cache: bool,
    #[arg(
        long,
        help = "Refresh all collections, ignoring cache",
        env = "GX_REFRESH"
    )]
    pub refresh: bool,
    #[arg(
        long,
        help = "Clear local cache before installing",
        env = "GX_CLEAR_CACHE"
    )]
    pub clear_cache: bool,
    #[arg(long, help = "Do not install dependencies", env = "GX_NO_DEPS")]
    pub no_deps: bool,
    #[command(flatten)]
    pub s3: S3Args,
}

#[derive(Args, Debug, Clone)]
pub struct CleanupArgs {
    #[command(flatten)]
    pub common: CommonArgs,
    #[command(flatten)]
    pub s3: S3Args,
}

#[derive(Args, Debug, Clone)]
pub struct S3Args {
    #[arg(
        long,
        help = "S3 bucket name for caching, if defined enables S3 caching instead of local cache-dir",
        env = "GX_S3_BUCKET",
        default_value = ""
    )]
    pub s3_bucket: String,
    #[arg(
        long,
        help = "S3 region for caching",
        env = "GX_S3_REGION",
        default_value = ""
    )]
    pub s3_region: String,
    #[arg(
        long,
        help = "S3 prefix for caching",
        env = "GX_S3_PREFIX",
        default_value = ""
    )]
    pub s3_prefix: String,
    #[arg(
        long,
        help = "S3 access key for caching",
        env = "GX_S3_ACCESS_KEY",
        default_value_t = env_fallback("AWS_ACCESS_KEY_ID")
    )]
    pub s3_access_key: String,
    #[arg(
        long,
        help = "S3 secret key for caching",
        env = "GX_S3_SECRET_KEY",
        default_value_t = env_fallback("AWS_SECRET_ACCESS_KEY")
    )]
    pub s3_secret_key: String,
    #[arg(
        long,
        help = "S3 endpoint for caching",
        env = "GX_S3_ENDPOINT",
        default_value = ""
    )]
    pub s3_endpoint: String,
    #[arg(
        long,
        help = "S3 session token for caching",
        env = "GX_S3_SESSION_TOKEN",
        default_value_t = env_fallback("AWS_SESSION_TOKEN")
    )]
    pub s3_session_token: String,
    #[arg(
        long,
        help = "Disable path style addressing for S3",
        env = "GX_S3_PATH_STYLE_DISABLED"
    )]
    pub s3_path_style_disabled: bool,
}

fn default_cache_dir_value() -> String {
    std::env::var("ANSIBLE_GALAXY_CACHE_DIR")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default_cache_dir().display().to_string())
}

fn default_server_value() -> String {
    std::env::var("ANSIBLE_GALAXY_SERVER")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_SERVER.to_string())
}

fn default_collections_path_value() -> String {
    std::env::var("ANSIBLE_COLLECTIONS_PATH")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| ".collections".to_string())
}

fn default_requirements_file_value() -> String {
    std::env::var("ANSIBLE_GALAXY_REQUIREMENTS_FILE")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "requirements.yml".to_string())
}

fn default_ansible_config_value() -> String {
    std::env::var("ANSIBLE_CONFIG")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "ansible.cfg".to_string())
}

fn default_workers_value() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

fn env_fallback(name: &str) -> String {
    std::env::var(name).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_declaration_is_consistent() {
        GxCli::command().debug_assert();
    }

    #[test]
    fn parses_install_flags() {
        let cli = GxCli::try_parse_from([
            "gx",
            "install",
            "-r",
            "reqs.yml",
            "-p",
            "collections",
            "--workers",
            "3",
            "--refresh",
        ])
        .unwrap();
        match cli.command {
            CommandCli::Install(args) => {
                assert_eq!(args.requirements_file, "reqs.yml");
                assert_eq!(args.download_path, "collections");
                assert_eq!(args.workers, 3);
                assert!(args.refresh);
                assert!(!args.no_cache);
            }
            other => panic!("expected install, got {other:?}"),
        }
    }

    #[test]
    fn parses_command_aliases() {
        let cli = GxCli::try_parse_from(["gx", "i"]).unwrap();
        assert!(matches!(cli.command, CommandCli::Install(_)));
        let cli = GxCli::try_parse_from(["gx", "c", "--dry-run"]).unwrap();
        match cli.command {
            CommandCli::Cleanup(args) => assert!(args.common.dry_run),
            other => panic!("expected cleanup, got {other:?}"),
        }
    }
}
