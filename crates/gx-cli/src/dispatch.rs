use std::sync::Arc;

use gx_core::{
    build_config, new_client, run_cleanup, run_install, CliOptions, Config, Infra, PlainPrinter,
    Printer, QuietPrinter, SpinnerPrinter,
};

use crate::cli::{CleanupArgs, CommandCli, InstallArgs, S3Args};

/// Runs the selected command and returns the process exit code.
pub fn dispatch_command(command: &CommandCli) -> i32 {
    match command {
        CommandCli::Install(args) => run_with_config(install_options(args), |cfg, infra| {
            run_install(&Arc::new(cfg.clone()), infra)
        }),
        CommandCli::Cleanup(args) => {
            run_with_config(cleanup_options(args), |cfg, infra| run_cleanup(cfg, infra))
        }
    }
}

fn run_with_config(
    opts: CliOptions,
    run: impl FnOnce(&Config, &Infra) -> gx_core::Result<()>,
) -> i32 {
    let quiet = opts.quiet;
    let cfg = match build_config(&opts) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("Error: {err}");
            return 1;
        }
    };
    let client = match new_client(cfg.timeout) {
        Ok(client) => client,
        Err(err) => {
            eprintln!("Error: {err}");
            return 1;
        }
    };

    let printer: Arc<dyn Printer> = if cfg.quiet {
        Arc::new(QuietPrinter)
    } else if cfg.verbose {
        Arc::new(PlainPrinter)
    } else {
        Arc::new(SpinnerPrinter::new())
    };
    let infra = Infra::new(printer.clone(), client);
    infra.debug_ansible_config(&cfg);

    let result = run(&cfg, &infra);
    printer.close();
    match result {
        Ok(()) => 0,
        Err(err) => {
            // The engines print errors through the progress sink, which the
            // quiet printer swallows; surface the failure on stderr there.
            if quiet {
                eprintln!("Error: {err}");
            }
            1
        }
    }
}

fn install_options(args: &InstallArgs) -> CliOptions {
    let mut opts = common_s3_options(&args.s3);
    opts.verbose = args.common.verbose;
    opts.quiet = args.common.quiet;
    opts.dry_run = args.common.dry_run;
    opts.cache_dir = args.common.cache_dir.clone();
    opts.requirements_file = args.requirements_file.clone();
    opts.download_path = args.download_path.clone();
    opts.server = args.server.clone();
    opts.ansible_config = args.ansible_config.clone();
    opts.timeout_secs = args.timeout;
    opts.workers = args.workers;
    opts.no_cache = args.no_cache;
    opts.refresh = args.refresh;
    opts.clear_cache = args.clear_cache;
    opts.no_deps = args.no_deps;
    opts
}

fn cleanup_options(args: &CleanupArgs) -> CliOptions {
    let mut opts = common_s3_options(&args.s3);
    opts.verbose = args.common.verbose;
    opts.quiet = args.common.quiet;
    opts.dry_run = args.common.dry_run;
    opts.cache_dir = args.common.cache_dir.clone();
    opts.requirements_file = "requirements.yml".to_string();
    opts.download_path = ".collections".to_string();
    opts.server = crate::cli::DEFAULT_SERVER.to_string();
    opts.ansible_config = String::new();
    opts.timeout_secs = 30;
    opts
}

fn common_s3_options(s3: &S3Args) -> CliOptions {
    CliOptions {
        s3_bucket: s3.s3_bucket.clone(),
        s3_region: s3.s3_region.clone(),
        s3_prefix: s3.s3_prefix.clone(),
        s3_access_key: s3.s3_access_key.clone(),
        s3_secret_key: s3.s3_secret_key.clone(),
        s3_endpoint: s3.s3_endpoint.clone(),
        s3_session_token: s3.s3_session_token.clone(),
        s3_path_style_disabled: s3.s3_path_style_disabled,
        ..CliOptions::default()
    }
}
