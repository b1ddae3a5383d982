#![deny(clippy::all)]

use std::env;
use std::ffi::OsString;

use clap::Parser;

mod cli;
mod dispatch;

use cli::{CommandCli, GxCli};
use dispatch::dispatch_command;

fn main() {
    if color_eyre::install().is_err() {
        tracing::debug!("color_eyre was already installed");
    }

    let raw_args: Vec<_> = env::args_os().collect();
    let cli = GxCli::parse_from(normalize_default_command(raw_args));

    let verbose = match &cli.command {
        CommandCli::Install(args) => args.common.verbose,
        CommandCli::Cleanup(args) => args.common.verbose,
    };
    init_tracing(verbose);

    let code = dispatch_command(&cli.command);
    if code != 0 {
        std::process::exit(code);
    }
}

/// Inserts the default `install` command when the first positional argument
/// is not a known command.
fn normalize_default_command(args: Vec<OsString>) -> Vec<OsString> {
    const COMMANDS: &[&str] = &["install", "i", "cleanup", "c", "help"];
    const BARE_FLAGS: &[&str] = &["--help", "-h", "--version", "-V"];

    let first = args.iter().skip(1).find(|arg| {
        let text = arg.to_string_lossy();
        !text.starts_with('-')
    });
    if let Some(first) = first {
        if COMMANDS.contains(&first.to_string_lossy().as_ref()) {
            return args;
        }
    }
    if args
        .iter()
        .skip(1)
        .any(|arg| BARE_FLAGS.contains(&arg.to_string_lossy().as_ref()))
    {
        return args;
    }

    let mut normalized = Vec::with_capacity(args.len() + 1);
    let mut iter = args.into_iter();
    if let Some(program) = iter.next() {
        normalized.push(program);
    }
    normalized.push(OsString::from("install"));
    normalized.extend(iter);
    normalized
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        "gx=debug,gx_cli=debug,gx_core=debug,gx_store=debug"
    } else {
        "warn"
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
