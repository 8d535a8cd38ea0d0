use std::{path::PathBuf, process::ExitCode, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scstadmin::admin::{ScstAdmin, Settings};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Configure SCST from a declarative configuration file.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// SCST control-plane root
    #[arg(long, global = true, env = "SCSTADMIN_ROOT", default_value = "/sys/kernel/scst_tgt")]
    root: PathBuf,

    /// Don't load missing kernel modules
    #[arg(long, global = true)]
    no_modules: bool,

    /// Seconds to wait for an asynchronous management command
    #[arg(long, global = true, env = "SCSTADMIN_MGMT_TIMEOUT", default_value_t = 60)]
    mgmt_timeout: u64,

    /// Seconds to wait for sessions to close when removing a target
    #[arg(long, global = true, env = "SCSTADMIN_SESSION_TIMEOUT", default_value_t = 300)]
    session_timeout: u64,

    /// Log filter, such as `info` or `scstadmin=debug`
    #[arg(long, global = true, env = "SCSTADMIN_LOG", default_value = "info")]
    log_level: String,

    /// Log as JSON
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Converge the running system on a configuration file
    Apply {
        file: PathBuf,

        /// Suspend I/O with this value while applying
        #[arg(long, value_parser = clap::value_parser!(i64).range(1..))]
        suspend: Option<i64>,
    },

    /// Check a configuration file without touching the system
    Check { file: PathBuf },

    /// Remove every device, target and group
    Clear,

    /// Print the running configuration
    Dump,
}

fn init_logging(args: &Args) {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

fn settings(args: &Args) -> Settings {
    Settings {
        root: args.root.clone(),
        mgmt_timeout: Duration::from_secs(args.mgmt_timeout),
        session_timeout: Duration::from_secs(args.session_timeout),
        load_modules: !args.no_modules,
        suspend: match args.command {
            Command::Apply { suspend, .. } => suspend,
            _ => None,
        },
        ..Settings::default()
    }
}

fn run(args: &Args) -> Result<ExitCode> {
    match &args.command {
        Command::Check { file } => {
            return Ok(if ScstAdmin::check_file(file) {
                println!("{} is valid", file.display());
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            });
        }
        Command::Apply { file, .. } => {
            let admin = ScstAdmin::new(settings(args));
            admin
                .apply_file(file)
                .with_context(|| format!("Couldn't apply {}", file.display()))?;
        }
        Command::Clear => {
            let admin = ScstAdmin::new(settings(args));
            admin.clear().context("Couldn't clear configuration")?;
        }
        Command::Dump => {
            let admin = ScstAdmin::new(settings(args));
            let config = admin
                .read_configuration()
                .context("Couldn't read configuration")?;
            print!("{config}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(&args);
    run(&args)
}
