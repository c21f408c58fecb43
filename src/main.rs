//! Mount a bounded local cache and an intermittent external store as one filesystem.
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{debug, error};

mod app_config;
mod daemon;
mod query;
mod trc;

use crate::app_config::Config;
use crate::trc::Trc;

#[derive(Parser)]
#[command(
    version,
    about = "A union filesystem over a local cache and an external store."
)]
struct Args {
    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to a tierfs config TOML."
    )]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Mount every configured sync pair.
    Run {
        /// Run the daemon in the background.
        #[arg(short, long, help = "Run the daemon in the background.")]
        daemonize: bool,
    },

    /// Print a pair's totals, or the index row of one path.
    Status {
        pair: String,
        path: Option<String>,
    },

    /// List conflict backups recorded for a pair.
    Conflicts {
        pair: String,
        /// Include conflicts already marked resolved.
        #[arg(long)]
        all: bool,
    },

    /// List the files eviction would remove first.
    Candidates {
        pair: String,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

fn init_tracing(trc: Trc) {
    trc.init().unwrap_or_else(|e| {
        eprintln!(
            "Failed to initialize logging. Without logging, we can't provide any useful error \
             messages, so we have to exit: {e}"
        );
        std::process::exit(1);
    });
}

fn run_daemonized(config: Config) {
    // Safe: Config.validate() guarantees pid_file's parent exists.
    let pid_file_parent = config
        .daemon
        .pid_file
        .parent()
        .unwrap_or_else(|| unreachable!("Config.validate() ensures pid_file has a parent"));
    if let Err(e) = std::fs::create_dir_all(pid_file_parent) {
        eprintln!("Failed to create PID file directory: {e}");
        std::process::exit(1);
    }

    let log_file = match config.daemon.log.open_log_file() {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Failed to open log file: {e}");
            std::process::exit(1);
        }
    };

    let mut daemonize = daemonize::Daemonize::new()
        .pid_file(&config.daemon.pid_file)
        .chown_pid_file(true)
        .user(config.uid)
        .group(config.gid);

    if let Some(file) = log_file {
        match file.try_clone() {
            Ok(clone) => {
                daemonize = daemonize.stdout(file).stderr(clone);
            }
            Err(e) => {
                eprintln!("Failed to clone log file handle: {e}");
                std::process::exit(1);
            }
        }
    }

    match daemonize.start() {
        Ok(()) => {
            init_tracing(Trc::daemon());
            debug!(config = ?config, "Initializing daemon with configuration...");
            if let Err(e) = daemon::spawn(config) {
                error!("Daemon failed: {e}");
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("Failed to spawn the daemon: {e}");
            std::process::exit(1);
        }
    }
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();

    // Errors use eprintln since tracing isn't initialized yet.
    let config = Config::load_or_create(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });
    if let Err(error_messages) = config.validate() {
        eprintln!("Configuration is invalid.");
        for msg in &error_messages {
            eprintln!(" - {msg}");
        }
        std::process::exit(1);
    }

    let command = args.command.unwrap_or(Command::Run { daemonize: false });
    if let Command::Run { daemonize: true } = command {
        // Logging starts after the fork, once stdio points at the log file.
        run_daemonized(config);
        return;
    }

    init_tracing(Trc::default());
    let result = match command {
        Command::Run { .. } => daemon::spawn(config).map_err(|e| e.to_string()),
        Command::Status { pair, path } => {
            query::status(&config, &pair, path.as_deref()).map_err(|e| e.to_string())
        }
        Command::Conflicts { pair, all } => {
            query::conflicts(&config, &pair, all).map_err(|e| e.to_string())
        }
        Command::Candidates { pair, limit } => {
            query::candidates(&config, &pair, limit).map_err(|e| e.to_string())
        }
    };
    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}
