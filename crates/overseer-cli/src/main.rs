mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{Session, EXIT_CONFLICT, EXIT_FAILURE, EXIT_STORE_ERROR};
use overseer_core::EngineConfig;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "overseer",
    version,
    about = "Crash-recoverable change and task orchestration engine"
)]
struct Cli {
    /// State directory (overrides the configuration file).
    #[arg(long, global = true)]
    root: Option<String>,

    /// Engine configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List changes that are still in progress.
    Changes {
        /// Include ready changes.
        #[arg(long, default_value_t = false)]
        all: bool,
    },
    /// Show the tasks of a change.
    Tasks {
        /// Change ID.
        change: String,
        /// Print each task's log.
        #[arg(long, default_value_t = false)]
        log: bool,
    },
    /// Abort a change; done tasks are undone.
    Abort {
        /// Change ID.
        change: String,
    },
    /// Install a snap revision, or refresh to it if the snap is active.
    Install {
        snap: String,
        revision: String,
        /// Snap type: app, gadget, kernel, base, os or snapd.
        #[arg(long = "type", default_value = "app")]
        snap_type: String,
        /// Do not stop running apps when refreshing.
        #[arg(long, default_value_t = false)]
        ignore_running: bool,
    },
    /// Remove a snap.
    Remove { snap: String },
    /// Connect a plug to a slot, both given as <snap>:<name>.
    Connect { plug: String, slot: String },
    /// Disconnect a plug from a slot.
    Disconnect {
        plug: String,
        slot: String,
        /// Drop the connection record without running hooks.
        #[arg(long, default_value_t = false)]
        forget: bool,
    },
    /// Run pending changes until nothing moves any more.
    Settle {
        /// Give up after this many seconds.
        #[arg(long, default_value_t = 600)]
        timeout: u64,
    },
    /// Remove old ready changes now.
    Prune,
    /// List warnings recorded by the engine.
    Warnings,
    /// Report that a requested restart (daemon or system) happened.
    RestartDone { kind: String },
    /// Run the engine in the foreground until interrupted.
    Run,
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("OVERSEER_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let result = load_config(cli.config.as_deref(), cli.root.as_deref()).and_then(|config| {
        let session = Session {
            config,
            json: cli.json,
        };
        dispatch(&session, cli.command)
    });

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("conflict:") {
                EXIT_CONFLICT
            } else if msg.starts_with("store error:") || msg.starts_with("store lock:") {
                EXIT_STORE_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}

fn dispatch(session: &Session, command: Commands) -> Result<u8, String> {
    match command {
        Commands::Changes { all } => commands::changes::run(session, all),
        Commands::Tasks { change, log } => commands::tasks::run(session, &change, log),
        Commands::Abort { change } => commands::abort::run(session, &change),
        Commands::Install {
            snap,
            revision,
            snap_type,
            ignore_running,
        } => commands::install::run(session, &snap, &revision, &snap_type, ignore_running),
        Commands::Remove { snap } => commands::remove::run(session, &snap),
        Commands::Connect { plug, slot } => commands::connect::connect(session, &plug, &slot),
        Commands::Disconnect { plug, slot, forget } => {
            commands::connect::disconnect(session, &plug, &slot, forget)
        }
        Commands::Settle { timeout } => commands::settle::run(session, timeout),
        Commands::Prune => commands::prune::run(session),
        Commands::Warnings => commands::warnings::run(session),
        Commands::RestartDone { kind } => commands::restart_done::run(session, &kind),
        Commands::Run => commands::run::run(session),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    }
}

fn load_config(path: Option<&std::path::Path>, root: Option<&str>) -> Result<EngineConfig, String> {
    let mut config = match path {
        Some(path) => EngineConfig::load(path)
            .map_err(|e| format!("cannot load config {}: {e}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(root) = root {
        config.root = expand_tilde(root);
    }
    Ok(config)
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
