//! rootbox - Entry Point
//!
//! Loads the configuration, resolves the invoking user and dispatches one
//! lifecycle operation on the build root. Exits non-zero on any failure,
//! including a failing command under `run`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::{bail, Result};
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

use rootbox::{HostUser, Root, RootConfig, RootState, SANDBOX_MARKER};

/// Build and enter isolated chroot build roots.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration document describing the build root
    #[arg(long, default_value = "rootbox.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Create the build root and install its packages
    Create {
        /// Target architecture passed to the bootstrap tool
        #[arg(long)]
        arch: Option<String>,

        /// Package mirror used during bootstrap
        #[arg(long)]
        mirror: Option<String>,
    },

    /// Run a command inside the build root
    Run {
        /// Run with root privileges inside the build root
        #[arg(long)]
        root: bool,

        /// Command line to execute
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Open an interactive shell inside the build root
    Shell,

    /// Re-run package update, install and clean for the current configuration
    Update,

    /// Remove the build root and its stamp
    Clean,

    /// Archive the build root for distribution
    Distribute,

    /// Download and extract a prebuilt build root
    Fetch,

    /// Print the build root's state (absent, ready or invalid)
    State,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if std::env::var_os(SANDBOX_MARKER).is_some() {
        bail!("refusing to manage build roots from inside one");
    }

    if !nix::unistd::geteuid().is_root() {
        bail!("this command must run as root (through sudo)");
    }

    let config = RootConfig::load(&args.config)?;
    let host_user = HostUser::from_env()?;
    let root = Root::new(config, host_user);

    match args.command {
        Cmd::Create { arch, mirror } => root.create(arch.as_deref(), mirror.as_deref())?,

        Cmd::Run {
            root: as_root,
            command,
        } => {
            if !root.run(&command.join(" "), as_root)? {
                bail!("command exited with failure");
            }
        }

        Cmd::Shell => {
            if !root.run("/bin/bash", false)? {
                bail!("shell exited with failure");
            }
        }

        Cmd::Update => root.update()?,

        Cmd::Clean => root.clean()?,

        Cmd::Distribute => {
            let archive = root.distribute()?;
            info!(archive = %archive.display(), "archive written");
        }

        Cmd::Fetch => root.fetch()?,

        Cmd::State => {
            let state = root.state();
            println!("{state}");
            if state == RootState::Absent {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
