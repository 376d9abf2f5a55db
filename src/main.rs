//! vigil - governance kernel operator tool
//!
//! Usage:
//!   vigil --ledger ./tape summary        → kernel status as JSON
//!   vigil --ledger ./tape read 42        → one tape cell
//!   vigil --ledger ./tape tail -n 20     → the last cells
//!   vigil --ledger ./tape replay         → state rebuilt from the tape
//!   vigil --ledger ./tape exec '<json>'  → run one instruction
//!   vigil dump-config                    → effective config as TOML

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vigil::commands;
use vigil::ledger::{LedgerConfig, TapeLedger};

#[derive(Parser)]
#[command(
    name = "vigil",
    about = "Deterministic governance kernel: violation pressure, convergence, tape ledger",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Tape directory (overrides [ledger].dir from the config)
    #[arg(long, global = true)]
    ledger: Option<PathBuf>,

    /// Kernel config file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Kernel status: latest VP, phase, tape and bus counters
    Summary,
    /// Print the cell at a tape position
    Read { position: u64 },
    /// Print the most recent cells
    Tail {
        #[arg(short, default_value_t = 10)]
        n: u64,
    },
    /// Rebuild envelopes and quarantine state from the tape
    Replay,
    /// Execute one instruction given in wire form
    Exec { instruction: String },
    /// Print the effective config as TOML
    DumpConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_tracing(cli.log_dir.as_deref());

    let config = commands::resolve_config(cli.config.as_deref(), cli.ledger.clone())?;

    let output = match cli.command {
        Commands::DumpConfig => {
            print!("{}", commands::dump_config(&config));
            return Ok(());
        }
        Commands::Replay => {
            let dir = commands::require_tape(&config, "replay")?;
            let ledger = TapeLedger::open(dir, LedgerConfig::from(&config.ledger))?;
            commands::replay(&ledger)?
        }
        Commands::Summary => with_kernel(config, commands::summary)?,
        Commands::Read { position } => with_kernel(config, |k| commands::read(k, position))?,
        Commands::Tail { n } => with_kernel(config, |k| commands::tail(k, n))?,
        Commands::Exec { instruction } => {
            commands::require_tape(&config, "exec")?;
            with_kernel(config, |k| commands::exec(k, &instruction))?
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Start a kernel, run one command against it, and shut it down.
fn with_kernel<F>(config: vigil::core::KernelConfig, command: F) -> anyhow::Result<serde_json::Value>
where
    F: FnOnce(&vigil::kernel::KernelContext) -> anyhow::Result<serde_json::Value>,
{
    let kernel = commands::open_kernel(config)?;
    let output = command(&kernel);
    kernel.shutdown();
    output
}

fn init_tracing(log_dir: Option<&std::path::Path>) -> Option<WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| commands::DEFAULT_LOG_FILTER.into());
    let stderr = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "vigil.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}
