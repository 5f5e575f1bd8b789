mod bridge;
mod config;
mod error;
mod fsio;
mod mailbox;
mod prompt;
mod provider;
mod sanitize;
mod signals;
mod subprocess;
mod tasks;
mod telemetry;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use bridge::BridgeDaemon;
use config::BridgeConfig;

#[derive(Debug, Parser)]
#[command(
    name = "omc-bridge",
    version,
    about = "Worker daemon bridging team task queues to codex/gemini CLIs"
)]
struct Cli {
    /// Path to the worker config document.
    #[arg(long)]
    config: PathBuf,
}

fn main() -> ExitCode {
    let _telemetry = telemetry::init();

    let cli = Cli::parse();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(bridge_err) = e.downcast_ref::<error::BridgeError>() {
                eprintln!("error: {bridge_err}");
                bridge_err.exit_code()
            } else {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let config = BridgeConfig::load(&cli.config)?;
    let state_root = config::state_root()?;
    let mut daemon = BridgeDaemon::new(config, &state_root)?;
    bridge::register_interrupt_handler(daemon.layout().signal_path.clone());
    daemon.run()
}
