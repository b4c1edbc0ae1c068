//! toolgate entry point.
//!
//! `toolgate` runs the agent-facing gateway on stdin/stdout.
//! `toolgate manager --runtime <key>` runs one tool-server manager; the
//! gateway starts these itself.

use anyhow::Context;
use clap::{Parser, Subcommand};

use toolgate::gateway::{run_gateway, GatewayConfig};
use toolgate::supervisor::{run_manager, ManagerSettings, DEFAULT_RUNTIME};

#[derive(Parser, Debug)]
#[command(name = "toolgate")]
#[command(about = "Local gateway that installs, supervises and proxies tool servers")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a tool-server manager speaking JSON-RPC on stdin/stdout
    Manager {
        /// Runtime key this manager serves
        #[arg(long, default_value = DEFAULT_RUNTIME)]
        runtime: String,

        /// Override the server config file
        #[arg(long)]
        config: Option<std::path::PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        None => {
            toolgate::init_tracing("gateway.log");
            let config = GatewayConfig::load().context("failed to load gateway config")?;
            run_gateway(config).await.context("gateway failed")?;
        }
        Some(Command::Manager { runtime, config }) => {
            toolgate::init_tracing(&format!("manager-{runtime}.log"));
            let mut settings = ManagerSettings::from_env(&runtime);
            if let Some(path) = config {
                settings.config_path = path;
            }
            run_manager(settings)
                .await
                .with_context(|| format!("manager for runtime '{runtime}' failed"))?;
        }
    }
    Ok(())
}
