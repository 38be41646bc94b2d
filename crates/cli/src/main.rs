// Inkshelf CLI
//
// Design Decision: Use clap derive for ergonomic argument parsing.
// Design Decision: Support text/json output formats for scripting.
// Design Decision: Drive the transfer pool with in-memory collaborators so the
// pool can be exercised without remote accounts.

mod commands;
mod output;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "inkshelf")]
#[command(about = "Inkshelf CLI - Exercise the chapter transfer pool")]
#[command(version)]
pub struct Cli {
    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json"])]
    pub output: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Back up synthetic chapters, download them again and verify the result
    Simulate(commands::simulate::SimulateArgs),

    /// Show resolved pool settings
    Settings(commands::settings::PoolArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Missing .env is fine
    dotenvy::dotenv().ok();

    // Configure via RUST_LOG (default: "inkshelf=info")
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("inkshelf=info,inkshelf_taskpool=info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let output_format = output::OutputFormat::from_str(&cli.output);

    match cli.command {
        Commands::Simulate(args) => {
            tokio::select! {
                result = commands::simulate::run(args, output_format) => result,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received shutdown signal");
                    Ok(())
                }
            }
        }
        Commands::Settings(args) => commands::settings::run(&args, output_format),
    }
}
