use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{
    ConfigCommand, DelCellArgs, DelValueArgs, LocalReplica, SetCellArgs, SetValueArgs, ShowArgs, SyncCommand,
};
use tabsync::config::Config;

#[derive(Parser)]
#[command(name = "tabsync")]
#[command(version)]
#[command(about = "A replicated table store that syncs through a relay", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Topic (shared dataset) to work on
    #[arg(long, short, global = true, default_value = "default")]
    topic: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Set a cell in a table row
    SetCell(SetCellArgs),

    /// Delete a cell from a table row
    DelCell(DelCellArgs),

    /// Set a keyed value
    SetValue(SetValueArgs),

    /// Delete a keyed value
    DelValue(DelValueArgs),

    /// Show the local replica's content
    Show(ShowArgs),

    /// Sync the local replica with the relay
    Sync(SyncCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tabsync_core=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config)?;

    let Some(command) = cli.command else {
        println!("Use --help to see available commands");
        return Ok(());
    };
    if let Commands::Config(cmd) = &command {
        return cmd.run(&config);
    }

    let replica = LocalReplica::open(&config, &cli.topic).await?;
    match command {
        Commands::SetCell(args) => args.run(&replica).await?,
        Commands::DelCell(args) => args.run(&replica).await?,
        Commands::SetValue(args) => args.run(&replica).await?,
        Commands::DelValue(args) => args.run(&replica).await?,
        Commands::Show(args) => args.run(&replica)?,
        Commands::Sync(cmd) => cmd.run(&replica, &config, &cli.topic).await?,
        Commands::Config(_) => {}
    }

    Ok(())
}
