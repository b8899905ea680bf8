mod cli;
mod commands;
mod setup;

use anyhow::Result;
use clap::Parser;
use wayfarer_core::config::AppConfig;
use wayfarer_core::lifecycle;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    lifecycle::init_tracing();

    let cli = Cli::parse();
    let config = AppConfig::load_or_default(cli.config.as_deref());

    lifecycle::log_startup();

    match cli.command {
        Commands::Chat { conversation } => commands::chat(&config, conversation).await?,
        Commands::Say { conversation, text } => commands::say(&config, conversation, text).await?,
        Commands::History { conversation, json } => {
            commands::history(&config, conversation, json).await?
        }
        Commands::List => commands::list(&config).await?,
        Commands::Detect { text } => commands::detect(&config, text)?,
        Commands::Translate { text, from, to } => {
            commands::translate(&config, text, from, to).await?
        }
        Commands::Sync { conversation } => commands::sync(&config, conversation).await?,
        Commands::DeleteUtterance { conversation, id } => {
            commands::delete_utterance(&config, conversation, id).await?
        }
    }

    lifecycle::log_shutdown();
    Ok(())
}
