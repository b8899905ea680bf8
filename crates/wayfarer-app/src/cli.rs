use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "wayfarer", about = "Wayfarer: a travel assistant that speaks your language")]
pub struct Cli {
    /// Path to config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Interactive conversation (type /help inside for commands)
    Chat {
        #[arg(long)]
        conversation: String,
    },

    /// Send a single utterance and print the reply
    Say {
        #[arg(long)]
        conversation: String,
        #[arg(long)]
        text: String,
    },

    /// Show a conversation's utterances in order
    History {
        #[arg(long)]
        conversation: String,
        /// Print the conversation as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// List all conversations
    List,

    /// Identify the language of a text
    Detect {
        #[arg(long)]
        text: String,
    },

    /// Translate a text with the on-device models
    Translate {
        #[arg(long)]
        text: String,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
    },

    /// Push local changes and pull remote ones
    Sync {
        /// Only this conversation (default: every conversation with pending changes)
        #[arg(long)]
        conversation: Option<String>,
    },

    /// Delete an utterance (propagated to the remote store on next sync)
    DeleteUtterance {
        #[arg(long)]
        conversation: String,
        #[arg(long)]
        id: String,
    },
}
