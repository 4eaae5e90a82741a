pub mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "modelgate")]
#[command(author, version, about = "Local LLM gateway - serve OpenAI, Anthropic and Gemini clients from one account pool")]
pub struct Cli {
    /// Path to config file (checked in order: local config.toml, ~/.config/modelgate/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the gateway and run until Ctrl+C
    Start {
        /// Port to listen on (overrides config for this run)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show gateway status
    Status,

    /// Generate a new API key and save it
    GenerateKey,

    /// List catalog models
    Models {
        /// Only models served over this protocol (openai, anthropic, gemini)
        #[arg(short, long)]
        protocol: Option<String>,
    },

    /// Show which upstream model a request would use
    Resolve {
        /// Client protocol (openai, anthropic, gemini)
        protocol: String,
        /// Requested model id
        model: String,
    },

    /// Inspect or edit the model mapping tables
    Mapping {
        #[command(subcommand)]
        command: MappingCommands,
    },
}

#[derive(Subcommand)]
pub enum MappingCommands {
    /// Print all three tables
    Show,

    /// Set one entry
    Set {
        /// Table: anthropic, openai or custom
        table: String,
        /// Group key or exact model id
        key: String,
        /// Upstream model id (empty means group default)
        target: String,
    },

    /// Remove one entry
    Remove {
        /// Table: anthropic, openai or custom
        table: String,
        key: String,
    },

    /// Clear every table
    Reset,
}
