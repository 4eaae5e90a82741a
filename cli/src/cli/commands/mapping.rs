use anyhow::anyhow;
use std::path::PathBuf;

use modelgate_core::catalog::Protocol;
use modelgate_core::proxy::{MappingPatch, MappingTable, ModelResolver};

use super::open_control_plane;
use crate::cli::MappingCommands;

pub async fn run(config_path: Option<PathBuf>, command: MappingCommands) -> anyhow::Result<()> {
    let plane = open_control_plane(config_path)?;

    let tables = match command {
        MappingCommands::Show => plane.model_mapping().await,
        MappingCommands::Set { table, key, target } => {
            let patch = MappingPatch::default().set(parse_table(&table)?, &key, &target);
            plane.update_model_mapping(&patch).await?
        }
        MappingCommands::Remove { table, key } => {
            let patch = MappingPatch::default().remove(parse_table(&table)?, &key);
            plane.update_model_mapping(&patch).await?
        }
        MappingCommands::Reset => plane.reset_model_mapping().await?,
    };

    println!("{}", serde_json::to_string_pretty(&tables)?);
    Ok(())
}

/// `resolve <protocol> <model>` against the saved tables.
pub async fn resolve(config_path: Option<PathBuf>, protocol: &str, model: &str) -> anyhow::Result<()> {
    let protocol: Protocol = protocol.parse().map_err(|e: String| anyhow!(e))?;
    let plane = open_control_plane(config_path)?;
    let tables = plane.model_mapping().await;

    let resolution = ModelResolver::standard().resolve(protocol, &tables, model)?;
    println!("{}", serde_json::to_string_pretty(&resolution)?);
    Ok(())
}

fn parse_table(name: &str) -> anyhow::Result<MappingTable> {
    name.parse().map_err(|e: String| anyhow!(e))
}
