use std::path::PathBuf;

use super::open_control_plane;

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let plane = open_control_plane(config_path)?;
    let key = plane.generate_api_key().await?;
    println!("{}", key);
    Ok(())
}
