pub mod generate_key;
pub mod mapping;
pub mod models;
pub mod start;
pub mod status;

use std::path::PathBuf;

use modelgate_core::config::resolve_config_path;
use modelgate_core::{ControlPlane, FileConfigStore};

/// Open the control plane over the resolved config file.
pub fn open_control_plane(config_path: Option<PathBuf>) -> anyhow::Result<ControlPlane> {
    let path = resolve_config_path(config_path);
    let plane = ControlPlane::open(Box::new(FileConfigStore::new(path)))?;
    Ok(plane)
}
