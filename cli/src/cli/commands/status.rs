use std::path::PathBuf;
use std::time::Duration;

use modelgate_core::account::load_accounts_from_dir;
use modelgate_core::config::{expand_path, read_config, resolve_config_path, AppConfig};
use modelgate_core::proxy::config::key_fingerprint;

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = resolve_config_path(config_path);
    let config = if path.exists() {
        read_config(&path)?
    } else {
        AppConfig::default()
    };
    let accounts_dir = expand_path(&config.accounts.directory);

    println!("Modelgate Status");
    println!("================");
    println!();
    println!("Configuration:");
    println!("  Config file: {:?}", path);
    println!("  Accounts dir: {:?}", accounts_dir);
    println!();
    println!("Gateway settings:");
    println!("  Base URL: {}", config.proxy.base_url());
    println!("  API key: {}", key_fingerprint(&config.proxy.api_key));
    println!("  Request timeout: {}s", config.proxy.request_timeout);
    println!("  Selection: {:?}", config.selection.policy);
    println!();

    let usable = load_accounts_from_dir(&accounts_dir)
        .map(|accounts| accounts.len())
        .unwrap_or(0);
    println!("Accounts:");
    println!("  Usable: {}", usable);

    // Loopback reaches the listener whether it binds 127.0.0.1 or 0.0.0.0.
    println!();
    let url = format!("http://127.0.0.1:{}/healthz", config.proxy.port);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()?;
    match client.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => {
            println!("Gateway: RUNNING");
        }
        _ => {
            println!("Gateway: NOT RUNNING");
        }
    }

    Ok(())
}
