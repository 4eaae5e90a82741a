//! Account records
//!
//! Accounts are provisioned elsewhere and dropped into a directory as one
//! JSON file each. The gateway only reads them.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenData {
    pub access_token: String,
    #[serde(default)]
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub id: String,
    pub email: String,
    pub token: TokenData,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub proxy_disabled: bool,
}

impl Account {
    pub fn new(id: &str, email: &str, access_token: &str) -> Self {
        Self {
            id: id.to_string(),
            email: email.to_string(),
            token: TokenData {
                access_token: access_token.to_string(),
                project_id: None,
            },
            disabled: false,
            proxy_disabled: false,
        }
    }

    pub fn with_project(mut self, project_id: &str) -> Self {
        self.token.project_id = Some(project_id.to_string());
        self
    }

    /// Whether the record may serve gateway traffic at all.
    pub fn is_usable(&self) -> bool {
        !self.disabled && !self.proxy_disabled && !self.token.access_token.is_empty()
    }
}

/// Load every usable account under `dir`. Unreadable files are skipped.
pub fn load_accounts_from_dir(dir: &Path) -> anyhow::Result<Vec<Account>> {
    if !dir.exists() {
        anyhow::bail!("Accounts directory not found: {:?}", dir);
    }

    let mut accounts = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }

        match load_account_from_path(&path) {
            Ok(account) if account.is_usable() => accounts.push(account),
            Ok(account) => {
                tracing::debug!("Skipping disabled account {}", account.email);
            }
            Err(e) => {
                tracing::debug!("Failed to load account {:?}: {}", path, e);
            }
        }
    }

    // Stable order so round-robin is predictable across reloads.
    accounts.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(accounts)
}

fn load_account_from_path(path: &Path) -> anyhow::Result<Account> {
    let content = fs::read_to_string(path)?;
    let account: Account = serde_json::from_str(&content)?;
    Ok(account)
}
