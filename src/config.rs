use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::token_store;

/// Env var consulted when the config file carries no vault key.
pub const VAULT_KEY_ENV: &str = "MAILSYNC_VAULT_KEY";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Owner reference stamped on accounts connected from this install.
    pub owner: String,
    pub db_path: Option<String>,
    /// Base64 AES-256 key. Falls back to `MAILSYNC_VAULT_KEY`, then the keyring.
    pub vault_key: Option<String>,
    #[serde(default)]
    pub sync: SyncSettings,
    pub gmail: Option<OAuthAppConfig>,
    pub graph: Option<OAuthAppConfig>,
    pub imap: Option<ImapSettings>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SyncSettings {
    pub interval_secs: u64,
    pub batch_size: u32,
    pub request_timeout_secs: u64,
    pub max_workers: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            batch_size: 50,
            request_timeout_secs: 30,
            max_workers: 4,
        }
    }
}

impl SyncSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OAuthAppConfig {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_uri: Option<String>,
    /// Graph only: `common`, `organizations` or a tenant id.
    pub tenant: Option<String>,
}

impl OAuthAppConfig {
    pub fn redirect_uri(&self) -> String {
        self.redirect_uri
            .clone()
            .unwrap_or_else(|| "http://127.0.0.1:8080/callback".to_string())
    }

    /// Secret from the file, else the keyring entry for this client id,
    /// else `OAUTH_CLIENT_SECRET`. Public PKCE clients may have none.
    pub fn resolve_client_secret(&self) -> Result<Option<String>> {
        if let Some(s) = &self.client_secret {
            return Ok(Some(s.clone()));
        }
        Ok(token_store::load_client_secret(&self.client_id)?
            .or_else(|| std::env::var("OAUTH_CLIENT_SECRET").ok()))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ImapAuth {
    #[default]
    Password,
    Xoauth2,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImapSettings {
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    #[serde(default = "default_mailbox")]
    pub mailbox: String,
    #[serde(default)]
    pub auth: ImapAuth,
}

fn default_imap_port() -> u16 {
    993
}

fn default_mailbox() -> String {
    "INBOX".to_string()
}

fn config_dir() -> Result<PathBuf> {
    Ok(dirs::config_dir()
        .ok_or_else(|| anyhow!("no config dir available"))?
        .join("mailsync"))
}

pub fn config_path() -> Result<PathBuf> {
    let mut p = config_dir()?;
    fs::create_dir_all(&p)?;
    p.push("config.toml");
    Ok(p)
}

pub fn default_db_path() -> Result<PathBuf> {
    let mut p = config_dir()?;
    fs::create_dir_all(&p)?;
    p.push("mailsync.db");
    Ok(p)
}

pub fn load_config() -> Result<Config> {
    let path = config_path()?;
    if !path.exists() {
        // create a template config for users to edit
        let sample = Config {
            owner: "me".to_string(),
            db_path: None,
            vault_key: None,
            sync: SyncSettings::default(),
            gmail: Some(OAuthAppConfig {
                client_id: "YOUR_CLIENT_ID.apps.googleusercontent.com".to_string(),
                client_secret: None,
                redirect_uri: Some("http://127.0.0.1:8080/callback".to_string()),
                tenant: None,
            }),
            graph: None,
            imap: Some(ImapSettings {
                host: "imap.example.com".to_string(),
                port: 993,
                mailbox: "INBOX".to_string(),
                auth: ImapAuth::Password,
            }),
        };
        let tom = toml::to_string_pretty(&sample)?;
        fs::write(&path, tom)?;
        return Err(anyhow!(
            "Created template config at {} - edit it and run again",
            path.display()
        ));
    }
    let s = fs::read_to_string(&path)?;
    parse_config(&s).with_context(|| format!("reading {}", path.display()))
}

pub fn parse_config(s: &str) -> Result<Config> {
    Ok(toml::from_str(s)?)
}

pub fn resolve_db_path(cfg: &Config) -> Result<PathBuf> {
    if let Some(p) = &cfg.db_path {
        Ok(PathBuf::from(p))
    } else {
        default_db_path()
    }
}

/// The vault key has no default: without one no credential can be handled.
pub fn resolve_vault_key(cfg: &Config) -> Result<String> {
    if let Some(k) = cfg.vault_key.as_ref().filter(|k| !k.trim().is_empty()) {
        return Ok(k.clone());
    }
    if let Ok(k) = std::env::var(VAULT_KEY_ENV)
        && !k.trim().is_empty()
    {
        return Ok(k);
    }
    token_store::load_vault_key()?.ok_or_else(|| {
        anyhow!(
            "no vault key: set vault_key in the config, {VAULT_KEY_ENV}, or run `mailsync init-vault-key`"
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_sync_defaults() {
        let cfg = parse_config(
            r#"
            owner = "crew-7"

            [imap]
            host = "mail.example.com"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.owner, "crew-7");
        assert_eq!(cfg.sync.batch_size, 50);
        assert_eq!(cfg.sync.interval(), Duration::from_secs(300));
        let imap = cfg.imap.unwrap();
        assert_eq!(imap.port, 993);
        assert_eq!(imap.mailbox, "INBOX");
        assert_eq!(imap.auth, ImapAuth::Password);
        assert!(cfg.gmail.is_none());
    }

    #[test]
    fn partial_sync_table_keeps_other_defaults() {
        let cfg = parse_config(
            r#"
            owner = "o"
            vault_key = "abc"

            [sync]
            max_workers = 8

            [graph]
            client_id = "graph-app"
            tenant = "organizations"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.sync.max_workers, 8);
        assert_eq!(cfg.sync.request_timeout_secs, 30);
        assert_eq!(resolve_vault_key(&cfg).unwrap(), "abc");
        let graph = cfg.graph.unwrap();
        assert_eq!(graph.redirect_uri(), "http://127.0.0.1:8080/callback");
        assert_eq!(graph.tenant.as_deref(), Some("organizations"));
    }
}
