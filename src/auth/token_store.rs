use anyhow::{Result, anyhow};
use keyring::{Entry, Error as KeyringError};

const SERVICE: &str = "mailsync";
const VAULT_KEY_USER: &str = "vault-key";

fn save(user: &str, secret: &str) -> Result<()> {
    let entry = Entry::new(SERVICE, user);
    entry?
        .set_password(secret)
        .map_err(|e| anyhow!(e.to_string()))?;
    Ok(())
}

fn load(user: &str) -> Result<Option<String>> {
    let entry = Entry::new(SERVICE, user);
    match entry?.get_password() {
        Ok(v) => Ok(Some(v)),
        Err(KeyringError::NoEntry) => Ok(None),
        Err(e) => Err(anyhow!(e.to_string())),
    }
}

/// Save an OAuth client secret into the keyring, keyed by client_id
pub fn save_client_secret(client_id: &str, client_secret: &str) -> Result<()> {
    save(client_id, client_secret)
}

/// Load an OAuth client secret from the keyring by client_id
pub fn load_client_secret(client_id: &str) -> Result<Option<String>> {
    load(client_id)
}

/// Save the base64 vault key into the OS keyring
pub fn save_vault_key(key: &str) -> Result<()> {
    save(VAULT_KEY_USER, key)
}

pub fn load_vault_key() -> Result<Option<String>> {
    load(VAULT_KEY_USER)
}
