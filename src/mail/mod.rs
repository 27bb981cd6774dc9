pub mod decoders;
pub mod gmail;
pub mod graph;
pub mod http;
pub mod imap_client;
pub mod mime;

use log::info;
use std::collections::HashMap;
use std::sync::Arc;

use crate::auth::vault::{AccessCredential, CredentialVault};
use crate::domain::account::{Account, ProviderKind};
use crate::domain::email::CanonicalMessage;
use crate::error::SyncError;

/// One page of normalized messages and the cursor that follows it.
#[derive(Debug, Default, Clone)]
pub struct FetchBatch {
    pub messages: Vec<CanonicalMessage>,
    /// Cursor to commit once every message above is stored.
    pub cursor: Option<String>,
    /// Messages dropped as malformed.
    pub skipped: usize,
}

/// The single capability every provider family implements.
pub trait MailAdapter: Send + Sync {
    fn fetch_batch(
        &self,
        account: &Account,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<FetchBatch, SyncError>;

    /// Mailbox address owning `access_token`, asked right after a code exchange.
    fn mailbox_address(&self, _access_token: &str) -> Result<String, SyncError> {
        Err(SyncError::Provider(
            "provider cannot look up its mailbox address".to_string(),
        ))
    }

    /// Logs in with `secret` without storing it.
    fn verify_login(&self, _account: &Account, _secret: &str) -> Result<(), SyncError> {
        Err(SyncError::Provider(
            "provider has no password login".to_string(),
        ))
    }
}

/// Adapters by provider kind.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<ProviderKind, Arc<dyn MailAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: ProviderKind, adapter: Arc<dyn MailAdapter>) {
        self.adapters.insert(provider, adapter);
    }

    pub fn get(&self, provider: ProviderKind) -> Result<Arc<dyn MailAdapter>, SyncError> {
        self.adapters
            .get(&provider)
            .cloned()
            .ok_or_else(|| SyncError::Provider(format!("no adapter registered for {provider}")))
    }
}

/// Runs `call` with a valid credential. If the provider rejects it, the vault
/// refreshes once and the call is retried once; a second rejection fails the
/// account.
pub(crate) fn with_credential<T>(
    vault: &CredentialVault,
    account: &Account,
    mut call: impl FnMut(&AccessCredential) -> Result<T, SyncError>,
) -> Result<T, SyncError> {
    let cred = vault.get(account)?;
    match call(&cred) {
        Err(SyncError::Unauthorized(reason)) => {
            info!("account {}: token rejected ({reason}), refreshing", account.id);
            let fresh = vault.refresh_rejected(account, &cred)?;
            match call(&fresh) {
                Err(SyncError::Unauthorized(_)) => Err(vault.fail(account)),
                other => other,
            }
        }
        other => other,
    }
}
