use log::{info, warn};
use oauth2::PkceCodeVerifier;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use url::Url;

use crate::auth::oauth::{TokenExchange, TokenSet};
use crate::auth::vault::CredentialVault;
use crate::domain::account::{Account, AccountId, AccountState, ProviderKind};
use crate::error::SyncError;
use crate::mail::AdapterRegistry;
use crate::store::repo::MailRepository;

struct PendingAuthorization {
    state: String,
    verifier: PkceCodeVerifier,
}

/// Authorization handshakes: creates accounts, reconnects and disconnects them.
pub struct AccountConnector {
    repo: Arc<dyn MailRepository>,
    vault: Arc<CredentialVault>,
    exchange: Arc<dyn TokenExchange>,
    adapters: Arc<AdapterRegistry>,
    pending: Mutex<HashMap<ProviderKind, PendingAuthorization>>,
}

impl AccountConnector {
    pub fn new(
        repo: Arc<dyn MailRepository>,
        vault: Arc<CredentialVault>,
        exchange: Arc<dyn TokenExchange>,
        adapters: Arc<AdapterRegistry>,
    ) -> Self {
        Self {
            repo,
            vault,
            exchange,
            adapters,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Starts an authorization for `provider`. A newer call replaces an
    /// unfinished one for the same provider.
    pub fn get_authorization_url(&self, provider: ProviderKind) -> Result<Url, SyncError> {
        let start = self.exchange.authorization_url(provider)?;
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                provider,
                PendingAuthorization {
                    state: start.state,
                    verifier: start.verifier,
                },
            );
        Ok(start.url)
    }

    /// CSRF state of the pending authorization, for checking the redirect.
    pub fn pending_state(&self, provider: ProviderKind) -> Option<String> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&provider)
            .map(|p| p.state.clone())
    }

    /// Completes the handshake started by `get_authorization_url`.
    pub fn exchange_authorization_code(
        &self,
        owner: &str,
        provider: ProviderKind,
        code: &str,
    ) -> Result<Account, SyncError> {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&provider)
            .ok_or_else(|| {
                SyncError::Provider(format!("no pending authorization for {provider}"))
            })?;

        let tokens = self.exchange.exchange_code(provider, code, pending.verifier)?;
        let address = self
            .adapters
            .get(provider)?
            .mailbox_address(&tokens.access_token)?;

        let account = self.repo.begin_connect(owner, provider, &address)?;
        self.activate(account, &tokens)
    }

    /// IMAP has no handshake: the secret is checked with a login and only
    /// stored once the server accepts it. A live account that is given a
    /// bad secret keeps its old one.
    pub fn connect_imap(
        &self,
        owner: &str,
        address: &str,
        secret: &str,
    ) -> Result<Account, SyncError> {
        let account = self.repo.begin_connect(owner, ProviderKind::Imap, address)?;
        let adapter = self.adapters.get(ProviderKind::Imap)?;
        if let Err(e) = adapter.verify_login(&account, secret) {
            warn!("account {}: imap login check failed: {e}", account.id);
            if account.state == AccountState::Connecting {
                self.vault.fail(&account);
            }
            return Err(e);
        }
        let tokens = TokenSet {
            access_token: secret.to_string(),
            refresh_token: None,
            expires_in: None,
        };
        self.activate(account, &tokens)
    }

    /// Stops syncing the account. Its messages and cursor are kept.
    pub fn disconnect(&self, id: AccountId) -> Result<(), SyncError> {
        self.repo.set_state(id, AccountState::Disabled)?;
        info!("account {id} disconnected");
        Ok(())
    }

    fn activate(&self, account: Account, tokens: &TokenSet) -> Result<Account, SyncError> {
        let stored = self
            .vault
            .store(account.id, tokens)
            .and_then(|_| self.repo.set_state(account.id, AccountState::Active));
        if let Err(e) = stored {
            warn!("account {}: could not activate: {e}", account.id);
            self.vault.fail(&account);
            return Err(e);
        }
        info!(
            "connected {} account {} ({})",
            account.provider, account.id, account.address
        );
        self.reload(account.id)
    }

    fn reload(&self, id: AccountId) -> Result<Account, SyncError> {
        self.repo
            .get_account(id)?
            .ok_or(SyncError::AccountNotFound(id))
    }
}
