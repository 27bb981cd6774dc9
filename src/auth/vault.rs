//! Credential vault.
//!
//! Owns encryption of provider tokens and their silent refresh. Plaintext
//! tokens only leave the vault as an [`AccessCredential`] handed to the
//! adapter making the provider call.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::auth::cipher::TokenCipher;
use crate::auth::oauth::{TokenExchange, TokenSet};
use crate::domain::account::{Account, AccountId, AccountState, CredentialBundle};
use crate::error::{SyncError, VaultError};
use crate::store::repo::MailRepository;

/// Source of "now" in epoch seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Decrypted access token for one provider call.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessCredential {
    pub account_id: AccountId,
    pub address: String,
    access_token: String,
}

impl AccessCredential {
    /// A secret that has not been sealed yet, for checking it against the
    /// server before it replaces a stored one.
    pub fn unsealed(
        account_id: AccountId,
        address: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            account_id,
            address: address.into(),
            access_token: access_token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.access_token
    }
}

impl fmt::Debug for AccessCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessCredential")
            .field("account_id", &self.account_id)
            .field("address", &self.address)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

pub struct CredentialVault {
    cipher: TokenCipher,
    repo: Arc<dyn MailRepository>,
    exchange: Arc<dyn TokenExchange>,
    clock: Arc<dyn Clock>,
    refresh_locks: Mutex<HashMap<AccountId, Arc<Mutex<()>>>>,
}

impl CredentialVault {
    /// Fails when the key is missing or malformed; callers treat that as fatal.
    pub fn new(
        key_base64: &str,
        repo: Arc<dyn MailRepository>,
        exchange: Arc<dyn TokenExchange>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, VaultError> {
        let cipher = TokenCipher::from_base64_key(key_base64)?;
        Ok(Self {
            cipher,
            repo,
            exchange,
            clock,
            refresh_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Seals and persists a token set for the account.
    pub fn store(&self, account_id: AccountId, tokens: &TokenSet) -> Result<(), SyncError> {
        let bundle = CredentialBundle {
            access_token_enc: self.cipher.encrypt_str(&tokens.access_token)?,
            refresh_token_enc: tokens
                .refresh_token
                .as_deref()
                .map(|t| self.cipher.encrypt_str(t))
                .transpose()?,
            expires_at: tokens
                .expires_in
                .map(|secs| self.clock.now().saturating_add(secs as i64)),
        };
        self.repo.store_credentials(account_id, &bundle)
    }

    /// Returns a usable credential, refreshing it first when it has expired.
    pub fn get(&self, account: &Account) -> Result<AccessCredential, SyncError> {
        let bundle = self.load(account)?;
        if !self.is_expired(&bundle) {
            return self.open(account, &bundle);
        }

        let lock = self.refresh_lock(account.id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        // Another caller may have refreshed while we waited for the lock.
        let bundle = self.load(account)?;
        if !self.is_expired(&bundle) {
            debug!("account {}: credential refreshed by a concurrent caller", account.id);
            return self.open(account, &bundle);
        }
        self.refresh_locked(account, bundle)
    }

    /// Called when the provider rejected `rejected` before its expiry.
    pub fn refresh_rejected(
        &self,
        account: &Account,
        rejected: &AccessCredential,
    ) -> Result<AccessCredential, SyncError> {
        let lock = self.refresh_lock(account.id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let bundle = self.load(account)?;
        let current = self.open(account, &bundle)?;
        if current.token() != rejected.token() {
            return Ok(current);
        }
        self.refresh_locked(account, bundle)
    }

    /// Marks the account as needing a manual reconnect.
    pub fn fail(&self, account: &Account) -> SyncError {
        // Active accounts reach Error only through TokenExpired.
        let current = self.repo.get_account(account.id).ok().flatten();
        if current.is_some_and(|a| a.state == AccountState::Active)
            && let Err(e) = self.repo.set_state(account.id, AccountState::TokenExpired)
        {
            warn!("account {}: {e}", account.id);
        }
        if let Err(e) = self.repo.set_state(account.id, AccountState::Error) {
            warn!("account {}: could not record auth failure: {e}", account.id);
        }
        SyncError::AuthExpired(account.id)
    }

    fn refresh_locked(
        &self,
        account: &Account,
        bundle: CredentialBundle,
    ) -> Result<AccessCredential, SyncError> {
        if let Err(e) = self.repo.set_state(account.id, AccountState::TokenExpired) {
            warn!("account {}: {e}", account.id);
        }

        let Some(refresh_enc) = bundle.refresh_token_enc else {
            warn!("account {}: token expired and no refresh token", account.id);
            return Err(self.fail(account));
        };
        let refresh_token = self.cipher.decrypt_str(&refresh_enc)?;

        info!("account {}: refreshing {} access token", account.id, account.provider);
        let mut tokens = match self.exchange.refresh(account.provider, &refresh_token) {
            Ok(t) => t,
            Err(e) => {
                warn!("account {}: refresh failed: {e}", account.id);
                return Err(self.fail(account));
            }
        };
        // Providers may omit the refresh token when it did not rotate.
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(refresh_token);
        }
        self.store(account.id, &tokens)?;
        self.repo.set_state(account.id, AccountState::Active)?;

        Ok(AccessCredential {
            account_id: account.id,
            address: account.address.clone(),
            access_token: tokens.access_token,
        })
    }

    fn load(&self, account: &Account) -> Result<CredentialBundle, SyncError> {
        self.repo
            .load_credentials(account.id)?
            .ok_or(SyncError::AuthExpired(account.id))
    }

    fn open(
        &self,
        account: &Account,
        bundle: &CredentialBundle,
    ) -> Result<AccessCredential, SyncError> {
        Ok(AccessCredential {
            account_id: account.id,
            address: account.address.clone(),
            access_token: self.cipher.decrypt_str(&bundle.access_token_enc)?,
        })
    }

    fn is_expired(&self, bundle: &CredentialBundle) -> bool {
        bundle
            .expires_at
            .is_some_and(|at| self.clock.now() >= at)
    }

    fn refresh_lock(&self, id: AccountId) -> Arc<Mutex<()>> {
        let mut locks = self
            .refresh_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks.entry(id).or_default().clone()
    }
}
