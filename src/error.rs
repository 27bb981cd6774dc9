use thiserror::Error;

use crate::domain::account::{AccountId, AccountState};

/// Everything that can go wrong while syncing one account.
///
/// Adapter and account level failures are captured into a `SyncOutcome`
/// by the coordinator; none of them abort a fleet run.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
    /// Network failure or timeout. Retried on the next scheduled cycle.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// The provider rejected the credential and it could not be refreshed.
    #[error("authorization expired for account {0}")]
    AuthExpired(AccountId),

    /// A provider call was answered with 401/403 or an auth NO.
    /// Triggers one forced refresh before it becomes `AuthExpired`.
    #[error("provider rejected the access token: {0}")]
    Unauthorized(String),

    #[error("provider rate limited the request: {0}")]
    ProviderRateLimited(String),

    /// One message could not be normalized. The rest of the batch continues.
    #[error("malformed message {id}: {reason}")]
    MalformedMessage { id: String, reason: String },

    /// The requested item no longer exists on the provider (404/410).
    #[error("provider has no such item: {0}")]
    NotFound(String),

    /// Provider answered with something we do not know how to handle.
    #[error("provider error: {0}")]
    Provider(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("account {0} not found")]
    AccountNotFound(AccountId),

    #[error("account {0} is not enabled for sync")]
    AccountDisabled(AccountId),

    #[error("invalid account state transition {from} -> {to}")]
    InvalidTransition { from: AccountState, to: AccountState },

    #[error("a fleet sync is already running")]
    AlreadyRunning,

    #[error("sync cancelled before cursor commit")]
    Cancelled,

    #[error("credential vault: {0}")]
    Vault(#[from] VaultError),
}

impl SyncError {
    /// Transient failures leave the account state untouched.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::TransientNetwork(_) | SyncError::ProviderRateLimited(_)
        )
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Persistence(format!("json column: {err}"))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            return SyncError::TransientNetwork(err.to_string());
        }
        if err.is_decode() {
            return SyncError::Provider(format!("undecodable response: {err}"));
        }
        SyncError::TransientNetwork(err.to_string())
    }
}

impl From<imap::Error> for SyncError {
    fn from(err: imap::Error) -> Self {
        match err {
            imap::Error::Io(e) => SyncError::TransientNetwork(e.to_string()),
            imap::Error::Bad(msg) | imap::Error::No(msg) => SyncError::Provider(msg),
            other => SyncError::TransientNetwork(other.to_string()),
        }
    }
}

/// Errors raised by the credential cipher.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum VaultError {
    #[error("no vault key configured")]
    MissingKey,

    #[error("invalid vault key: {0}")]
    InvalidKey(String),

    #[error("encryption failed")]
    Encryption,

    #[error("decryption failed (wrong key or corrupted data)")]
    Decryption,

    #[error("invalid encrypted data format: {0}")]
    InvalidFormat(String),
}
