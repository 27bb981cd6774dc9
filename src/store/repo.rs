use crate::domain::account::{Account, AccountId, AccountState, CredentialBundle, ProviderKind};
use crate::domain::email::{CanonicalMessage, UpsertOutcome};
use crate::error::SyncError;

pub type StoreResult<T> = Result<T, SyncError>;

/// Durable storage for accounts, credentials, cursors and messages.
///
/// Writes for different accounts never conflict: messages are keyed by a
/// globally unique id and every other row is per account.
pub trait MailRepository: Send + Sync {
    /// Creates the account in `connecting`, or moves an existing
    /// (owner, provider, address) row back to `connecting` for a reconnect.
    fn begin_connect(
        &self,
        owner: &str,
        provider: ProviderKind,
        address: &str,
    ) -> StoreResult<Account>;

    fn get_account(&self, id: AccountId) -> StoreResult<Option<Account>>;
    fn list_accounts(&self) -> StoreResult<Vec<Account>>;
    fn list_enabled_accounts(&self) -> StoreResult<Vec<Account>>;

    /// Applies a lifecycle transition, rejecting ones the state machine forbids.
    fn set_state(&self, id: AccountId, to: AccountState) -> StoreResult<()>;

    fn load_credentials(&self, id: AccountId) -> StoreResult<Option<CredentialBundle>>;
    fn store_credentials(&self, id: AccountId, bundle: &CredentialBundle) -> StoreResult<()>;

    fn load_cursor(&self, id: AccountId) -> StoreResult<Option<String>>;
    /// Only call once every message of the producing batch is upserted.
    fn commit_cursor(&self, id: AccountId, cursor: Option<&str>) -> StoreResult<()>;
    fn mark_synced(&self, id: AccountId, at_epoch: i64) -> StoreResult<()>;

    /// Inserts a new message, or refreshes read/starred on an existing one.
    /// Content fields of an existing message are never overwritten.
    fn upsert_message(&self, msg: &CanonicalMessage) -> StoreResult<UpsertOutcome>;
    fn get_message(&self, message_id: &str) -> StoreResult<Option<CanonicalMessage>>;
    fn count_messages(&self, account: Option<AccountId>) -> StoreResult<usize>;

    /// Written by the external classifier; sync never touches it.
    fn set_classification(&self, message_id: &str, label: &str) -> StoreResult<()>;
}
