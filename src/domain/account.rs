use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type AccountId = i64;

/// Provider family an account syncs from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Gmail,
    Graph,
    Imap,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Gmail => "gmail",
            ProviderKind::Graph => "graph",
            ProviderKind::Imap => "imap",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gmail" | "google" => Ok(ProviderKind::Gmail),
            "graph" | "outlook" | "microsoft" => Ok(ProviderKind::Graph),
            "imap" => Ok(ProviderKind::Imap),
            other => Err(format!("unknown provider '{other}'")),
        }
    }
}

/// Account lifecycle.
///
/// ```text
/// connecting -> active -> token_expired -> active | error
/// active | token_expired -> disabled
/// error | disabled -> connecting   (reconnect)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountState {
    Connecting,
    Active,
    TokenExpired,
    Error,
    Disabled,
}

impl AccountState {
    pub fn as_str(self) -> &'static str {
        match self {
            AccountState::Connecting => "connecting",
            AccountState::Active => "active",
            AccountState::TokenExpired => "token_expired",
            AccountState::Error => "error",
            AccountState::Disabled => "disabled",
        }
    }

    pub fn can_transition(self, to: AccountState) -> bool {
        use AccountState::*;
        if self == to {
            return true;
        }
        matches!(
            (self, to),
            (Connecting, Active)
                | (Connecting, Error)
                | (Active, TokenExpired)
                | (TokenExpired, Active)
                | (TokenExpired, Error)
                | (Active, Disabled)
                | (TokenExpired, Disabled)
                | (Error, Connecting)
                | (Disabled, Connecting)
        )
    }

    /// Accounts the coordinator picks up on a fleet run.
    pub fn is_enabled(self) -> bool {
        matches!(self, AccountState::Active | AccountState::TokenExpired)
    }
}

impl fmt::Display for AccountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connecting" => Ok(AccountState::Connecting),
            "active" => Ok(AccountState::Active),
            "token_expired" => Ok(AccountState::TokenExpired),
            "error" => Ok(AccountState::Error),
            "disabled" => Ok(AccountState::Disabled),
            other => Err(format!("unknown account state '{other}'")),
        }
    }
}

/// One connected mailbox. Credentials are loaded separately by the vault.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: AccountId,
    pub owner: String,
    pub provider: ProviderKind,
    pub address: String,
    pub expires_at: Option<i64>,
    pub cursor: Option<String>,
    pub last_synced_at: Option<i64>,
    pub state: AccountState,
}

/// Credentials as they sit in storage: both tokens already sealed by the vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialBundle {
    pub access_token_enc: String,
    pub refresh_token_enc: Option<String>,
    pub expires_at: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_paths() {
        assert!(AccountState::Active.can_transition(AccountState::TokenExpired));
        assert!(AccountState::TokenExpired.can_transition(AccountState::Active));
        assert!(AccountState::TokenExpired.can_transition(AccountState::Error));
        assert!(!AccountState::Active.can_transition(AccountState::Error));
    }

    #[test]
    fn disconnect_only_from_live_states() {
        assert!(AccountState::Active.can_transition(AccountState::Disabled));
        assert!(AccountState::TokenExpired.can_transition(AccountState::Disabled));
        assert!(!AccountState::Connecting.can_transition(AccountState::Disabled));
        assert!(!AccountState::Error.can_transition(AccountState::Disabled));
    }

    #[test]
    fn reconnect_goes_through_connecting() {
        assert!(AccountState::Disabled.can_transition(AccountState::Connecting));
        assert!(AccountState::Error.can_transition(AccountState::Connecting));
        assert!(!AccountState::Disabled.can_transition(AccountState::Active));
    }

    #[test]
    fn provider_names_round_trip_through_storage_form() {
        for p in [ProviderKind::Gmail, ProviderKind::Graph, ProviderKind::Imap] {
            assert_eq!(p.as_str().parse::<ProviderKind>().unwrap(), p);
        }
        assert_eq!("Outlook".parse::<ProviderKind>().unwrap(), ProviderKind::Graph);
        assert!("pop3".parse::<ProviderKind>().is_err());
    }
}
