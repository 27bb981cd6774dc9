#![allow(dead_code)]

use oauth2::{CsrfToken, PkceCodeChallenge, PkceCodeVerifier};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};

use mailsync::auth::oauth::{AuthorizationStart, TokenExchange, TokenSet};
use mailsync::auth::vault::{Clock, CredentialVault};
use mailsync::daemon::{CoordinatorConfig, SyncCoordinator};
use mailsync::domain::account::{Account, AccountState, ProviderKind};
use mailsync::domain::email::{CanonicalMessage, EmailAddress, EmailBody};
use mailsync::error::SyncError;
use mailsync::mail::http::JsonTransport;
use mailsync::mail::{AdapterRegistry, FetchBatch, MailAdapter};
use mailsync::store::repo::MailRepository;
use mailsync::store::sqlite::SqliteRepo;

pub const KEY: &str = "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=";

pub struct FixedClock(pub AtomicI64);

impl FixedClock {
    pub fn at(now: i64) -> Arc<Self> {
        Arc::new(Self(AtomicI64::new(now)))
    }
}

impl Clock for FixedClock {
    fn now(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Token endpoint stand-in: hands out `access-N` tokens.
#[derive(Default)]
pub struct FakeExchange {
    pub exchanges: AtomicUsize,
    pub refreshes: AtomicUsize,
}

impl TokenExchange for FakeExchange {
    fn authorization_url(&self, provider: ProviderKind) -> Result<AuthorizationStart, SyncError> {
        let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
        let state = CsrfToken::new_random().secret().clone();
        let url = url::Url::parse(&format!(
            "https://auth.test/{provider}?state={state}&code_challenge={}",
            challenge.as_str()
        ))
        .map_err(|e| SyncError::Provider(e.to_string()))?;
        Ok(AuthorizationStart {
            url,
            state,
            verifier,
        })
    }

    fn exchange_code(
        &self,
        _provider: ProviderKind,
        code: &str,
        _verifier: PkceCodeVerifier,
    ) -> Result<TokenSet, SyncError> {
        if code == "bad-code" {
            return Err(SyncError::Provider("invalid_grant".into()));
        }
        let n = self.exchanges.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TokenSet {
            access_token: format!("access-{n}"),
            refresh_token: Some(format!("refresh-{n}")),
            expires_in: Some(3600),
        })
    }

    fn refresh(&self, _provider: ProviderKind, _refresh_token: &str) -> Result<TokenSet, SyncError> {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TokenSet {
            access_token: format!("refreshed-{n}"),
            refresh_token: None,
            expires_in: Some(3600),
        })
    }
}

pub fn message(id: &str, account: &Account) -> CanonicalMessage {
    CanonicalMessage {
        message_id: id.to_string(),
        thread_id: format!("thread-{id}"),
        account_id: account.id,
        from: EmailAddress {
            name: "Sender".into(),
            address: "sender@example.com".into(),
        },
        to: vec![EmailAddress {
            name: String::new(),
            address: account.address.clone(),
        }],
        cc: vec![],
        subject: format!("Subject {id}"),
        body: EmailBody {
            text: format!("Body of {id}"),
            html: String::new(),
        },
        snippet: format!("Body of {id}"),
        date: 1_700_000_000,
        is_read: false,
        is_starred: false,
        has_attachments: false,
        attachments: vec![],
    }
}

/// Returns the same page on every call and records the cursors it was given.
pub struct StaticAdapter {
    pub ids: Vec<String>,
    pub next_cursor: Option<String>,
    pub seen_cursors: Mutex<Vec<Option<String>>>,
}

impl StaticAdapter {
    pub fn new(ids: &[&str], next_cursor: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            ids: ids.iter().map(|s| s.to_string()).collect(),
            next_cursor: next_cursor.map(str::to_string),
            seen_cursors: Mutex::new(Vec::new()),
        })
    }

    pub fn seen(&self) -> Vec<Option<String>> {
        self.seen_cursors.lock().unwrap().clone()
    }
}

impl MailAdapter for StaticAdapter {
    fn fetch_batch(
        &self,
        account: &Account,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<FetchBatch, SyncError> {
        self.seen_cursors
            .lock()
            .unwrap()
            .push(cursor.map(str::to_string));
        Ok(FetchBatch {
            messages: self
                .ids
                .iter()
                .take(limit as usize)
                .map(|id| message(&format!("{}-{id}", account.address), account))
                .collect(),
            cursor: self.next_cursor.clone(),
            skipped: 0,
        })
    }

    fn mailbox_address(&self, access_token: &str) -> Result<String, SyncError> {
        if access_token.starts_with("access-") {
            Ok("connected@example.com".to_string())
        } else {
            Err(SyncError::Unauthorized(access_token.to_string()))
        }
    }

    fn verify_login(&self, _account: &Account, secret: &str) -> Result<(), SyncError> {
        if secret == "wrong" {
            Err(SyncError::Unauthorized("AUTHENTICATIONFAILED".to_string()))
        } else {
            Ok(())
        }
    }
}

pub struct FailingAdapter(pub SyncError);

impl MailAdapter for FailingAdapter {
    fn fetch_batch(&self, _: &Account, _: Option<&str>, _: u32) -> Result<FetchBatch, SyncError> {
        Err(self.0.clone())
    }

    fn verify_login(&self, _: &Account, _: &str) -> Result<(), SyncError> {
        Err(self.0.clone())
    }
}

pub struct PanickingAdapter;

impl MailAdapter for PanickingAdapter {
    fn fetch_batch(&self, _: &Account, _: Option<&str>, _: u32) -> Result<FetchBatch, SyncError> {
        panic!("adapter bug");
    }
}

/// Blocks inside `fetch_batch` until the test releases it.
pub struct GateAdapter {
    pub entered: Mutex<Sender<()>>,
    pub release: Mutex<Receiver<()>>,
}

impl MailAdapter for GateAdapter {
    fn fetch_batch(&self, _: &Account, cursor: Option<&str>, _: u32) -> Result<FetchBatch, SyncError> {
        let _ = self.entered.lock().unwrap().send(());
        let _ = self.release.lock().unwrap().recv();
        Ok(FetchBatch {
            cursor: cursor.map(str::to_string),
            ..FetchBatch::default()
        })
    }
}

/// Replays JSON bodies keyed by URL prefix; unknown URLs are a 404.
#[derive(Default)]
pub struct RoutedTransport {
    routes: Mutex<Vec<(String, VecDeque<Value>)>>,
    pub calls: Mutex<Vec<String>>,
}

impl RoutedTransport {
    pub fn route(&self, prefix: &str, body: Value) {
        let mut routes = self.routes.lock().unwrap();
        match routes.iter_mut().find(|(p, _)| p == prefix) {
            Some((_, q)) => q.push_back(body),
            None => routes.push((prefix.to_string(), VecDeque::from([body]))),
        }
    }
}

impl JsonTransport for RoutedTransport {
    fn get_json(&self, url: &str, _query: &[(&str, String)], _bearer: &str) -> Result<Value, SyncError> {
        self.calls.lock().unwrap().push(url.to_string());
        let mut routes = self.routes.lock().unwrap();
        // longest prefix wins
        let route = routes
            .iter_mut()
            .filter(|(p, _)| url.starts_with(p.as_str()))
            .max_by_key(|(p, _)| p.len());
        match route {
            Some((_, q)) if q.len() > 1 => Ok(q.pop_front().unwrap()),
            Some((_, q)) => Ok(q.front().cloned().unwrap()),
            None => Err(SyncError::Provider(format!("404: {url}"))),
        }
    }
}

pub struct Harness {
    pub repo: Arc<SqliteRepo>,
    pub vault: Arc<CredentialVault>,
    pub exchange: Arc<FakeExchange>,
    pub clock: Arc<FixedClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_repo(Arc::new(SqliteRepo::open_in_memory().unwrap()))
    }

    pub fn with_repo(repo: Arc<SqliteRepo>) -> Self {
        let exchange = Arc::new(FakeExchange::default());
        let clock = FixedClock::at(1_000_000);
        let vault = Arc::new(
            CredentialVault::new(KEY, repo.clone(), exchange.clone(), clock.clone()).unwrap(),
        );
        Self {
            repo,
            vault,
            exchange,
            clock,
        }
    }

    /// An active account with a stored, unexpired token.
    pub fn account(&self, provider: ProviderKind, address: &str) -> Account {
        let account = self.repo.begin_connect("owner-1", provider, address).unwrap();
        self.vault
            .store(
                account.id,
                &TokenSet {
                    access_token: format!("token-{address}"),
                    refresh_token: Some("refresh".into()),
                    expires_in: Some(3600),
                },
            )
            .unwrap();
        self.repo.set_state(account.id, AccountState::Active).unwrap();
        self.repo.get_account(account.id).unwrap().unwrap()
    }

    pub fn coordinator(&self, adapters: AdapterRegistry) -> SyncCoordinator {
        self.coordinator_on(self.repo.clone(), adapters)
    }

    pub fn coordinator_on(
        &self,
        repo: Arc<dyn MailRepository>,
        adapters: AdapterRegistry,
    ) -> SyncCoordinator {
        SyncCoordinator::new(
            repo,
            Arc::new(adapters),
            self.clock.clone(),
            CoordinatorConfig {
                batch_size: 50,
                max_workers: 4,
            },
        )
    }
}
