pub mod scheduler;

use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use crate::auth::vault::Clock;
use crate::config::SyncSettings;
use crate::domain::account::{Account, AccountId};
use crate::domain::email::UpsertOutcome;
use crate::error::SyncError;
use crate::mail::AdapterRegistry;
use crate::store::repo::MailRepository;

/// Per-account result of a sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub success: bool,
    /// Newly stored messages.
    pub count: usize,
    /// Messages dropped as malformed.
    pub skipped: usize,
    pub error: Option<String>,
}

impl SyncOutcome {
    fn ok(count: usize, skipped: usize) -> Self {
        Self {
            success: true,
            count,
            skipped,
            error: None,
        }
    }

    fn failed(err: impl ToString) -> Self {
        Self {
            error: Some(err.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    pub batch_size: u32,
    pub max_workers: usize,
}

impl From<&SyncSettings> for CoordinatorConfig {
    fn from(s: &SyncSettings) -> Self {
        Self {
            batch_size: s.batch_size,
            max_workers: s.max_workers,
        }
    }
}

/// Clears the fleet flag however the run ends.
struct FleetGuard<'a>(&'a AtomicBool);

impl Drop for FleetGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncCoordinator {
    repo: Arc<dyn MailRepository>,
    adapters: Arc<AdapterRegistry>,
    clock: Arc<dyn Clock>,
    cfg: CoordinatorConfig,
    fleet_running: AtomicBool,
    shutdown: AtomicBool,
}

impl SyncCoordinator {
    pub fn new(
        repo: Arc<dyn MailRepository>,
        adapters: Arc<AdapterRegistry>,
        clock: Arc<dyn Clock>,
        cfg: CoordinatorConfig,
    ) -> Self {
        Self {
            repo,
            adapters,
            clock,
            cfg,
            fleet_running: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Syncs every enabled account. One account failing never affects the
    /// others; overlapping fleet runs are refused.
    pub fn sync_all(&self) -> Result<BTreeMap<AccountId, SyncOutcome>, SyncError> {
        if self
            .fleet_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("fleet sync already in progress");
            return Err(SyncError::AlreadyRunning);
        }
        let _guard = FleetGuard(&self.fleet_running);

        let accounts = self.repo.list_enabled_accounts()?;
        if accounts.is_empty() {
            debug!("no enabled accounts");
            return Ok(BTreeMap::new());
        }
        let workers = self.cfg.max_workers.clamp(1, accounts.len());
        info!(
            "syncing {} account(s) on {workers} worker(s)",
            accounts.len()
        );

        let next = AtomicUsize::new(0);
        let results = Mutex::new(BTreeMap::new());
        thread::scope(|s| {
            for _ in 0..workers {
                s.spawn(|| {
                    loop {
                        let i = next.fetch_add(1, Ordering::Relaxed);
                        let Some(account) = accounts.get(i) else {
                            break;
                        };
                        let outcome = self.isolated(account, self.cfg.batch_size);
                        results
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert(account.id, outcome);
                    }
                });
            }
        });

        let results = results.into_inner().unwrap_or_else(PoisonError::into_inner);
        let failed = results.values().filter(|o| !o.success).count();
        let stored: usize = results.values().map(|o| o.count).sum();
        info!(
            "fleet sync done: {stored} new message(s), {failed} failed account(s)"
        );
        Ok(results)
    }

    /// Syncs one account on the caller's thread.
    pub fn sync_one(&self, account_id: AccountId, max_results: u32) -> SyncOutcome {
        let account = match self.repo.get_account(account_id) {
            Ok(Some(a)) => a,
            Ok(None) => return SyncOutcome::failed(SyncError::AccountNotFound(account_id)),
            Err(e) => return SyncOutcome::failed(e),
        };
        if !account.state.is_enabled() {
            return SyncOutcome::failed(SyncError::AccountDisabled(account_id));
        }
        self.isolated(&account, max_results)
    }

    /// Asks in-flight runs to stop before their next cursor commit.
    pub fn shutdown(&self) {
        info!("sync shutdown requested");
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Lets runs proceed again after a `shutdown`.
    pub fn resume(&self) {
        self.shutdown.store(false, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn isolated(&self, account: &Account, limit: u32) -> SyncOutcome {
        match panic::catch_unwind(AssertUnwindSafe(|| self.run_account(account, limit))) {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                if e.is_transient() {
                    warn!("account {}: transient failure, retrying next cycle: {e}", account.id);
                } else {
                    error!("account {}: sync failed: {e}", account.id);
                }
                SyncOutcome::failed(e)
            }
            Err(_) => {
                error!("account {}: sync panicked", account.id);
                SyncOutcome::failed("sync panicked")
            }
        }
    }

    fn run_account(&self, account: &Account, limit: u32) -> Result<SyncOutcome, SyncError> {
        if self.is_shutting_down() {
            return Err(SyncError::Cancelled);
        }
        let adapter = self.adapters.get(account.provider)?;
        let cursor = self.repo.load_cursor(account.id)?;
        debug!(
            "account {}: fetching up to {limit} from cursor {:?}",
            account.id, cursor
        );

        let batch = adapter.fetch_batch(account, cursor.as_deref(), limit)?;

        let mut inserted = 0;
        for msg in &batch.messages {
            if self.repo.upsert_message(msg)? == UpsertOutcome::Inserted {
                inserted += 1;
            }
        }

        // Everything is stored; a cancelled run still leaves the old cursor.
        if self.is_shutting_down() {
            warn!("account {}: cancelled before cursor commit", account.id);
            return Err(SyncError::Cancelled);
        }
        if batch.cursor != cursor {
            self.repo.commit_cursor(account.id, batch.cursor.as_deref())?;
        }
        self.repo.mark_synced(account.id, self.clock.now())?;

        info!(
            "account {} ({}): {inserted} new of {} fetched",
            account.id,
            account.address,
            batch.messages.len()
        );
        Ok(SyncOutcome::ok(inserted, batch.skipped))
    }
}
