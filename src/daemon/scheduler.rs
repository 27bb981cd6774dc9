//! Periodic fleet sync on a background thread.

use log::{error, info, warn};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::daemon::SyncCoordinator;
use crate::error::SyncError;

/// Waits out one interval. Returns `false` once `stop` fires or its sender
/// is gone.
pub trait Timer: Send + 'static {
    fn wait(&mut self, interval: Duration, stop: &Receiver<()>) -> bool;
}

#[derive(Debug, Default)]
pub struct WallTimer;

impl Timer for WallTimer {
    fn wait(&mut self, interval: Duration, stop: &Receiver<()>) -> bool {
        matches!(stop.recv_timeout(interval), Err(RecvTimeoutError::Timeout))
    }
}

pub struct Scheduler {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    coordinator: Arc<SyncCoordinator>,
}

impl Scheduler {
    /// Runs a fleet sync now, then once per `interval` until stopped.
    pub fn start(coordinator: Arc<SyncCoordinator>, interval: Duration) -> std::io::Result<Self> {
        Self::start_with_timer(coordinator, interval, WallTimer)
    }

    pub fn start_with_timer(
        coordinator: Arc<SyncCoordinator>,
        interval: Duration,
        mut timer: impl Timer,
    ) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = mpsc::channel();
        let worker = coordinator.clone();
        let handle = thread::Builder::new()
            .name("mailsync-scheduler".to_string())
            .spawn(move || {
                info!("scheduler started, interval {}s", interval.as_secs());
                loop {
                    match worker.sync_all() {
                        Ok(results) => {
                            for (id, outcome) in &results {
                                if let Some(e) = &outcome.error {
                                    warn!("account {id}: {e}");
                                }
                            }
                        }
                        Err(SyncError::AlreadyRunning) => {
                            warn!("previous fleet sync still running, skipping tick")
                        }
                        Err(e) => error!("fleet sync failed: {e}"),
                    }
                    if !timer.wait(interval, &stop_rx) {
                        break;
                    }
                }
                info!("scheduler stopped");
            })?;
        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
            coordinator,
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cancels uncommitted work and joins the background thread. The
    /// coordinator is usable again once this returns.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.coordinator.shutdown();
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if handle.join().is_err() {
            error!("scheduler thread panicked");
        }
        self.coordinator.resume();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::vault::SystemClock;
    use crate::daemon::CoordinatorConfig;
    use crate::domain::account::{Account, AccountState, ProviderKind};
    use crate::mail::{AdapterRegistry, FetchBatch, MailAdapter};
    use crate::store::repo::MailRepository;
    use crate::store::sqlite::SqliteRepo;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts ticks and lets the test release each one.
    struct ManualTimer {
        ticks: Arc<AtomicUsize>,
        release: Receiver<()>,
    }

    impl Timer for ManualTimer {
        fn wait(&mut self, _interval: Duration, stop: &Receiver<()>) -> bool {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            loop {
                if stop.try_recv().is_ok() {
                    return false;
                }
                match self.release.recv_timeout(Duration::from_millis(5)) {
                    Ok(()) => return true,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return false,
                }
            }
        }
    }

    struct EmptyMailbox;

    impl MailAdapter for EmptyMailbox {
        fn fetch_batch(&self, _: &Account, _: Option<&str>, _: u32) -> Result<FetchBatch, SyncError> {
            Ok(FetchBatch::default())
        }
    }

    fn manual_timer() -> (ManualTimer, Arc<AtomicUsize>, Sender<()>) {
        let ticks = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = mpsc::channel();
        let timer = ManualTimer {
            ticks: ticks.clone(),
            release: release_rx,
        };
        (timer, ticks, release_tx)
    }

    fn coordinator() -> Arc<SyncCoordinator> {
        coordinator_on(
            Arc::new(SqliteRepo::open_in_memory().unwrap()),
            AdapterRegistry::new(),
        )
    }

    fn coordinator_on(repo: Arc<SqliteRepo>, adapters: AdapterRegistry) -> Arc<SyncCoordinator> {
        Arc::new(SyncCoordinator::new(
            repo,
            Arc::new(adapters),
            Arc::new(SystemClock),
            CoordinatorConfig {
                batch_size: 10,
                max_workers: 2,
            },
        ))
    }

    fn wait_for(ticks: &AtomicUsize, n: usize) {
        for _ in 0..400 {
            if ticks.load(Ordering::SeqCst) >= n {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("timer never reached {n} ticks");
    }

    #[test]
    fn runs_immediately_then_per_tick_until_stopped() {
        let (timer, ticks, release_tx) = manual_timer();
        let coord = coordinator();
        let mut scheduler =
            Scheduler::start_with_timer(coord.clone(), Duration::from_secs(60), timer).unwrap();

        wait_for(&ticks, 1);
        assert!(scheduler.is_running());
        release_tx.send(()).unwrap();
        wait_for(&ticks, 2);

        scheduler.stop();
        assert!(!scheduler.is_running());
        assert!(!coord.is_shutting_down());
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn coordinator_keeps_working_after_stop_and_restart() {
        let repo = Arc::new(SqliteRepo::open_in_memory().unwrap());
        let account = repo
            .begin_connect("owner-1", ProviderKind::Imap, "me@site.test")
            .unwrap();
        repo.set_state(account.id, AccountState::Active).unwrap();
        let mut adapters = AdapterRegistry::new();
        adapters.register(ProviderKind::Imap, Arc::new(EmptyMailbox));
        let coord = coordinator_on(repo.clone(), adapters);

        let (timer, ticks, _release) = manual_timer();
        let mut first =
            Scheduler::start_with_timer(coord.clone(), Duration::from_secs(60), timer).unwrap();
        wait_for(&ticks, 1);
        first.stop();

        let outcome = coord.sync_one(account.id, 10);
        assert!(outcome.success, "{outcome:?}");

        let (timer, ticks, _release) = manual_timer();
        let mut second =
            Scheduler::start_with_timer(coord.clone(), Duration::from_secs(60), timer).unwrap();
        wait_for(&ticks, 1);
        assert!(second.is_running());
        second.stop();

        let fleet = coord.sync_all().unwrap();
        assert!(fleet[&account.id].success);
        assert!(repo.get_account(account.id).unwrap().unwrap().last_synced_at.is_some());
    }

    #[test]
    fn wall_timer_returns_early_on_stop() {
        let (tx, rx) = mpsc::channel();
        tx.send(()).unwrap();
        assert!(!WallTimer.wait(Duration::from_secs(30), &rx));
        let (_tx, rx) = mpsc::channel::<()>();
        assert!(WallTimer.wait(Duration::from_millis(1), &rx));
    }
}
