use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::io::Read;
use std::sync::{Arc, mpsc};
use std::time::Duration;

use mailsync::auth::cipher::TokenCipher;
use mailsync::auth::connector::AccountConnector;
use mailsync::auth::oauth::{OAuthApps, wait_for_redirect};
use mailsync::auth::token_store;
use mailsync::auth::vault::{Clock, CredentialVault, SystemClock};
use mailsync::config::{Config, load_config, resolve_db_path, resolve_vault_key};
use mailsync::daemon::scheduler::Scheduler;
use mailsync::daemon::{CoordinatorConfig, SyncCoordinator};
use mailsync::domain::account::ProviderKind;
use mailsync::mail::AdapterRegistry;
use mailsync::mail::gmail::GmailAdapter;
use mailsync::mail::graph::GraphAdapter;
use mailsync::mail::http::HttpTransport;
use mailsync::mail::imap_client::{ImapAdapter, TlsImapConnector};
use mailsync::store::repo::MailRepository;
use mailsync::store::sqlite::SqliteRepo;

#[derive(Parser)]
#[command(name = "mailsync")]
#[command(about = "Sync Gmail, Outlook and IMAP mailboxes into one local store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect (or reconnect) a Gmail or Graph mailbox through the browser
    Connect {
        /// gmail | graph
        provider: ProviderKind,
    },

    /// Connect an IMAP mailbox; the password is read from stdin
    ConnectImap {
        #[arg(long)]
        address: String,
    },

    /// List connected accounts
    Accounts {
        #[arg(long)]
        json: bool,
    },

    /// Stop syncing an account (its mail is kept)
    Disconnect { id: i64 },

    /// Run one sync now
    Sync {
        /// Only this account
        #[arg(long)]
        account: Option<i64>,

        /// Batch size for a single-account sync
        #[arg(long)]
        max: Option<u32>,
    },

    /// Sync every enabled account on an interval until Ctrl-C
    Daemon {
        /// Seconds between runs; defaults to the config value
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Store an OAuth client secret in the keyring
    SetClientSecret {
        #[arg(long)]
        client_id: String,
    },

    /// Generate a vault key and store it in the keyring
    InitVaultKey {
        /// Replace an existing key (stored tokens become unreadable)
        #[arg(long)]
        force: bool,
    },
}

/// Everything the sync commands share, wired from the config.
struct App {
    cfg: Config,
    repo: Arc<dyn MailRepository>,
    connector: AccountConnector,
    coordinator: Arc<SyncCoordinator>,
}

impl App {
    fn build() -> Result<Self> {
        let cfg = load_config().map_err(|e| anyhow!("Configuration error: {e}"))?;
        let db_path = resolve_db_path(&cfg)?;
        let repo: Arc<dyn MailRepository> = Arc::new(
            SqliteRepo::open(&db_path).with_context(|| format!("opening {}", db_path.display()))?,
        );

        let key = resolve_vault_key(&cfg)?;
        let exchange = Arc::new(OAuthApps::from_config(&cfg)?);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let vault = Arc::new(
            CredentialVault::new(&key, repo.clone(), exchange.clone(), clock.clone())
                .context("credential vault")?,
        );

        let transport = Arc::new(HttpTransport::new(cfg.sync.request_timeout())?);
        let mut adapters = AdapterRegistry::new();
        adapters.register(
            ProviderKind::Gmail,
            Arc::new(GmailAdapter::new(transport.clone(), vault.clone())),
        );
        adapters.register(
            ProviderKind::Graph,
            Arc::new(GraphAdapter::new(transport, vault.clone())),
        );
        if let Some(imap) = &cfg.imap {
            let connector = TlsImapConnector::new(imap, cfg.sync.request_timeout());
            adapters.register(
                ProviderKind::Imap,
                Arc::new(ImapAdapter::new(
                    Arc::new(connector),
                    vault.clone(),
                    imap.mailbox.clone(),
                )),
            );
        }
        let adapters = Arc::new(adapters);

        let connector =
            AccountConnector::new(repo.clone(), vault, exchange, adapters.clone());
        let coordinator = Arc::new(SyncCoordinator::new(
            repo.clone(),
            adapters,
            clock,
            CoordinatorConfig::from(&cfg.sync),
        ));
        Ok(Self {
            cfg,
            repo,
            connector,
            coordinator,
        })
    }

    fn redirect_uri(&self, provider: ProviderKind) -> Result<String> {
        let app = match provider {
            ProviderKind::Gmail => self.cfg.gmail.as_ref(),
            ProviderKind::Graph => self.cfg.graph.as_ref(),
            ProviderKind::Imap => bail!("imap accounts connect with `connect-imap`"),
        };
        app.map(|a| a.redirect_uri())
            .ok_or_else(|| anyhow!("no [{provider}] section in the config"))
    }
}

fn read_stdin_secret(prompt: &str) -> Result<String> {
    eprintln!("{prompt} (end with Ctrl-D):");
    let mut secret = String::new();
    std::io::stdin().read_to_string(&mut secret)?;
    let secret = secret.trim().to_string();
    if secret.is_empty() {
        bail!("nothing read from stdin");
    }
    Ok(secret)
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::SetClientSecret { client_id } => {
            let secret = read_stdin_secret("Paste client secret")?;
            token_store::save_client_secret(&client_id, &secret)?;
            println!("Saved client secret for client_id {}", client_id);
            Ok(())
        }

        Command::InitVaultKey { force } => {
            if token_store::load_vault_key()?.is_some() && !force {
                bail!("a vault key already exists; pass --force to replace it");
            }
            token_store::save_vault_key(&TokenCipher::generate_key())?;
            println!("Stored a new vault key in the keyring");
            Ok(())
        }

        Command::Connect { provider } => {
            let app = App::build()?;
            let redirect_uri = app.redirect_uri(provider)?;
            let url = app.connector.get_authorization_url(provider)?;

            println!("Opening browser for authorization...");
            if open::that(url.as_str()).is_err() {
                println!("Open this URL in your browser:\n{url}");
            }

            let params = wait_for_redirect(&redirect_uri, Duration::from_secs(300))?;
            let expected = app.connector.pending_state(provider);
            if params.state != expected {
                bail!("authorization state mismatch, refusing the code");
            }
            let account =
                app.connector
                    .exchange_authorization_code(&app.cfg.owner, provider, &params.code)?;
            println!(
                "Connected {} account {} ({})",
                account.provider, account.id, account.address
            );
            Ok(())
        }

        Command::ConnectImap { address } => {
            let app = App::build()?;
            let secret = read_stdin_secret("Paste IMAP password")?;
            let account = app.connector.connect_imap(&app.cfg.owner, &address, &secret)?;
            println!("Connected imap account {} ({})", account.id, account.address);
            Ok(())
        }

        Command::Accounts { json } => {
            let app = App::build()?;
            let accounts = app.repo.list_accounts()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&accounts)?);
                return Ok(());
            }
            for a in accounts {
                let synced = a
                    .last_synced_at
                    .and_then(|t| chrono::DateTime::from_timestamp(t, 0))
                    .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".to_string());
                let count = app.repo.count_messages(Some(a.id))?;
                println!(
                    "{:>4}  {:<6} {:<14} {:<32} {:>6} msgs  last sync {}",
                    a.id,
                    a.provider.as_str(),
                    a.state.as_str(),
                    a.address,
                    count,
                    synced
                );
            }
            Ok(())
        }

        Command::Disconnect { id } => {
            let app = App::build()?;
            app.connector.disconnect(id)?;
            println!("Account {id} disconnected");
            Ok(())
        }

        Command::Sync { account, max } => {
            let app = App::build()?;
            let out = match account {
                Some(id) => {
                    let max = max.unwrap_or(app.cfg.sync.batch_size);
                    serde_json::to_string_pretty(&app.coordinator.sync_one(id, max))?
                }
                None => serde_json::to_string_pretty(&app.coordinator.sync_all()?)?,
            };
            println!("{out}");
            Ok(())
        }

        Command::Daemon { interval } => {
            let app = App::build()?;
            let interval = interval
                .map(|s| Duration::from_secs(s.max(1)))
                .unwrap_or_else(|| app.cfg.sync.interval());

            let (stop_tx, stop_rx) = mpsc::channel();
            ctrlc::set_handler(move || {
                let _ = stop_tx.send(());
            })?;

            let mut scheduler = Scheduler::start(app.coordinator.clone(), interval)?;
            info!("daemon running, Ctrl-C to stop");
            if stop_rx.recv().is_err() {
                warn!("signal handler went away");
            }
            scheduler.stop();
            Ok(())
        }
    }
}
