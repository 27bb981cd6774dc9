use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::domain::account::{Account, AccountId, AccountState, CredentialBundle, ProviderKind};
use crate::domain::email::{CanonicalMessage, EmailAddress, EmailBody, UpsertOutcome};
use crate::error::SyncError;
use crate::store::repo::{MailRepository, StoreResult};

const ACCOUNT_COLUMNS: &str =
    "id, owner, provider, address, expires_at, cursor, last_synced_at, state";

pub struct SqliteRepo {
    conn: Mutex<Connection>,
}

impl SqliteRepo {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.migrate()?;
        Ok(repo)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let repo = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        repo.migrate()?;
        Ok(repo)
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SyncError::Persistence("connection mutex poisoned".to_string()))
    }

    fn migrate(&self) -> StoreResult<()> {
        self.conn()?.execute_batch(
            r#"
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS accounts (
                id                 INTEGER PRIMARY KEY AUTOINCREMENT,
                owner              TEXT NOT NULL,
                provider           TEXT NOT NULL,
                address            TEXT NOT NULL,
                access_token_enc   TEXT,
                refresh_token_enc  TEXT,
                expires_at         INTEGER,
                cursor             TEXT,
                last_synced_at     INTEGER,
                state              TEXT NOT NULL,
                UNIQUE (owner, provider, address)
            );

            CREATE TABLE IF NOT EXISTS messages (
                message_id       TEXT PRIMARY KEY,
                account_id       INTEGER NOT NULL REFERENCES accounts(id),
                thread_id        TEXT NOT NULL,
                from_name        TEXT NOT NULL,
                from_address     TEXT NOT NULL,
                to_json          TEXT NOT NULL,
                cc_json          TEXT NOT NULL,
                subject          TEXT NOT NULL,
                body_text        TEXT NOT NULL,
                body_html        TEXT NOT NULL,
                snippet          TEXT NOT NULL,
                date_epoch       INTEGER NOT NULL,
                is_read          INTEGER NOT NULL,
                is_starred       INTEGER NOT NULL,
                has_attachments  INTEGER NOT NULL,
                attachments_json TEXT NOT NULL,
                classification   TEXT
            );

            CREATE INDEX IF NOT EXISTS messages_by_account
                ON messages (account_id, date_epoch DESC);
            "#,
        )?;
        Ok(())
    }

    fn account_in(conn: &Connection, id: AccountId) -> StoreResult<Option<Account>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id=?1");
        Ok(conn.query_row(&sql, params![id], account_from_row).optional()?)
    }
}

fn conversion_error(col: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, msg.into())
}

fn account_from_row(r: &Row<'_>) -> rusqlite::Result<Account> {
    let provider: String = r.get(2)?;
    let state: String = r.get(7)?;
    Ok(Account {
        id: r.get(0)?,
        owner: r.get(1)?,
        provider: provider.parse().map_err(|e| conversion_error(2, e))?,
        address: r.get(3)?,
        expires_at: r.get(4)?,
        cursor: r.get(5)?,
        last_synced_at: r.get(6)?,
        state: state.parse().map_err(|e| conversion_error(7, e))?,
    })
}

impl MailRepository for SqliteRepo {
    fn begin_connect(
        &self,
        owner: &str,
        provider: ProviderKind,
        address: &str,
    ) -> StoreResult<Account> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO accounts (owner, provider, address, state)
            VALUES (?1, ?2, ?3, 'connecting')
            ON CONFLICT(owner, provider, address) DO NOTHING
            "#,
            params![owner, provider.as_str(), address],
        )?;
        // Reconnecting a failed or disabled account restarts its lifecycle;
        // a live account keeps its state and only gets new credentials.
        tx.execute(
            r#"
            UPDATE accounts SET state='connecting'
            WHERE owner=?1 AND provider=?2 AND address=?3
              AND state IN ('error', 'disabled')
            "#,
            params![owner, provider.as_str(), address],
        )?;
        let sql = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE owner=?1 AND provider=?2 AND address=?3"
        );
        let account = tx.query_row(
            &sql,
            params![owner, provider.as_str(), address],
            account_from_row,
        )?;
        tx.commit()?;
        Ok(account)
    }

    fn get_account(&self, id: AccountId) -> StoreResult<Option<Account>> {
        Self::account_in(&*self.conn()?, id)
    }

    fn list_accounts(&self) -> StoreResult<Vec<Account>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY id");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], account_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn list_enabled_accounts(&self) -> StoreResult<Vec<Account>> {
        Ok(self
            .list_accounts()?
            .into_iter()
            .filter(|a| a.state.is_enabled())
            .collect())
    }

    fn set_state(&self, id: AccountId, to: AccountState) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let current = Self::account_in(&tx, id)?.ok_or(SyncError::AccountNotFound(id))?;
        if !current.state.can_transition(to) {
            return Err(SyncError::InvalidTransition {
                from: current.state,
                to,
            });
        }
        tx.execute(
            "UPDATE accounts SET state=?2 WHERE id=?1",
            params![id, to.as_str()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn load_credentials(&self, id: AccountId) -> StoreResult<Option<CredentialBundle>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT access_token_enc, refresh_token_enc, expires_at FROM accounts WHERE id=?1",
                params![id],
                |r| {
                    Ok((
                        r.get::<_, Option<String>>(0)?,
                        r.get::<_, Option<String>>(1)?,
                        r.get::<_, Option<i64>>(2)?,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Err(SyncError::AccountNotFound(id)),
            Some((None, _, _)) => Ok(None),
            Some((Some(access), refresh, expires_at)) => Ok(Some(CredentialBundle {
                access_token_enc: access,
                refresh_token_enc: refresh,
                expires_at,
            })),
        }
    }

    fn store_credentials(&self, id: AccountId, bundle: &CredentialBundle) -> StoreResult<()> {
        let changed = self.conn()?.execute(
            r#"
            UPDATE accounts
            SET access_token_enc=?2, refresh_token_enc=?3, expires_at=?4
            WHERE id=?1
            "#,
            params![
                id,
                bundle.access_token_enc,
                bundle.refresh_token_enc,
                bundle.expires_at
            ],
        )?;
        if changed == 0 {
            return Err(SyncError::AccountNotFound(id));
        }
        Ok(())
    }

    fn load_cursor(&self, id: AccountId) -> StoreResult<Option<String>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT cursor FROM accounts WHERE id=?1",
            params![id],
            |r| r.get::<_, Option<String>>(0),
        )
        .optional()?
        .ok_or(SyncError::AccountNotFound(id))
    }

    fn commit_cursor(&self, id: AccountId, cursor: Option<&str>) -> StoreResult<()> {
        self.conn()?.execute(
            "UPDATE accounts SET cursor=?2 WHERE id=?1",
            params![id, cursor],
        )?;
        Ok(())
    }

    fn mark_synced(&self, id: AccountId, at_epoch: i64) -> StoreResult<()> {
        self.conn()?.execute(
            "UPDATE accounts SET last_synced_at=?2 WHERE id=?1",
            params![id, at_epoch],
        )?;
        Ok(())
    }

    fn upsert_message(&self, msg: &CanonicalMessage) -> StoreResult<UpsertOutcome> {
        let to_json = serde_json::to_string(&msg.to)?;
        let cc_json = serde_json::to_string(&msg.cc)?;
        let attachments_json = serde_json::to_string(&msg.attachments)?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        // Existing rows only get their flags refreshed.
        let flagged = tx.execute(
            "UPDATE messages SET is_read=?2, is_starred=?3 WHERE message_id=?1",
            params![msg.message_id, msg.is_read, msg.is_starred],
        )?;
        if flagged > 0 {
            tx.commit()?;
            return Ok(UpsertOutcome::AlreadyPresent);
        }

        let inserted = tx.execute(
            r#"
            INSERT INTO messages (
                message_id, account_id, thread_id, from_name, from_address,
                to_json, cc_json, subject, body_text, body_html, snippet,
                date_epoch, is_read, is_starred, has_attachments, attachments_json
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            "#,
            params![
                msg.message_id,
                msg.account_id,
                msg.thread_id,
                msg.from.name,
                msg.from.address,
                to_json,
                cc_json,
                msg.subject,
                msg.body.text,
                msg.body.html,
                msg.snippet,
                msg.date,
                msg.is_read,
                msg.is_starred,
                msg.has_attachments,
                attachments_json
            ],
        );
        match inserted {
            Ok(_) => {
                tx.commit()?;
                Ok(UpsertOutcome::Inserted)
            }
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Ok(UpsertOutcome::AlreadyPresent)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get_message(&self, message_id: &str) -> StoreResult<Option<CanonicalMessage>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                r#"
                SELECT message_id, account_id, thread_id, from_name, from_address,
                       to_json, cc_json, subject, body_text, body_html, snippet,
                       date_epoch, is_read, is_starred, has_attachments, attachments_json
                FROM messages WHERE message_id=?1
                "#,
                params![message_id],
                |r| {
                    Ok((
                        CanonicalMessage {
                            message_id: r.get(0)?,
                            account_id: r.get(1)?,
                            thread_id: r.get(2)?,
                            from: EmailAddress {
                                name: r.get(3)?,
                                address: r.get(4)?,
                            },
                            to: Vec::new(),
                            cc: Vec::new(),
                            subject: r.get(7)?,
                            body: EmailBody {
                                text: r.get(8)?,
                                html: r.get(9)?,
                            },
                            snippet: r.get(10)?,
                            date: r.get(11)?,
                            is_read: r.get(12)?,
                            is_starred: r.get(13)?,
                            has_attachments: r.get(14)?,
                            attachments: Vec::new(),
                        },
                        r.get::<_, String>(5)?,
                        r.get::<_, String>(6)?,
                        r.get::<_, String>(15)?,
                    ))
                },
            )
            .optional()?;

        let Some((mut msg, to_json, cc_json, attachments_json)) = row else {
            return Ok(None);
        };
        msg.to = serde_json::from_str(&to_json)?;
        msg.cc = serde_json::from_str(&cc_json)?;
        msg.attachments = serde_json::from_str(&attachments_json)?;
        Ok(Some(msg))
    }

    fn count_messages(&self, account: Option<AccountId>) -> StoreResult<usize> {
        let conn = self.conn()?;
        let n: i64 = match account {
            Some(id) => conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE account_id=?1",
                params![id],
                |r| r.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?,
        };
        Ok(n as usize)
    }

    fn set_classification(&self, message_id: &str, label: &str) -> StoreResult<()> {
        self.conn()?.execute(
            "UPDATE messages SET classification=?2 WHERE message_id=?1",
            params![message_id, label],
        )?;
        Ok(())
    }
}
