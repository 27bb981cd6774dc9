//! IMAP adapter.
//!
//! IMAP gives us no continuation token here, so every fetch asks for the
//! newest `limit` messages by sequence number and the store's dedup absorbs
//! the overlap. The incoming cursor is handed back untouched.

use base64::{Engine as _, engine::general_purpose};
use imap::types::Flag;
use log::{debug, warn};
use mailparse::{DispositionType, MailHeaderMap, ParsedMail};
use native_tls::TlsConnector;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::vault::{AccessCredential, CredentialVault};
use crate::config::{ImapAuth, ImapSettings};
use crate::domain::account::{Account, AccountId};
use crate::domain::email::{AttachmentMeta, CanonicalMessage, EmailAddress, EmailBody};
use crate::error::SyncError;
use crate::mail::decoders::{header_addresses, snippet_for};
use crate::mail::mime::{
    MAX_PART_DEPTH, MimeNode, PartCollector, multipart_depth, section, walk_leaves,
};
use crate::mail::{FetchBatch, MailAdapter, with_credential};

const FETCH_QUERY: &str = "(UID FLAGS BODY.PEEK[])";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxStatus {
    pub exists: u32,
    pub uid_validity: u32,
}

/// One fetched message. `body` is absent when the server sent none.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub uid: u32,
    pub flags: Vec<String>,
    pub body: Option<Vec<u8>>,
}

/// An authenticated session on one server.
pub trait MailboxSession {
    fn select(&mut self, mailbox: &str) -> Result<MailboxStatus, SyncError>;
    /// Inclusive sequence-number range.
    fn fetch_range(&mut self, first: u32, last: u32) -> Result<Vec<RawMessage>, SyncError>;
    fn logout(&mut self) -> Result<(), SyncError>;
}

pub trait MailboxConnector: Send + Sync {
    fn open(
        &self,
        address: &str,
        credential: &AccessCredential,
    ) -> Result<Box<dyn MailboxSession>, SyncError>;
}

/// Build canonical auth string as bytes.
fn build_xoauth2_bytes(user: &str, access_token: &str) -> Vec<u8> {
    format!("user={user}\x01auth=Bearer {access_token}\x01\x01").into_bytes()
}

struct OAuth2Authenticator {
    response: Vec<u8>,
}

impl imap::Authenticator for OAuth2Authenticator {
    type Response = Vec<u8>;
    fn process(&self, _challenge: &[u8]) -> Self::Response {
        self.response.clone()
    }
}

type TlsSession = imap::Session<native_tls::TlsStream<TcpStream>>;

fn net_error(e: impl std::fmt::Display) -> SyncError {
    SyncError::TransientNetwork(e.to_string())
}

/// A refused login is a credential problem, anything else is the network's.
fn auth_error(e: imap::Error) -> SyncError {
    match e {
        imap::Error::No(msg) | imap::Error::Bad(msg) => SyncError::Unauthorized(msg),
        other => other.into(),
    }
}

/// TLS connector for one configured server.
pub struct TlsImapConnector {
    host: String,
    port: u16,
    auth: ImapAuth,
    timeout: Duration,
}

impl TlsImapConnector {
    pub fn new(settings: &ImapSettings, timeout: Duration) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            auth: settings.auth,
            timeout,
        }
    }

    fn connect(&self) -> Result<imap::Client<native_tls::TlsStream<TcpStream>>, SyncError> {
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(net_error)?
            .next()
            .ok_or_else(|| net_error(format!("{} did not resolve", self.host)))?;
        let tcp = TcpStream::connect_timeout(&addr, self.timeout).map_err(net_error)?;
        tcp.set_read_timeout(Some(self.timeout)).map_err(net_error)?;
        tcp.set_write_timeout(Some(self.timeout)).map_err(net_error)?;

        let tls = TlsConnector::builder().build().map_err(net_error)?;
        let stream = tls.connect(&self.host, tcp).map_err(net_error)?;
        let mut client = imap::Client::new(stream);
        client.read_greeting()?;
        Ok(client)
    }

    fn xoauth2(
        &self,
        mut client: imap::Client<native_tls::TlsStream<TcpStream>>,
        user: &str,
        access_token: &str,
    ) -> Result<TlsSession, SyncError> {
        let raw_payload = build_xoauth2_bytes(user, access_token);

        // Try RAW first
        let auth_raw = OAuth2Authenticator {
            response: raw_payload.clone(),
        };
        match client.authenticate("XOAUTH2", &auth_raw) {
            Ok(session) => return Ok(session),
            Err((e, returned_client)) => {
                debug!("raw XOAUTH2 refused ({e}), retrying base64");
                client = returned_client;
            }
        }

        // Fallback BASE64
        let auth_b64 = OAuth2Authenticator {
            response: general_purpose::STANDARD.encode(&raw_payload).into_bytes(),
        };
        client
            .authenticate("XOAUTH2", &auth_b64)
            .map_err(|(e, _)| auth_error(e))
    }
}

impl MailboxConnector for TlsImapConnector {
    fn open(
        &self,
        address: &str,
        credential: &AccessCredential,
    ) -> Result<Box<dyn MailboxSession>, SyncError> {
        let client = self.connect()?;
        let session = match self.auth {
            ImapAuth::Password => client
                .login(address, credential.token())
                .map_err(|(e, _)| auth_error(e))?,
            ImapAuth::Xoauth2 => self.xoauth2(client, address, credential.token())?,
        };
        Ok(Box::new(TlsMailboxSession { session }))
    }
}

struct TlsMailboxSession {
    session: TlsSession,
}

fn flag_name(flag: &Flag<'_>) -> String {
    match flag {
        Flag::Seen => "\\Seen".to_string(),
        Flag::Answered => "\\Answered".to_string(),
        Flag::Flagged => "\\Flagged".to_string(),
        Flag::Deleted => "\\Deleted".to_string(),
        Flag::Draft => "\\Draft".to_string(),
        Flag::Recent => "\\Recent".to_string(),
        Flag::Custom(name) => name.to_string(),
        other => format!("{other:?}"),
    }
}

impl MailboxSession for TlsMailboxSession {
    fn select(&mut self, mailbox: &str) -> Result<MailboxStatus, SyncError> {
        let mb = self.session.select(mailbox)?;
        Ok(MailboxStatus {
            exists: mb.exists,
            uid_validity: mb.uid_validity.unwrap_or(0),
        })
    }

    fn fetch_range(&mut self, first: u32, last: u32) -> Result<Vec<RawMessage>, SyncError> {
        let fetches = self
            .session
            .fetch(format!("{first}:{last}"), FETCH_QUERY)?;
        let mut out = Vec::with_capacity(fetches.len());
        for f in fetches.iter() {
            let Some(uid) = f.uid else {
                warn!("imap: sequence {} came back without a UID", f.message);
                continue;
            };
            out.push(RawMessage {
                uid,
                flags: f.flags().iter().map(flag_name).collect(),
                body: f.body().map(<[u8]>::to_vec),
            });
        }
        Ok(out)
    }

    fn logout(&mut self) -> Result<(), SyncError> {
        self.session.logout()?;
        Ok(())
    }
}

pub struct ImapAdapter {
    connector: Arc<dyn MailboxConnector>,
    vault: Arc<CredentialVault>,
    mailbox: String,
}

impl ImapAdapter {
    pub fn new(
        connector: Arc<dyn MailboxConnector>,
        vault: Arc<CredentialVault>,
        mailbox: impl Into<String>,
    ) -> Self {
        Self {
            connector,
            vault,
            mailbox: mailbox.into(),
        }
    }

    fn fetch_newest(
        &self,
        session: &mut dyn MailboxSession,
        account: &Account,
        limit: u32,
    ) -> Result<(MailboxStatus, Vec<RawMessage>), SyncError> {
        let status = session.select(&self.mailbox)?;
        if limit == 0 || status.exists == 0 {
            return Ok((status, Vec::new()));
        }
        let first = status.exists.saturating_sub(limit - 1).max(1);
        debug!(
            "account {}: imap fetching {first}:{} of {}",
            account.id, status.exists, self.mailbox
        );
        let mut raw = session.fetch_range(first, status.exists)?;
        raw.sort_by(|a, b| b.uid.cmp(&a.uid));
        Ok((status, raw))
    }
}

impl MailAdapter for ImapAdapter {
    /// `limit == 0` only logs in and selects the mailbox.
    fn fetch_batch(
        &self,
        account: &Account,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<FetchBatch, SyncError> {
        let (status, raw) = with_credential(&self.vault, account, |cred| {
            let mut session = self.connector.open(&account.address, cred)?;
            let fetched = self.fetch_newest(session.as_mut(), account, limit);
            if let Err(e) = session.logout() {
                debug!("account {}: imap logout: {e}", account.id);
            }
            fetched
        })?;

        let mut batch = FetchBatch {
            cursor: cursor.map(str::to_string),
            ..FetchBatch::default()
        };
        for msg in raw {
            match normalize(account.id, &account.address, status.uid_validity, &msg) {
                Ok(m) => batch.messages.push(m),
                Err(SyncError::MalformedMessage { id, reason }) => {
                    warn!("account {}: skipping imap message {id}: {reason}", account.id);
                    batch.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(batch)
    }

    fn verify_login(&self, account: &Account, secret: &str) -> Result<(), SyncError> {
        let cred = AccessCredential::unsealed(account.id, account.address.as_str(), secret);
        let mut session = self.connector.open(&account.address, &cred)?;
        let selected = session.select(&self.mailbox).map(|_| ());
        if let Err(e) = session.logout() {
            debug!("account {}: imap logout: {e}", account.id);
        }
        selected
    }
}

impl MimeNode for ParsedMail<'_> {
    fn children(&self) -> &[Self] {
        &self.subparts
    }
}

fn attachment_name(part: &ParsedMail<'_>) -> Option<String> {
    let disposition = part.get_content_disposition();
    let name = disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .cloned();
    match (disposition.disposition, name) {
        (DispositionType::Attachment, name) => {
            Some(name.unwrap_or_else(|| "attachment".to_string()))
        }
        (_, Some(name)) if !part.ctype.mimetype.starts_with("text/") => Some(name),
        _ => None,
    }
}

/// Maps one fetched message. `uid_validity` scopes the UID so ids stay
/// unique if the server renumbers the mailbox.
pub fn normalize(
    account_id: AccountId,
    address: &str,
    uid_validity: u32,
    raw: &RawMessage,
) -> Result<CanonicalMessage, SyncError> {
    let message_id = format!("imap:{address}:{uid_validity}:{}", raw.uid);
    let malformed = |reason: String| SyncError::MalformedMessage {
        id: message_id.clone(),
        reason,
    };
    let bytes = raw
        .body
        .as_deref()
        .ok_or_else(|| malformed("server returned no body".to_string()))?;
    // mailparse recurses once per nested multipart.
    let depth = multipart_depth(bytes);
    if depth > MAX_PART_DEPTH {
        return Err(malformed(format!("multipart nesting {depth} deep")));
    }
    let parsed = mailparse::parse_mail(bytes).map_err(|e| malformed(e.to_string()))?;
    if parsed.headers.is_empty() {
        return Err(malformed("no headers".to_string()));
    }

    let mut parts = PartCollector::default();
    walk_leaves(&parsed, |part, path| {
        if let Some(filename) = attachment_name(part) {
            let size = part.get_body_raw().map(|b| b.len() as u64).unwrap_or(0);
            parts.add_attachment(AttachmentMeta {
                filename,
                mime_type: part.ctype.mimetype.clone(),
                size,
                attachment_id: section(path),
            });
            return;
        }
        parts.offer_body(&part.ctype.mimetype, || part.get_body().ok());
    });

    let headers = parsed.get_headers();
    let first_value = |name: &str| {
        headers
            .get_first_value(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    let addresses = |name: &str| {
        headers
            .get_first_header(name)
            .map(header_addresses)
            .unwrap_or_default()
    };

    // Root of the reference chain, so replies group with the first message.
    let thread_id = first_value("References")
        .and_then(|r| r.split_whitespace().next().map(str::to_string))
        .or_else(|| first_value("In-Reply-To"))
        .or_else(|| first_value("Message-ID"))
        .unwrap_or_else(|| message_id.clone());
    let date = first_value("Date")
        .and_then(|d| mailparse::dateparse(&d).ok())
        .unwrap_or(0);

    let text = parts.text.unwrap_or_default();
    let html = parts.html.unwrap_or_default();
    let has_flag = |name: &str| raw.flags.iter().any(|f| f.eq_ignore_ascii_case(name));

    Ok(CanonicalMessage {
        thread_id,
        account_id,
        from: addresses("From")
            .into_iter()
            .next()
            .unwrap_or_else(EmailAddress::default),
        to: addresses("To"),
        cc: addresses("Cc"),
        subject: first_value("Subject").unwrap_or_default(),
        snippet: snippet_for(&text, &html),
        body: EmailBody { text, html },
        date,
        is_read: has_flag("\\Seen"),
        is_starred: has_flag("\\Flagged"),
        has_attachments: !parts.attachments.is_empty(),
        attachments: parts.attachments,
        message_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MULTIPART: &str = "From: \"Site Office\" <office@build.test>\r\n\
To: me@build.test\r\n\
Cc: pm@build.test, qa@build.test\r\n\
Subject: =?UTF-8?B?UGVybWl0IHVwZGF0ZQ==?=\r\n\
Date: Fri, 01 Mar 2024 12:00:00 +0000\r\n\
Message-ID: <m2@build.test>\r\n\
References: <m0@build.test> <m1@build.test>\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Permit approved.\r\n\
--b1\r\n\
Content-Type: application/pdf; name=\"permit.pdf\"\r\n\
Content-Disposition: attachment; filename=\"permit.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0xLjQK\r\n\
--b1--\r\n";

    fn raw(uid: u32, flags: &[&str], body: &str) -> RawMessage {
        RawMessage {
            uid,
            flags: flags.iter().map(|f| f.to_string()).collect(),
            body: Some(body.as_bytes().to_vec()),
        }
    }

    #[test]
    fn normalizes_multipart_message() {
        let m = normalize(4, "me@build.test", 77, &raw(12, &["\\Seen"], MULTIPART)).unwrap();
        assert_eq!(m.message_id, "imap:me@build.test:77:12");
        assert_eq!(m.thread_id, "<m0@build.test>");
        assert_eq!(m.from.name, "Site Office");
        assert_eq!(m.from.address, "office@build.test");
        assert_eq!(m.cc.len(), 2);
        assert_eq!(m.subject, "Permit update");
        assert_eq!(m.body.text.trim(), "Permit approved.");
        assert_eq!(m.snippet, "Permit approved.");
        assert_eq!(m.date, 1_709_294_400);
        assert!(m.is_read);
        assert!(!m.is_starred);
        assert_eq!(m.attachments.len(), 1);
        assert_eq!(m.attachments[0].filename, "permit.pdf");
        assert_eq!(m.attachments[0].attachment_id, "2");
        assert_eq!(m.attachments[0].size, 9);
    }

    #[test]
    fn plain_message_without_thread_headers() {
        let body = "From: a@b.test\r\nSubject: hi\r\n\r\nhello there\r\n";
        let m = normalize(1, "me@b.test", 1, &raw(3, &["\\Flagged"], body)).unwrap();
        assert_eq!(m.thread_id, m.message_id);
        assert!(!m.is_read);
        assert!(m.is_starred);
        assert!(!m.has_attachments);
        assert_eq!(m.snippet, "hello there");
    }

    #[test]
    fn missing_body_is_malformed() {
        let msg = RawMessage {
            uid: 9,
            flags: vec![],
            body: None,
        };
        assert!(matches!(
            normalize(1, "me@b.test", 1, &msg),
            Err(SyncError::MalformedMessage { .. })
        ));
    }

    #[test]
    fn runaway_multipart_nesting_is_malformed() {
        let mut body = String::from("From: a@b.test\r\nSubject: deep\r\n");
        for i in 0..5000 {
            body.push_str(&format!(
                "Content-Type: multipart/mixed; boundary=\"b{i}\"\r\n\r\n--b{i}\r\n"
            ));
        }
        body.push_str("Content-Type: text/plain\r\n\r\nbottom\r\n");
        assert!(matches!(
            normalize(1, "me@b.test", 1, &raw(5, &[], &body)),
            Err(SyncError::MalformedMessage { .. })
        ));
    }

    #[test]
    fn xoauth2_payload_layout() {
        assert_eq!(
            build_xoauth2_bytes("u@x.test", "tok"),
            b"user=u@x.test\x01auth=Bearer tok\x01\x01".to_vec()
        );
    }

    #[test]
    fn refused_login_is_unauthorized() {
        assert!(matches!(
            auth_error(imap::Error::No("AUTHENTICATIONFAILED".into())),
            SyncError::Unauthorized(_)
        ));
    }
}
