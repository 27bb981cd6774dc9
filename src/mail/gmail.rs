//! Gmail REST adapter: list ids, then fetch each message in full.

use log::{debug, warn};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use crate::auth::vault::CredentialVault;
use crate::domain::account::{Account, AccountId};
use crate::domain::email::{AttachmentMeta, CanonicalMessage, EmailAddress, EmailBody};
use crate::error::SyncError;
use crate::mail::decoders::{decode_base64url, decode_mime_words, parse_address_list, snippet_for};
use crate::mail::http::JsonTransport;
use crate::mail::mime::{MimeNode, PartCollector, walk_leaves};
use crate::mail::{FetchBatch, MailAdapter, with_credential};

pub const GMAIL_API: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    thread_id: Option<String>,
    #[serde(default)]
    label_ids: Vec<String>,
    #[serde(default)]
    snippet: String,
    internal_date: Option<String>,
    payload: Option<MessagePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePart {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    headers: Vec<Header>,
    #[serde(default)]
    body: PartBody,
    #[serde(default)]
    parts: Vec<MessagePart>,
}

impl MimeNode for MessagePart {
    fn children(&self) -> &[Self] {
        &self.parts
    }
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartBody {
    #[serde(default)]
    size: u64,
    data: Option<String>,
    attachment_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Profile {
    email_address: String,
}

pub struct GmailAdapter {
    transport: Arc<dyn JsonTransport>,
    vault: Arc<CredentialVault>,
    base_url: String,
}

impl GmailAdapter {
    pub fn new(transport: Arc<dyn JsonTransport>, vault: Arc<CredentialVault>) -> Self {
        Self::with_base_url(transport, vault, GMAIL_API)
    }

    pub fn with_base_url(
        transport: Arc<dyn JsonTransport>,
        vault: Arc<CredentialVault>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            vault,
            base_url: base_url.into(),
        }
    }
}

impl MailAdapter for GmailAdapter {
    fn fetch_batch(
        &self,
        account: &Account,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<FetchBatch, SyncError> {
        with_credential(&self.vault, account, |cred| {
            let mut query = vec![("maxResults", limit.to_string())];
            if let Some(token) = cursor {
                query.push(("pageToken", token.to_string()));
            }
            let listed = self.transport.get_json(
                &format!("{}/messages", self.base_url),
                &query,
                cred.token(),
            )?;
            let list: ListResponse = serde_json::from_value(listed)
                .map_err(|e| SyncError::Provider(format!("gmail list response: {e}")))?;
            debug!(
                "account {}: gmail listed {} ids",
                account.id,
                list.messages.len()
            );

            let mut batch = FetchBatch {
                cursor: list.next_page_token,
                ..FetchBatch::default()
            };
            for r in list.messages {
                let fetched = self.transport.get_json(
                    &format!("{}/messages/{}", self.base_url, r.id),
                    &[("format", "full".to_string())],
                    cred.token(),
                );
                // Deleted between the list and the get.
                let full = match fetched {
                    Ok(v) => v,
                    Err(SyncError::NotFound(reason)) => {
                        warn!("account {}: gmail message {} is gone: {reason}", account.id, r.id);
                        batch.skipped += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                match normalize(account.id, full) {
                    Ok(msg) => batch.messages.push(msg),
                    Err(SyncError::MalformedMessage { id, reason }) => {
                        warn!("account {}: skipping gmail message {id}: {reason}", account.id);
                        batch.skipped += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(batch)
        })
    }

    fn mailbox_address(&self, access_token: &str) -> Result<String, SyncError> {
        let v = self
            .transport
            .get_json(&format!("{}/profile", self.base_url), &[], access_token)?;
        let profile: Profile = serde_json::from_value(v)
            .map_err(|e| SyncError::Provider(format!("gmail profile: {e}")))?;
        Ok(profile.email_address)
    }
}

fn normalize(account_id: AccountId, raw: Value) -> Result<CanonicalMessage, SyncError> {
    let hint = raw
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or("<unknown>")
        .to_string();
    let msg: GmailMessage = serde_json::from_value(raw).map_err(|e| SyncError::MalformedMessage {
        id: hint,
        reason: e.to_string(),
    })?;
    let malformed = |reason: String| SyncError::MalformedMessage {
        id: msg.id.clone(),
        reason,
    };

    let payload = msg
        .payload
        .as_ref()
        .ok_or_else(|| malformed("no payload".to_string()))?;
    let header = |name: &str| {
        payload
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
            .unwrap_or("")
    };

    let mut parts = PartCollector::default();
    let mut decode_error = None;
    walk_leaves(payload, |part, _path| {
        let body = &part.body;
        if !part.filename.is_empty() && body.data.is_none() {
            if let Some(attachment_id) = &body.attachment_id {
                parts.add_attachment(AttachmentMeta {
                    filename: part.filename.clone(),
                    mime_type: part.mime_type.clone(),
                    size: body.size,
                    attachment_id: attachment_id.clone(),
                });
            }
            return;
        }
        parts.offer_body(&part.mime_type, || {
            let data = body.data.as_deref()?;
            match decode_base64url(data) {
                Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
                Err(e) => {
                    decode_error = Some(format!("{} body: {e}", part.mime_type));
                    None
                }
            }
        });
    });
    if let Some(reason) = decode_error {
        return Err(malformed(reason));
    }

    let text = parts.text.unwrap_or_default();
    let html = parts.html.unwrap_or_default();
    let snippet = match snippet_for(&text, &html) {
        s if s.is_empty() => msg.snippet.clone(),
        s => s,
    };
    let date = msg
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .map(|ms| ms / 1000)
        .or_else(|| mailparse::dateparse(header("Date")).ok())
        .unwrap_or(0);
    let from = parse_address_list(header("From"))
        .into_iter()
        .next()
        .unwrap_or_else(EmailAddress::default);

    Ok(CanonicalMessage {
        thread_id: msg.thread_id.clone().unwrap_or_else(|| msg.id.clone()),
        account_id,
        from,
        to: parse_address_list(header("To")),
        cc: parse_address_list(header("Cc")),
        subject: decode_mime_words(header("Subject")),
        body: EmailBody { text, html },
        snippet,
        date,
        is_read: !msg.label_ids.iter().any(|l| l == "UNREAD"),
        is_starred: msg.label_ids.iter().any(|l| l == "STARRED"),
        has_attachments: !parts.attachments.is_empty(),
        attachments: parts.attachments,
        message_id: msg.id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::oauth::TokenSet;
    use crate::auth::vault::tests::{CountingExchange, FixedClock, TEST_KEY};
    use crate::domain::account::{AccountState, ProviderKind};
    use crate::mail::http::tests::Scripted;
    use crate::store::repo::MailRepository;
    use crate::store::sqlite::SqliteRepo;
    use serde_json::json;
    use std::sync::atomic::{AtomicI64, AtomicUsize};

    fn setup() -> (Arc<Scripted>, GmailAdapter, Account) {
        let repo = Arc::new(SqliteRepo::open_in_memory().unwrap());
        let exchange = Arc::new(CountingExchange {
            refreshes: AtomicUsize::new(0),
            fail: false,
        });
        let clock = Arc::new(FixedClock(AtomicI64::new(1_000)));
        let vault =
            Arc::new(CredentialVault::new(TEST_KEY, repo.clone(), exchange, clock).unwrap());
        let account = repo
            .begin_connect("o", ProviderKind::Gmail, "crew@example.com")
            .unwrap();
        repo.set_state(account.id, AccountState::Active).unwrap();
        vault
            .store(
                account.id,
                &TokenSet {
                    access_token: "access-1".into(),
                    refresh_token: Some("refresh-1".into()),
                    expires_in: Some(3600),
                },
            )
            .unwrap();
        let account = repo.get_account(account.id).unwrap().unwrap();
        let transport = Arc::new(Scripted::default());
        let adapter = GmailAdapter::with_base_url(transport.clone(), vault, "https://gmail.test");
        (transport, adapter, account)
    }

    fn b64(s: &str) -> String {
        use base64::Engine as _;
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(s)
    }

    fn full_message() -> Value {
        json!({
            "id": "18c1",
            "threadId": "18c0",
            "labelIds": ["INBOX", "STARRED"],
            "snippet": "provider snippet",
            "internalDate": "1700000000123",
            "payload": {
                "mimeType": "multipart/mixed",
                "headers": [
                    {"name": "From", "value": "\"Dana Client\" <dana@example.com>"},
                    {"name": "To", "value": "crew@example.com"},
                    {"name": "cc", "value": "a@example.com, b@example.com"},
                    {"name": "Subject", "value": "Kitchen remodel"}
                ],
                "body": {"size": 0},
                "parts": [
                    {
                        "mimeType": "multipart/alternative",
                        "body": {"size": 0},
                        "parts": [
                            {"mimeType": "text/plain", "body": {"size": 11, "data": b64("Need a quote")}},
                            {"mimeType": "text/html", "body": {"size": 20, "data": b64("<p>Need a quote</p>")}}
                        ]
                    },
                    {
                        "mimeType": "application/pdf",
                        "filename": "plans.pdf",
                        "body": {"size": 2048, "attachmentId": "ANGjdJ"}
                    }
                ]
            }
        })
    }

    #[test]
    fn normalizes_full_message() {
        let m = normalize(3, full_message()).unwrap();
        assert_eq!(m.message_id, "18c1");
        assert_eq!(m.thread_id, "18c0");
        assert_eq!(m.account_id, 3);
        assert_eq!(m.from.name, "Dana Client");
        assert_eq!(m.from.address, "dana@example.com");
        assert_eq!(m.to.len(), 1);
        assert_eq!(m.cc.len(), 2);
        assert_eq!(m.subject, "Kitchen remodel");
        assert_eq!(m.body.text, "Need a quote");
        assert_eq!(m.body.html, "<p>Need a quote</p>");
        assert_eq!(m.snippet, "Need a quote");
        assert_eq!(m.date, 1_700_000_000);
        assert!(m.is_read);
        assert!(m.is_starred);
        assert!(m.has_attachments);
        assert_eq!(m.attachments[0].filename, "plans.pdf");
        assert_eq!(m.attachments[0].attachment_id, "ANGjdJ");
        assert_eq!(m.attachments[0].size, 2048);
    }

    #[test]
    fn lists_then_fetches_each_message_in_full() {
        let (transport, adapter, account) = setup();
        transport.push(Ok(json!({
            "messages": [{"id": "18c1", "threadId": "18c0"}, {"id": "bad1", "threadId": "bad1"}],
            "nextPageToken": "page-2"
        })));
        transport.push(Ok(full_message()));
        transport.push(Ok(json!({"id": "bad1"})));

        let batch = adapter.fetch_batch(&account, Some("page-1"), 2).unwrap();
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.messages[0].message_id, "18c1");
        assert_eq!(batch.messages[0].account_id, account.id);
        assert_eq!(batch.skipped, 1);
        assert_eq!(batch.cursor.as_deref(), Some("page-2"));

        let calls = transport.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        let (url, query, bearer) = &calls[0];
        assert_eq!(url, "https://gmail.test/messages");
        assert!(query.contains(&("maxResults".to_string(), "2".to_string())));
        assert!(query.contains(&("pageToken".to_string(), "page-1".to_string())));
        assert_eq!(bearer, "access-1");
        assert_eq!(calls[1].0, "https://gmail.test/messages/18c1");
        assert_eq!(calls[1].1, vec![("format".to_string(), "full".to_string())]);
        assert_eq!(calls[2].0, "https://gmail.test/messages/bad1");
    }

    #[test]
    fn message_deleted_after_listing_is_skipped() {
        let (transport, adapter, account) = setup();
        transport.push(Ok(json!({"messages": [{"id": "gone1"}, {"id": "18c1"}]})));
        transport.push(Err(SyncError::NotFound("404 Not Found".into())));
        transport.push(Ok(full_message()));

        let batch = adapter.fetch_batch(&account, None, 10).unwrap();
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.skipped, 1);
        assert_eq!(batch.cursor, None);
    }

    #[test]
    fn other_fetch_failures_abort_the_batch() {
        let (transport, adapter, account) = setup();
        transport.push(Ok(json!({"messages": [{"id": "18c1"}]})));
        transport.push(Err(SyncError::TransientNetwork("reset".into())));
        assert!(matches!(
            adapter.fetch_batch(&account, None, 10),
            Err(SyncError::TransientNetwork(_))
        ));
    }

    #[test]
    fn unread_label_clears_read_flag() {
        let mut raw = full_message();
        raw["labelIds"] = json!(["INBOX", "UNREAD"]);
        let m = normalize(1, raw).unwrap();
        assert!(!m.is_read);
        assert!(!m.is_starred);
    }

    #[test]
    fn inline_part_with_filename_is_not_an_attachment() {
        let mut raw = full_message();
        raw["payload"]["parts"][1]["body"] = json!({"size": 3, "data": b64("abc")});
        let m = normalize(1, raw).unwrap();
        assert!(!m.has_attachments);
    }

    #[test]
    fn missing_payload_is_malformed() {
        let err = normalize(1, json!({"id": "x1"})).unwrap_err();
        assert!(matches!(err, SyncError::MalformedMessage { ref id, .. } if id == "x1"));
    }

    #[test]
    fn undecodable_body_is_malformed() {
        let mut raw = full_message();
        raw["payload"]["parts"][0]["parts"][0]["body"]["data"] = json!("***");
        assert!(matches!(
            normalize(1, raw),
            Err(SyncError::MalformedMessage { .. })
        ));
    }
}
