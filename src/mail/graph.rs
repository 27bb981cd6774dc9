//! Microsoft Graph mail adapter. Paging follows `@odata.nextLink`.

use chrono::DateTime;
use log::{debug, warn};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use crate::auth::vault::CredentialVault;
use crate::domain::account::{Account, AccountId};
use crate::domain::email::{AttachmentMeta, CanonicalMessage, EmailAddress, EmailBody};
use crate::error::SyncError;
use crate::mail::decoders::{html_to_text, normalize_snippet, snippet_for, SNIPPET_CHARS};
use crate::mail::http::JsonTransport;
use crate::mail::{FetchBatch, MailAdapter, with_credential};

pub const GRAPH_API: &str = "https://graph.microsoft.com/v1.0";

const SELECT: &str = "id,conversationId,subject,bodyPreview,body,from,toRecipients,\
ccRecipients,receivedDateTime,isRead,flag,hasAttachments";

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    value: Vec<Value>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: String,
    conversation_id: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    body_preview: String,
    body: Option<ItemBody>,
    from: Option<Recipient>,
    #[serde(default)]
    to_recipients: Vec<Recipient>,
    #[serde(default)]
    cc_recipients: Vec<Recipient>,
    received_date_time: Option<String>,
    #[serde(default)]
    is_read: bool,
    flag: Option<FollowupFlag>,
    #[serde(default)]
    has_attachments: bool,
    #[serde(default)]
    attachments: Vec<GraphAttachment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemBody {
    #[serde(default)]
    content_type: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Recipient {
    email_address: GraphAddress,
}

#[derive(Debug, Deserialize)]
struct GraphAddress {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FollowupFlag {
    #[serde(default)]
    flag_status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphAttachment {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Me {
    mail: Option<String>,
    user_principal_name: Option<String>,
}

pub struct GraphAdapter {
    transport: Arc<dyn JsonTransport>,
    vault: Arc<CredentialVault>,
    base_url: String,
}

impl GraphAdapter {
    pub fn new(transport: Arc<dyn JsonTransport>, vault: Arc<CredentialVault>) -> Self {
        Self::with_base_url(transport, vault, GRAPH_API)
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

impl MailAdapter for GraphAdapter {
    fn fetch_batch(
        &self,
        account: &Account,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<FetchBatch, SyncError> {
        with_credential(&self.vault, account, |cred| {
            // nextLink already carries every query parameter.
            let listed = match cursor {
                Some(next) => self.transport.get_json(next, &[], cred.token())?,
                None => self.transport.get_json(
                    &format!("{}/me/mailFolders/inbox/messages", self.base_url),
                    &[
                        ("$top", limit.to_string()),
                        ("$orderby", "receivedDateTime desc".to_string()),
                        ("$select", SELECT.to_string()),
                        (
                            "$expand",
                            "attachments($select=id,name,contentType,size)".to_string(),
                        ),
                    ],
                    cred.token(),
                )?,
            };
            let list: ListResponse = serde_json::from_value(listed)
                .map_err(|e| SyncError::Provider(format!("graph list response: {e}")))?;
            debug!(
                "account {}: graph returned {} messages",
                account.id,
                list.value.len()
            );

            let mut batch = FetchBatch {
                cursor: list.next_link,
                ..FetchBatch::default()
            };
            for raw in list.value {
                match normalize(account.id, raw) {
                    Ok(msg) => batch.messages.push(msg),
                    Err(SyncError::MalformedMessage { id, reason }) => {
                        warn!("account {}: skipping graph message {id}: {reason}", account.id);
                        batch.skipped += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(batch)
        })
    }

    fn mailbox_address(&self, access_token: &str) -> Result<String, SyncError> {
        let v = self.transport.get_json(
            &format!("{}/me", self.base_url),
            &[("$select", "mail,userPrincipalName".to_string())],
            access_token,
        )?;
        let me: Me = serde_json::from_value(v)
            .map_err(|e| SyncError::Provider(format!("graph profile: {e}")))?;
        me.mail
            .or(me.user_principal_name)
            .filter(|a| !a.is_empty())
            .ok_or_else(|| SyncError::Provider("graph profile has no address".to_string()))
    }
}

fn address(r: Recipient) -> EmailAddress {
    EmailAddress {
        name: r.email_address.name.unwrap_or_default(),
        address: r.email_address.address.unwrap_or_default(),
    }
}

fn normalize(account_id: AccountId, raw: Value) -> Result<CanonicalMessage, SyncError> {
    let hint = raw
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or("<unknown>")
        .to_string();
    let msg: GraphMessage = serde_json::from_value(raw).map_err(|e| SyncError::MalformedMessage {
        id: hint,
        reason: e.to_string(),
    })?;

    let date = match msg.received_date_time.as_deref() {
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map_err(|e| SyncError::MalformedMessage {
                id: msg.id.clone(),
                reason: format!("receivedDateTime {s:?}: {e}"),
            })?
            .timestamp(),
        None => 0,
    };

    let (text, html) = match msg.body {
        Some(b) if b.content_type.eq_ignore_ascii_case("html") => {
            (html_to_text(&b.content), b.content)
        }
        Some(b) => (b.content, String::new()),
        None => (String::new(), String::new()),
    };
    let snippet = match msg.body_preview.trim() {
        "" => snippet_for(&text, &html),
        preview => normalize_snippet(preview, SNIPPET_CHARS),
    };

    let attachments: Vec<AttachmentMeta> = msg
        .attachments
        .into_iter()
        .map(|a| AttachmentMeta {
            filename: a.name,
            mime_type: a
                .content_type
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            size: a.size,
            attachment_id: a.id,
        })
        .collect();

    Ok(CanonicalMessage {
        thread_id: msg.conversation_id.unwrap_or_else(|| msg.id.clone()),
        account_id,
        from: msg.from.map(address).unwrap_or_default(),
        to: msg.to_recipients.into_iter().map(address).collect(),
        cc: msg.cc_recipients.into_iter().map(address).collect(),
        subject: msg.subject.unwrap_or_default(),
        body: EmailBody { text, html },
        snippet,
        date,
        is_read: msg.is_read,
        is_starred: msg
            .flag
            .is_some_and(|f| f.flag_status.eq_ignore_ascii_case("flagged")),
        has_attachments: msg.has_attachments || !attachments.is_empty(),
        attachments,
        message_id: msg.id,
    })
}
