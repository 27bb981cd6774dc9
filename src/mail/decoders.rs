use base64::{Engine as _, engine::general_purpose};
use mailparse::{MailAddr, MailHeader};

use crate::domain::email::EmailAddress;

pub const SNIPPET_CHARS: usize = 140;

pub fn normalize_snippet(s: &str, max_chars: usize) -> String {
    let mut out = String::new();
    for line in s.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(line);
        if out.chars().count() >= max_chars {
            break;
        }
    }
    out.chars().take(max_chars).collect()
}

/// Snippet from the plain body, or from the rendered html when there is none.
pub fn snippet_for(text: &str, html: &str) -> String {
    if !text.trim().is_empty() {
        return normalize_snippet(text, SNIPPET_CHARS);
    }
    normalize_snippet(&html_to_text(html), SNIPPET_CHARS)
}

pub fn html_to_text(html: &str) -> String {
    if html.is_empty() {
        return String::new();
    }
    html2text::from_read(html.as_bytes(), 100).unwrap_or_else(|_| strip_html_minimal(html))
}

fn strip_html_minimal(html: &str) -> String {
    let mut out = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out
}

/// Gmail body blocks are base64url; some senders keep the `=` padding.
pub fn decode_base64url(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let trimmed: String = data
        .trim_end_matches('=')
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    general_purpose::URL_SAFE_NO_PAD.decode(trimmed)
}

/// Decodes RFC 2047 encoded-words in a bare header value.
pub fn decode_mime_words(raw: &str) -> String {
    let mut line = b"X: ".to_vec();
    line.extend_from_slice(raw.as_bytes());
    line.extend_from_slice(b"\r\n");

    match mailparse::parse_header(&line) {
        Ok((h, _idx)) => h.get_value(),
        Err(_) => raw.to_string(),
    }
}

/// Parses `"Name" <a@b>, c@d` style lists. Unparsable input yields one
/// entry carrying the raw text as the address.
pub fn parse_address_list(raw: &str) -> Vec<EmailAddress> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    match mailparse::addrparse(raw) {
        Ok(list) => flatten_addrs(list.iter()),
        Err(_) => vec![EmailAddress {
            name: String::new(),
            address: raw.to_string(),
        }],
    }
}

/// Same as [`parse_address_list`] for an already parsed header.
pub fn header_addresses(header: &MailHeader<'_>) -> Vec<EmailAddress> {
    match mailparse::addrparse_header(header) {
        Ok(list) => flatten_addrs(list.iter()),
        Err(_) => parse_address_list(&header.get_value()),
    }
}

fn flatten_addrs<'a>(addrs: impl Iterator<Item = &'a MailAddr>) -> Vec<EmailAddress> {
    let mut out = Vec::new();
    for addr in addrs {
        match addr {
            MailAddr::Single(info) => out.push(EmailAddress {
                name: info.display_name.clone().unwrap_or_default(),
                address: info.addr.clone(),
            }),
            MailAddr::Group(group) => out.extend(group.addrs.iter().map(|info| EmailAddress {
                name: info.display_name.clone().unwrap_or_default(),
                address: info.addr.clone(),
            })),
        }
    }
    out
}
