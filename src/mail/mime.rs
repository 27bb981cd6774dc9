//! Depth-bounded walk over MIME part trees.
//!
//! Both the Gmail JSON payload and `mailparse` output are part trees; the
//! walk is an explicit stack so malformed nesting cannot blow the call stack.

use log::debug;

use crate::domain::email::AttachmentMeta;

/// Nesting deeper than this is ignored.
pub const MAX_PART_DEPTH: usize = 32;

pub trait MimeNode: Sized {
    fn children(&self) -> &[Self];
}

/// Visits every leaf depth-first in document order. `path` is the IMAP-style
/// section number of the leaf (`[1, 2]` is part `1.2`).
pub fn walk_leaves<'a, P: MimeNode>(root: &'a P, mut visit: impl FnMut(&'a P, &[usize])) {
    let mut stack: Vec<(&'a P, Vec<usize>)> = vec![(root, Vec::new())];
    while let Some((part, path)) = stack.pop() {
        let children = part.children();
        if children.is_empty() {
            visit(part, &path);
            continue;
        }
        if path.len() >= MAX_PART_DEPTH {
            debug!("mime tree deeper than {MAX_PART_DEPTH}, skipping subtree");
            continue;
        }
        for (i, child) in children.iter().enumerate().rev() {
            let mut child_path = path.clone();
            child_path.push(i + 1);
            stack.push((child, child_path));
        }
    }
}

/// Deepest multipart nesting in a raw RFC 822 message, found with one pass
/// over its lines and no parsing. Each multipart `Content-Type` opens its
/// boundary; a closing delimiter `--b--` drops back to the level of `b`.
pub fn multipart_depth(raw: &[u8]) -> usize {
    let mut open: Vec<&[u8]> = Vec::new();
    let mut deepest = 0;
    // Inside a multipart Content-Type header still waiting for its boundary.
    let mut pending = false;
    for line in raw.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let continuation = line.first().is_some_and(|b| *b == b' ' || *b == b'\t');
        if !continuation {
            pending = starts_with_ignore_case(line, b"content-type:")
                && contains_ignore_case(line, b"multipart/");
        }
        if pending && let Some(boundary) = boundary_param(line) {
            open.push(boundary);
            deepest = deepest.max(open.len());
            pending = false;
            continue;
        }
        if let Some(closed) = line
            .strip_prefix(b"--")
            .and_then(|l| l.strip_suffix(b"--"))
            && let Some(level) = open.iter().rposition(|b| *b == closed)
        {
            open.truncate(level);
        }
    }
    deepest
}

fn starts_with_ignore_case(line: &[u8], prefix: &[u8]) -> bool {
    line.len() >= prefix.len() && line[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn contains_ignore_case(line: &[u8], needle: &[u8]) -> bool {
    find_ignore_case(line, needle).is_some()
}

fn find_ignore_case(line: &[u8], needle: &[u8]) -> Option<usize> {
    line.windows(needle.len())
        .position(|w| w.eq_ignore_ascii_case(needle))
}

fn boundary_param(line: &[u8]) -> Option<&[u8]> {
    let at = find_ignore_case(line, b"boundary=")? + b"boundary=".len();
    let rest = &line[at..];
    let value = match rest.strip_prefix(b"\"") {
        Some(quoted) => quoted.split(|&b| b == b'"').next(),
        None => rest
            .split(|&b| b == b';' || b.is_ascii_whitespace())
            .next(),
    }?;
    (!value.is_empty()).then_some(value)
}

pub fn section(path: &[usize]) -> String {
    if path.is_empty() {
        return "1".to_string();
    }
    path.iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

/// First plain leaf, first html leaf, every attachment leaf.
#[derive(Debug, Default)]
pub struct PartCollector {
    pub text: Option<String>,
    pub html: Option<String>,
    pub attachments: Vec<AttachmentMeta>,
}

impl PartCollector {
    pub fn offer_body(&mut self, mime_type: &str, content: impl FnOnce() -> Option<String>) {
        match mime_type.to_ascii_lowercase().as_str() {
            "text/plain" if self.text.is_none() => self.text = content(),
            "text/html" if self.html.is_none() => self.html = content(),
            _ => {}
        }
    }

    pub fn add_attachment(&mut self, meta: AttachmentMeta) {
        self.attachments.push(meta);
    }
}
