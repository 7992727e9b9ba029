//! Turns raw provider payloads (RFC 822 bytes, address headers) into the
//! canonical message model.

use crate::ProviderError;
use chrono::{DateTime, TimeZone, Utc};
use harbor_core::{AttachmentMeta, MailAddress, MailMessage, MessageFlags};
use mailparse::{parse_mail, MailAddr, ParsedMail};
use regex::Regex;
use std::sync::OnceLock;
use uuid::Uuid;

const SNIPPET_LEN: usize = 200;
pub const NO_SUBJECT: &str = "(No subject)";

/// Headers, bodies and attachment metadata of one parsed RFC 822 message.
#[derive(Debug, Clone, Default)]
pub struct ParsedEnvelope {
    pub from: Option<MailAddress>,
    pub to: Vec<MailAddress>,
    pub cc: Vec<MailAddress>,
    pub bcc: Vec<MailAddress>,
    pub reply_to: Vec<MailAddress>,
    pub subject: Option<String>,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub attachments: Vec<AttachmentMeta>,
    pub date: Option<DateTime<Utc>>,
}

pub fn parse_rfc822(raw: &[u8]) -> Result<ParsedEnvelope, ProviderError> {
    let parsed = parse_mail(raw)?;
    let header_addresses = |key: &str| {
        header_value(&parsed, key)
            .map(|value| parse_address_list(&value))
            .unwrap_or_default()
    };

    let mut attachments = Vec::new();
    collect_attachments(&parsed, &mut attachments);

    Ok(ParsedEnvelope {
        from: header_addresses("From").into_iter().next(),
        to: header_addresses("To"),
        cc: header_addresses("Cc"),
        bcc: header_addresses("Bcc"),
        reply_to: header_addresses("Reply-To"),
        subject: header_value(&parsed, "Subject"),
        message_id: header_value(&parsed, "Message-ID"),
        in_reply_to: header_value(&parsed, "In-Reply-To"),
        references: header_value(&parsed, "References"),
        body_text: extract_text_body(&parsed),
        body_html: extract_html_body(&parsed),
        attachments,
        date: parsed_message_date(&parsed),
    })
}

/// Parses a single address, e.g. `"Ada" <ada@example.org>` or a bare address.
pub fn parse_address(raw: &str) -> Option<MailAddress> {
    parse_address_list(raw).into_iter().next()
}

/// RFC 5322 address list. Group syntax is flattened. Input mailparse refuses is
/// split on commas instead so one malformed entry does not lose the rest.
pub fn parse_address_list(raw: &str) -> Vec<MailAddress> {
    if raw.trim().is_empty() {
        return Vec::new();
    }

    match mailparse::addrparse(raw) {
        Ok(list) => list
            .iter()
            .flat_map(|entry| match entry {
                MailAddr::Single(single) => vec![(single.addr.clone(), single.display_name.clone())],
                MailAddr::Group(group) => group
                    .addrs
                    .iter()
                    .map(|single| (single.addr.clone(), single.display_name.clone()))
                    .collect(),
            })
            .filter(|(address, _)| !address.trim().is_empty())
            .map(|(address, name)| MailAddress::new(address, name))
            .collect(),
        Err(_) => split_address_list(raw),
    }
}

fn split_address_list(raw: &str) -> Vec<MailAddress> {
    raw.split(',')
        .filter_map(|segment| {
            let value = segment.trim();
            if value.is_empty() {
                return None;
            }

            let lt = value.rfind('<');
            let gt = value.rfind('>');
            if let (Some(lt), Some(gt)) = (lt, gt) {
                if lt < gt {
                    let name = value[..lt].trim().to_string();
                    let address = value[lt + 1..gt].trim();
                    if address.is_empty() {
                        return None;
                    }
                    return Some(MailAddress::new(address, Some(name)));
                }
            }

            Some(MailAddress::new(value.trim_matches('"'), None))
        })
        .collect()
}

/// Whitespace-collapsed preview of at most 200 characters.
pub fn snippet_from(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(SNIPPET_LEN)
        .collect()
}

/// Crude tag removal, only good enough for building a preview.
pub fn html_to_preview_text(html: &str) -> String {
    static TAGS: OnceLock<Regex> = OnceLock::new();
    static HIDDEN: OnceLock<Regex> = OnceLock::new();

    let hidden = HIDDEN.get_or_init(|| {
        Regex::new(r"(?is)<(script|style|head)[^>]*>.*?</(script|style|head)>")
            .expect("valid hidden block regex")
    });
    let tags = TAGS.get_or_init(|| Regex::new(r"(?s)<[^>]*>").expect("valid tag regex"));

    let without_hidden = hidden.replace_all(html, " ");
    tags.replace_all(&without_hidden, " ")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}

/// Provider-independent fields of a message before it is bound to an account.
#[derive(Debug, Clone)]
pub struct MessageParts {
    pub external_id: String,
    pub envelope: ParsedEnvelope,
    pub flags: MessageFlags,
    pub labels: Vec<String>,
    /// Provider-side preview, preferred over one derived from the body.
    pub preview: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
}

/// Builds the canonical message. Missing dates fall back to each other and then to now;
/// a message without any body gets an empty text body.
pub fn build_message(account_id: Uuid, parts: MessageParts) -> MailMessage {
    let MessageParts {
        external_id,
        envelope,
        flags,
        labels,
        preview,
        received_at,
    } = parts;

    let now = Utc::now();
    let sent_at = envelope.date.or(received_at).unwrap_or(now);
    let received_at = received_at.or(envelope.date).unwrap_or(now);

    let snippet = preview
        .filter(|preview| !preview.trim().is_empty())
        .map(|preview| snippet_from(&preview))
        .or_else(|| envelope.body_text.as_deref().map(snippet_from))
        .or_else(|| {
            envelope
                .body_html
                .as_deref()
                .map(|html| snippet_from(&html_to_preview_text(html)))
        })
        .unwrap_or_default();

    let body_text = match (&envelope.body_text, &envelope.body_html) {
        (None, None) => Some(String::new()),
        (text, _) => text.clone(),
    };
    let has_attachments = !envelope.attachments.is_empty();

    MailMessage {
        id: Uuid::new_v4(),
        account_id,
        external_id,
        thread_id: Uuid::nil(),
        from: envelope
            .from
            .unwrap_or_else(|| MailAddress::new("", None)),
        to: envelope.to,
        cc: envelope.cc,
        bcc: envelope.bcc,
        reply_to: envelope.reply_to,
        subject: envelope
            .subject
            .map(|subject| subject.trim().to_string())
            .filter(|subject| !subject.is_empty())
            .unwrap_or_else(|| NO_SUBJECT.to_string()),
        body_text,
        body_html: envelope.body_html,
        snippet,
        message_id_header: envelope.message_id.map(|id| id.trim().to_string()),
        in_reply_to: envelope.in_reply_to.map(|id| id.trim().to_string()),
        references: envelope.references.map(|refs| refs.trim().to_string()),
        flags,
        labels,
        has_attachments,
        attachments: envelope.attachments,
        sent_at,
        received_at,
    }
}

pub(crate) fn header_value(mail: &ParsedMail<'_>, key: &str) -> Option<String> {
    for header in mail.get_headers() {
        if header.get_key_ref().eq_ignore_ascii_case(key) {
            return Some(header.get_value());
        }
    }

    None
}

fn extract_text_body(mail: &ParsedMail<'_>) -> Option<String> {
    if mail.subparts.is_empty() {
        let content_type = mail.ctype.mimetype.to_ascii_lowercase();
        if (content_type == "text/plain" || content_type == "text/markdown") && !is_attachment(mail) {
            return mail.get_body().ok();
        }
        return None;
    }

    mail.subparts.iter().find_map(extract_text_body)
}

fn extract_html_body(mail: &ParsedMail<'_>) -> Option<String> {
    if mail.subparts.is_empty() {
        let content_type = mail.ctype.mimetype.to_ascii_lowercase();
        if content_type == "text/html" && !is_attachment(mail) {
            return mail.get_body().ok();
        }
        return None;
    }

    mail.subparts.iter().find_map(extract_html_body)
}

fn is_attachment(mail: &ParsedMail<'_>) -> bool {
    header_value(mail, "Content-Disposition")
        .map(|value| value.to_ascii_lowercase().contains("attachment"))
        .unwrap_or(false)
}

fn collect_attachments(mail: &ParsedMail<'_>, attachments: &mut Vec<AttachmentMeta>) {
    if mail.subparts.is_empty() {
        let disposition = header_value(mail, "Content-Disposition").unwrap_or_default();
        let lowered = disposition.to_ascii_lowercase();
        let name = header_filename(&disposition).or_else(|| mail.ctype.params.get("name").cloned());
        let attached = lowered.contains("attachment") || (lowered.contains("inline") && name.is_some());

        if attached {
            let size = mail.get_body_raw().map(|body| body.len() as u64).unwrap_or(0);
            attachments.push(AttachmentMeta {
                file_name: name.unwrap_or_else(|| "attachment.bin".to_string()),
                mime_type: mail.ctype.mimetype.clone(),
                size,
            });
        }
        return;
    }

    for part in &mail.subparts {
        collect_attachments(part, attachments);
    }
}

fn header_filename(disposition: &str) -> Option<String> {
    let idx = disposition.to_ascii_lowercase().find("filename=")?;
    let raw = disposition[idx + "filename=".len()..].trim();

    if let Some(stripped) = raw.strip_prefix('"') {
        let end = stripped.find('"')?;
        return Some(stripped[..end].to_string());
    }

    raw.split(';')
        .next()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn parsed_message_date(parsed: &ParsedMail<'_>) -> Option<DateTime<Utc>> {
    let raw = header_value(parsed, "Date")?;
    let timestamp = mailparse::dateparse(&raw).ok()?;
    Utc.timestamp_opt(timestamp, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MULTIPART: &[u8] = b"From: \"Grace Hopper\" <Grace@Navy.MIL>\r\n\
To: ada@example.org, \"Lin, Bo\" <bo@example.org>\r\n\
Subject: Compiler notes\r\n\
Message-ID: <c1@navy.mil>\r\n\
References: <root@navy.mil> <prev@navy.mil>\r\n\
In-Reply-To: <prev@navy.mil>\r\n\
Date: Tue, 4 Jun 2024 10:15:00 +0000\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"outer\"\r\n\
\r\n\
--outer\r\n\
Content-Type: multipart/alternative; boundary=\"inner\"\r\n\
\r\n\
--inner\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
First   draft\r\n\
of the notes.\r\n\
--inner\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<p>First draft</p>\r\n\
--inner--\r\n\
--outer\r\n\
Content-Type: application/pdf; name=\"notes.pdf\"\r\n\
Content-Disposition: attachment; filename=\"notes.pdf\"\r\n\
\r\n\
%PDF-1.4\r\n\
--outer--\r\n";

    #[test]
    fn parses_headers_bodies_and_attachments() {
        let envelope = parse_rfc822(MULTIPART).expect("parse");

        let from = envelope.from.expect("from");
        assert_eq!(from.address, "grace@navy.mil");
        assert_eq!(from.name.as_deref(), Some("Grace Hopper"));
        assert_eq!(envelope.to.len(), 2);
        assert_eq!(envelope.to[1].name.as_deref(), Some("Lin, Bo"));
        assert_eq!(envelope.subject.as_deref(), Some("Compiler notes"));
        assert!(envelope.body_text.as_deref().unwrap_or_default().contains("First"));
        assert!(envelope.body_html.is_some());
        assert_eq!(envelope.attachments.len(), 1);
        assert_eq!(envelope.attachments[0].file_name, "notes.pdf");
        assert!(envelope.date.is_some());
    }

    #[test]
    fn built_message_collapses_snippet_whitespace() {
        let envelope = parse_rfc822(MULTIPART).expect("parse");
        let message = build_message(
            Uuid::nil(),
            MessageParts {
                external_id: "42".to_string(),
                envelope,
                flags: MessageFlags::default(),
                labels: vec!["INBOX".to_string()],
                preview: None,
                received_at: None,
            },
        );

        assert_eq!(message.snippet, "First draft of the notes.");
        assert!(message.has_attachments);
        assert_eq!(message.sent_at, message.received_at);
        assert_eq!(message.references.as_deref(), Some("<root@navy.mil> <prev@navy.mil>"));
    }

    #[test]
    fn malformed_list_falls_back_to_comma_split() {
        let parsed = parse_address_list("Ada <ADA@example.org>, broken <<>, bo@example.org");
        assert!(parsed.iter().any(|address| address.address == "ada@example.org"));
        assert!(parsed.iter().any(|address| address.address == "bo@example.org"));
    }

    #[test]
    fn snippet_is_limited_to_two_hundred_chars() {
        let long = "word ".repeat(100);
        assert_eq!(snippet_from(&long).chars().count(), 200);
    }

    #[test]
    fn html_preview_drops_tags_and_styles() {
        let text = html_to_preview_text("<style>p{color:red}</style><p>Hello&nbsp;<b>there</b></p>");
        assert_eq!(snippet_from(&text), "Hello there");
    }

    #[test]
    fn message_without_body_gets_empty_text() {
        let message = build_message(
            Uuid::nil(),
            MessageParts {
                external_id: "1".to_string(),
                envelope: ParsedEnvelope::default(),
                flags: MessageFlags::default(),
                labels: Vec::new(),
                preview: None,
                received_at: None,
            },
        );
        assert_eq!(message.body_text.as_deref(), Some(""));
        assert_eq!(message.subject, NO_SUBJECT);
    }
}
