use harbor_core::{MailMessage, ThreadBundle};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use uuid::Uuid;

fn message_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<[^<>\s]+>").expect("valid message-id regex"))
}

fn first_message_id(raw: Option<&str>) -> Option<String> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }

    match message_id_pattern().find(raw) {
        Some(found) => Some(found.as_str().to_ascii_lowercase()),
        // Some servers strip the angle brackets.
        None => raw
            .split_whitespace()
            .next()
            .map(|token| format!("<{}>", token.to_ascii_lowercase())),
    }
}

/// Conversation key for providers without a native thread id: the root of the
/// `References` chain, else `In-Reply-To`, else the message's own `Message-ID`,
/// else a key derived from the provider id.
pub fn conversation_key(message: &MailMessage) -> String {
    first_message_id(message.references.as_deref())
        .or_else(|| first_message_id(message.in_reply_to.as_deref()))
        .or_else(|| first_message_id(message.message_id_header.as_deref()))
        .unwrap_or_else(|| format!("uid:{}", message.external_id))
}

/// Groups keyed messages into thread bundles. Bundles keep the order in which
/// their key was first seen; messages inside a bundle are ordered by receipt.
pub fn group_messages(account_id: Uuid, keyed: Vec<(String, MailMessage)>) -> Vec<ThreadBundle> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<MailMessage>> = HashMap::new();

    for (key, message) in keyed {
        let entry = groups.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            Vec::new()
        });
        entry.push(message);
    }

    order
        .into_iter()
        .filter_map(|key| {
            let messages = groups.remove(&key)?;
            ThreadBundle::assemble(account_id, key, messages)
        })
        .collect()
}
