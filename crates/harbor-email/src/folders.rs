use harbor_core::FolderType;

pub fn folder_type_for_gmail_label(label_id: &str) -> FolderType {
    match label_id {
        "INBOX" => FolderType::Inbox,
        "SENT" => FolderType::Sent,
        "DRAFT" => FolderType::Drafts,
        "TRASH" => FolderType::Trash,
        "SPAM" => FolderType::Spam,
        _ => FolderType::Custom,
    }
}

/// Graph well-known folders are matched on the display name, lowercased with spaces removed.
pub fn folder_type_for_graph_name(display_name: &str) -> FolderType {
    let key: String = display_name
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .collect::<String>()
        .to_lowercase();

    match key.as_str() {
        "inbox" => FolderType::Inbox,
        "sentitems" => FolderType::Sent,
        "drafts" => FolderType::Drafts,
        "deleteditems" => FolderType::Trash,
        "junkemail" => FolderType::Spam,
        "archive" => FolderType::Archive,
        _ => FolderType::Custom,
    }
}

/// IMAP folders are matched on their last path segment.
pub fn folder_type_for_imap_path(path: &str, delimiter: Option<&str>) -> FolderType {
    let leaf = match delimiter.filter(|delimiter| !delimiter.is_empty()) {
        Some(delimiter) => path.rsplit(delimiter).next().unwrap_or(path),
        None => path,
    };

    match leaf.trim().to_lowercase().as_str() {
        "inbox" => FolderType::Inbox,
        "sent" | "sent mail" | "sent items" | "sent messages" => FolderType::Sent,
        "drafts" => FolderType::Drafts,
        "trash" | "deleted" | "deleted items" | "deleted messages" => FolderType::Trash,
        "spam" | "junk" | "junk e-mail" => FolderType::Spam,
        "archive" | "archives" | "all mail" => FolderType::Archive,
        _ => FolderType::Custom,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gmail_labels_map_to_system_folders() {
        assert_eq!(folder_type_for_gmail_label("DRAFT"), FolderType::Drafts);
        assert_eq!(folder_type_for_gmail_label("Label_12"), FolderType::Custom);
    }

    #[test]
    fn graph_names_ignore_case_and_spaces() {
        assert_eq!(folder_type_for_graph_name("Sent Items"), FolderType::Sent);
        assert_eq!(folder_type_for_graph_name("Junk Email"), FolderType::Spam);
        assert_eq!(folder_type_for_graph_name("Deleted Items"), FolderType::Trash);
        assert_eq!(folder_type_for_graph_name("Projects"), FolderType::Custom);
    }

    #[test]
    fn imap_uses_last_path_segment() {
        assert_eq!(folder_type_for_imap_path("[Gmail]/All Mail", Some("/")), FolderType::Archive);
        assert_eq!(folder_type_for_imap_path("INBOX.Junk", Some(".")), FolderType::Spam);
        assert_eq!(folder_type_for_imap_path("Sent Messages", None), FolderType::Sent);
        assert_eq!(folder_type_for_imap_path("INBOX/Receipts", Some("/")), FolderType::Custom);
    }
}
