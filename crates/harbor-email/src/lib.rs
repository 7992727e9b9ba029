mod compose;
mod error;
mod folders;
mod gmail;
mod graph;
mod grouping;
mod http;
mod imap;
pub mod normalize;
mod provider;

pub use error::ProviderError;
pub use folders::{folder_type_for_gmail_label, folder_type_for_graph_name, folder_type_for_imap_path};
pub use gmail::{GmailAuth, GmailProvider};
pub use graph::{GraphAuth, GraphProvider};
pub use grouping::{conversation_key, group_messages};
pub use imap::{ImapCursor, ImapProvider};
pub use provider::{
    MailProvider, MutationFailure, MutationReport, OAuthGrant, OAuthProvider, OutgoingAttachment,
    ProviderFactory, ProviderResolver, ProviderSettings, ReplyContext, SendParams,
};
