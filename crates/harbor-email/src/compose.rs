use crate::{ProviderError, SendParams};
use harbor_core::MailAddress;
use lettre::message::{header, Attachment, Mailbox, MultiPart, SinglePart};
use lettre::Message;
use uuid::Uuid;

/// `<uuid@domain>` using the sender's domain.
pub(crate) fn generate_message_id(from: &MailAddress) -> String {
    let domain = from
        .address
        .rsplit_once('@')
        .map(|(_, domain)| domain)
        .filter(|domain| !domain.is_empty())
        .unwrap_or("localhost");
    format!("<{}@{domain}>", Uuid::new_v4())
}

/// Builds the MIME message for SMTP and Gmail. Replies carry `In-Reply-To` and
/// `References` taken from the parent.
pub(crate) fn build_mime(params: &SendParams, message_id: String) -> Result<Message, ProviderError> {
    if params.to.is_empty() && params.cc.is_empty() && params.bcc.is_empty() {
        return Err(ProviderError::Send("message has no recipients".to_string()));
    }

    let mut builder = Message::builder()
        .from(to_mailbox(&params.from)?)
        .subject(params.subject.clone())
        .message_id(Some(message_id));

    for to in &params.to {
        builder = builder.to(to_mailbox(to)?);
    }
    for cc in &params.cc {
        builder = builder.cc(to_mailbox(cc)?);
    }
    for bcc in &params.bcc {
        builder = builder.bcc(to_mailbox(bcc)?);
    }

    if let Some(reply) = &params.reply_to {
        if let Some(parent_id) = &reply.message_id_header {
            builder = builder.in_reply_to(parent_id.clone());
        }
        if let Some(references) = reply.references_header() {
            builder = builder.references(references);
        }
    }

    let body = if params.is_html {
        SinglePart::builder()
            .header(header::ContentType::TEXT_HTML)
            .body(params.body.clone())
    } else {
        SinglePart::plain(params.body.clone())
    };

    let message = if params.attachments.is_empty() {
        builder.singlepart(body)
    } else {
        let mut mixed = MultiPart::mixed().singlepart(body);
        for attachment in &params.attachments {
            let mime = attachment.mime_type.parse().map_err(|err| {
                ProviderError::Send(format!(
                    "invalid attachment mime type '{}': {err}",
                    attachment.mime_type
                ))
            })?;
            mixed = mixed.singlepart(
                Attachment::new(attachment.file_name.clone()).body(attachment.content.clone(), mime),
            );
        }
        builder.multipart(mixed)
    };

    message.map_err(|err| ProviderError::Send(format!("could not build message: {err}")))
}

fn to_mailbox(address: &MailAddress) -> Result<Mailbox, ProviderError> {
    let email = address.address.parse().map_err(|err| {
        ProviderError::Send(format!("invalid email address {}: {err}", address.address))
    })?;

    Ok(Mailbox::new(address.name.clone(), email))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OutgoingAttachment, ReplyContext};

    fn params() -> SendParams {
        SendParams {
            from: MailAddress::new("ada@example.org", Some("Ada".to_string())),
            to: vec![MailAddress::new("grace@example.org", None)],
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: "Re: Compiler notes".to_string(),
            body: "Looks good.".to_string(),
            is_html: false,
            attachments: Vec::new(),
            reply_to: Some(ReplyContext {
                external_id: "17".to_string(),
                thread_external_id: "<root@navy.mil>".to_string(),
                message_id_header: Some("<c1@navy.mil>".to_string()),
                references: Some("<root@navy.mil>".to_string()),
            }),
        }
    }

    #[test]
    fn reply_headers_are_set() {
        let message = build_mime(&params(), "<fixed@example.org>".to_string()).expect("mime");
        let rendered = String::from_utf8(message.formatted()).expect("utf8");
        assert!(rendered.contains("In-Reply-To: <c1@navy.mil>"));
        assert!(rendered.contains("References: <root@navy.mil> <c1@navy.mil>"));
        assert!(rendered.contains("Message-ID: <fixed@example.org>"));
    }

    #[test]
    fn attachments_switch_to_multipart() {
        let mut params = params();
        params.attachments.push(OutgoingAttachment {
            file_name: "notes.txt".to_string(),
            mime_type: "text/plain".to_string(),
            content: b"hello".to_vec(),
        });
        let message = build_mime(&params, generate_message_id(&params.from)).expect("mime");
        let rendered = String::from_utf8(message.formatted()).expect("utf8");
        assert!(rendered.contains("multipart/mixed"));
        assert!(rendered.contains("notes.txt"));
    }

    #[test]
    fn message_id_uses_sender_domain() {
        let id = generate_message_id(&MailAddress::new("ada@example.org", None));
        assert!(id.starts_with('<'));
        assert!(id.ends_with("@example.org>"));
    }

    #[test]
    fn rejects_message_without_recipients() {
        let mut params = params();
        params.to.clear();
        assert!(matches!(
            build_mime(&params, "<x@y>".to_string()),
            Err(ProviderError::Send(_))
        ));
    }
}
