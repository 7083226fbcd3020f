//! Checks applied to every outgoing message, on the server and in the
//! viewer before anything is sent, and to the session ids they address.

use crate::error::ChatError;
use crate::types::Attachment;

pub fn validate_outgoing(
    text: &str,
    attachment: Option<&Attachment>,
    max_chars: usize,
) -> Result<(), ChatError> {
    let text = text.trim();
    if text.is_empty() && attachment.is_none() {
        return Err(ChatError::validation("message text or attachment is required"));
    }
    if text.chars().count() > max_chars {
        return Err(ChatError::validation(format!(
            "message is longer than {max_chars} characters"
        )));
    }
    if let Some(attachment) = attachment {
        validate_attachment(attachment)?;
    }
    Ok(())
}

pub const MAX_SESSION_ID_CHARS: usize = 128;

/// Session ids are used verbatim as store keys and lock keys, so only the
/// canonical form is accepted.
pub fn validate_session_id(session_id: &str) -> Result<&str, ChatError> {
    if session_id.trim().is_empty() {
        return Err(ChatError::validation("sessionId is required"));
    }
    if session_id.trim() != session_id
        || session_id.chars().any(char::is_control)
        || session_id.chars().count() > MAX_SESSION_ID_CHARS
    {
        return Err(ChatError::validation("sessionId is malformed"));
    }
    Ok(session_id)
}

fn validate_attachment(attachment: &Attachment) -> Result<(), ChatError> {
    let url = attachment.url.trim();
    if url.is_empty() {
        return Err(ChatError::validation("attachment url is required"));
    }
    let accepted = url.starts_with("https://")
        || url.starts_with("http://")
        || url.starts_with("/api/media/");
    if !accepted {
        return Err(ChatError::validation("attachment url must be http(s)"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AttachmentKind;

    fn image(url: &str) -> Attachment {
        Attachment {
            url: url.to_string(),
            kind: AttachmentKind::Image,
            public_id: String::new(),
            width: None,
            height: None,
            duration: None,
        }
    }

    #[test]
    fn empty_message_needs_an_attachment() {
        assert!(validate_outgoing("   ", None, 10).is_err());
        assert!(validate_outgoing("", Some(&image("https://cdn/x.png")), 10).is_ok());
    }

    #[test]
    fn length_counts_characters_not_bytes() {
        assert!(validate_outgoing("chào", None, 4).is_ok());
        assert!(validate_outgoing("chào!", None, 4).is_err());
    }

    #[test]
    fn session_ids_must_be_canonical() {
        assert_eq!(validate_session_id("web-1").unwrap(), "web-1");
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id(" s1").is_err());
        assert!(validate_session_id("s1\n").is_err());
        assert!(validate_session_id(&"x".repeat(MAX_SESSION_ID_CHARS + 1)).is_err());
    }

    #[test]
    fn attachment_url_must_be_usable() {
        assert!(validate_outgoing("hi", Some(&image(" ")), 10).is_err());
        assert!(validate_outgoing("hi", Some(&image("javascript:alert(1)")), 10).is_err());
        assert!(validate_outgoing("hi", Some(&image("/api/media/a.png")), 10).is_ok());
    }
}
