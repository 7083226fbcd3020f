//! Attachment storage. Files land on local disk under a uuid name and are
//! served back from `/api/media/{file_name}`.

use std::path::PathBuf;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::ChatError;
use crate::types::{Attachment, AttachmentKind};

#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn upload(
        &self,
        file_name: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<Attachment, ChatError>;

    /// Bytes and content type of a stored file, if it exists.
    async fn read(&self, stored_name: &str) -> Result<Option<(Vec<u8>, &'static str)>, ChatError>;
}

pub struct LocalMediaStore {
    dir: PathBuf,
    public_base_url: String,
    max_bytes: usize,
}

impl LocalMediaStore {
    pub fn new(dir: impl Into<PathBuf>, public_base_url: &str, max_bytes: usize) -> Self {
        Self {
            dir: dir.into(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            max_bytes,
        }
    }

    pub async fn ensure_dir(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }
}

#[async_trait]
impl MediaStore for LocalMediaStore {
    async fn upload(
        &self,
        file_name: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<Attachment, ChatError> {
        if bytes.is_empty() {
            return Err(ChatError::validation("uploaded file is empty"));
        }
        if bytes.len() > self.max_bytes {
            return Err(ChatError::validation(format!(
                "attachment exceeds {} bytes",
                self.max_bytes
            )));
        }
        let kind = AttachmentKind::from_mime(content_type)
            .ok_or_else(|| ChatError::validation("only image and video attachments are supported"))?;

        let ext = extension_from_filename(file_name, kind)
            .unwrap_or_else(|| extension_from_mime(content_type, kind).to_string());
        let stored_name = format!("{}.{}", Uuid::new_v4(), ext);
        let path = self.dir.join(&stored_name);
        tokio::fs::write(&path, bytes).await.map_err(|err| {
            tracing::error!(path = %path.display(), error = %err, "failed to store upload");
            ChatError::Internal("failed to store uploaded file".to_string())
        })?;
        tracing::debug!(stored_name, size = bytes.len(), "attachment stored");

        Ok(Attachment {
            url: format!("{}/api/media/{stored_name}", self.public_base_url),
            kind,
            public_id: stored_name,
            width: None,
            height: None,
            duration: None,
        })
    }

    async fn read(&self, stored_name: &str) -> Result<Option<(Vec<u8>, &'static str)>, ChatError> {
        if !is_safe_media_file_name(stored_name) {
            return Err(ChatError::validation("invalid media file name"));
        }
        match tokio::fs::read(self.dir.join(stored_name)).await {
            Ok(bytes) => {
                let ext = stored_name
                    .rsplit('.')
                    .next()
                    .unwrap_or("")
                    .to_ascii_lowercase();
                Ok(Some((bytes, content_type_from_extension(&ext))))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(ChatError::Internal(format!("media read failed: {err}"))),
        }
    }
}

pub fn is_safe_media_file_name(value: &str) -> bool {
    !value.is_empty()
        && !value.contains("..")
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// The file name's extension, when it agrees with the declared kind.
fn extension_from_filename(name: &str, kind: AttachmentKind) -> Option<String> {
    let (_, ext) = name.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    let known: &[&str] = match kind {
        AttachmentKind::Image => &["jpg", "jpeg", "png", "webp", "gif"],
        AttachmentKind::Video => &["mp4", "mov", "webm"],
    };
    known.contains(&ext.as_str()).then_some(ext)
}

fn extension_from_mime(mime: &str, kind: AttachmentKind) -> &'static str {
    let mt = mime.to_ascii_lowercase();
    if mt.contains("jpeg") || mt.contains("jpg") {
        "jpg"
    } else if mt.contains("png") {
        "png"
    } else if mt.contains("webp") {
        "webp"
    } else if mt.contains("gif") {
        "gif"
    } else if mt.contains("quicktime") {
        "mov"
    } else if mt.contains("webm") {
        "webm"
    } else {
        match kind {
            AttachmentKind::Image => "jpg",
            AttachmentKind::Video => "mp4",
        }
    }
}

fn content_type_from_extension(ext: &str) -> &'static str {
    match ext {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}
