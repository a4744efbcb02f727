use crate::preview::PreviewUrl;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use uuid::Uuid;

/// Session-unique photo identifier
///
/// Backed by a random v4 UUID, so ids issued in the same millisecond never
/// collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhotoId(String);

impl PhotoId {
    pub fn generate() -> Self {
        Self(format!("photo_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PhotoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PhotoId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Upload state of a photo record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PhotoStatus {
    /// Created, upload not started yet
    Pending,
    /// Background upload in flight
    Uploading,
    /// Server accepted the photo
    Uploaded,
    /// Upload service reported an error
    Failed { reason: String },
    /// Upload did not resolve within the configured timeout
    TimedOut,
}

impl PhotoStatus {
    pub fn is_uploaded(&self) -> bool {
        matches!(self, PhotoStatus::Uploaded)
    }

    /// Failed and timed-out records accept a replacement file
    pub fn is_retryable(&self) -> bool {
        matches!(self, PhotoStatus::Failed { .. } | PhotoStatus::TimedOut)
    }

    pub fn label(&self) -> &'static str {
        match self {
            PhotoStatus::Pending => "pending",
            PhotoStatus::Uploading => "uploading",
            PhotoStatus::Uploaded => "uploaded",
            PhotoStatus::Failed { .. } => "failed",
            PhotoStatus::TimedOut => "timed out",
        }
    }
}

impl fmt::Display for PhotoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhotoStatus::Failed { reason } => write!(f, "failed ({})", reason),
            other => f.write_str(other.label()),
        }
    }
}

/// A file picked by the user for one print size
#[derive(Debug, Clone)]
pub struct PhotoFile {
    /// Original file name
    pub name: String,
    /// Content type declared by the picker, if any
    pub content_type: Option<String>,
    /// Raw file bytes
    pub bytes: Bytes,
}

impl PhotoFile {
    pub fn new(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            content_type: None,
            bytes: bytes.into(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Declared content type, else a guess from the file extension
    pub fn mime_type(&self) -> String {
        match &self.content_type {
            Some(declared) if !declared.trim().is_empty() => declared.trim().to_lowercase(),
            _ => mime_guess::from_path(&self.name)
                .first_or_octet_stream()
                .essence_str()
                .to_string(),
        }
    }

    pub fn is_image(&self) -> bool {
        self.mime_type().starts_with("image/")
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// One photo in the order
///
/// `size_key` is fixed at creation; moving a photo to another size means
/// deleting it and creating a new record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhotoRecord {
    pub id: PhotoId,
    size_key: String,
    /// Local, revocable preview handle
    pub preview_url: PreviewUrl,
    /// Storage location returned by the upload service
    pub server_url: Option<String>,
    /// Identifier the upload service assigned, used for remote deletion
    pub server_id: Option<String>,
    pub name: String,
    pub status: PhotoStatus,
    /// Display revision appended to the server URL when cache busting is on
    #[serde(skip)]
    pub revision: Option<u64>,
}

impl PhotoRecord {
    pub fn new(
        id: PhotoId,
        size_key: impl Into<String>,
        preview_url: PreviewUrl,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id,
            size_key: size_key.into(),
            preview_url,
            server_url: None,
            server_id: None,
            name: name.into(),
            status: PhotoStatus::Pending,
            revision: None,
        }
    }

    pub fn size_key(&self) -> &str {
        &self.size_key
    }

    /// URL the display layer should load: the server copy once uploaded,
    /// the local preview until then.
    pub fn display_url(&self) -> Cow<'_, str> {
        match (&self.server_url, self.revision) {
            (Some(url), Some(revision)) => {
                let separator = if url.contains('?') { '&' } else { '?' };
                Cow::Owned(format!("{}{}v={}", url, separator, revision))
            }
            (Some(url), None) => Cow::Borrowed(url.as_str()),
            (None, _) => Cow::Borrowed(self.preview_url.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_unique_in_tight_loop() {
        let ids: HashSet<PhotoId> = (0..10_000).map(|_| PhotoId::generate()).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn test_image_detection() {
        assert!(PhotoFile::new("beach.JPG", vec![1u8]).is_image());
        assert!(PhotoFile::new("scan", vec![1u8])
            .with_content_type("image/png")
            .is_image());
        assert!(!PhotoFile::new("notes.txt", vec![1u8]).is_image());
        assert!(!PhotoFile::new("photo.jpg", vec![1u8])
            .with_content_type("application/pdf")
            .is_image());
        assert_eq!(
            PhotoFile::new("unknown.bin", vec![1u8]).mime_type(),
            "application/octet-stream"
        );
    }

    #[test]
    fn test_display_url_prefers_server_copy() {
        let preview = PreviewUrl::from("blob:intake/test/1");
        let mut record = PhotoRecord::new(PhotoId::generate(), "4x6-full", preview, "a.jpg");
        assert_eq!(record.display_url(), "blob:intake/test/1");

        record.server_url = Some("https://cdn.test/a.jpg".to_string());
        assert_eq!(record.display_url(), "https://cdn.test/a.jpg");

        record.revision = Some(7);
        assert_eq!(record.display_url(), "https://cdn.test/a.jpg?v=7");

        record.server_url = Some("https://cdn.test/a.jpg?sig=x".to_string());
        assert_eq!(record.display_url(), "https://cdn.test/a.jpg?sig=x&v=7");
    }

    #[test]
    fn test_status_retryable() {
        assert!(PhotoStatus::TimedOut.is_retryable());
        assert!(PhotoStatus::Failed {
            reason: "boom".to_string()
        }
        .is_retryable());
        assert!(!PhotoStatus::Uploading.is_retryable());
        assert!(!PhotoStatus::Uploaded.is_retryable());
    }
}
