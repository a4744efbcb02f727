//! Local preview handles.
//!
//! A preview URL stands in for a browser object URL: it is issued the moment a
//! file is picked so the UI can render before the upload resolves, and it must
//! be released exactly once when its record is deleted, replaced or the session
//! is torn down.

use crate::photo::PhotoFile;
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use tracing::{trace, warn};
use uuid::Uuid;

/// Revocable reference to locally held file bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct PreviewUrl(String);

impl PreviewUrl {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PreviewUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PreviewUrl {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug)]
struct PreviewEntry {
    name: String,
    bytes: Bytes,
}

/// Issues preview URLs and keeps the bytes they point at alive until release
#[derive(Debug)]
pub struct PreviewRegistry {
    namespace: String,
    next_sequence: u64,
    live: HashMap<PreviewUrl, PreviewEntry>,
    released: u64,
}

impl PreviewRegistry {
    pub fn new() -> Self {
        Self {
            namespace: Uuid::new_v4().simple().to_string(),
            next_sequence: 0,
            live: HashMap::new(),
            released: 0,
        }
    }

    /// Issue a fresh handle for the file's bytes
    pub fn issue(&mut self, file: &PhotoFile) -> PreviewUrl {
        self.next_sequence += 1;
        let url = PreviewUrl(format!(
            "blob:photo-intake/{}/{}",
            self.namespace, self.next_sequence
        ));

        self.live.insert(
            url.clone(),
            PreviewEntry {
                name: file.name.clone(),
                bytes: file.bytes.clone(),
            },
        );

        trace!(preview_url = %url, name = %file.name, "Preview issued");
        url
    }

    /// Release a handle. Returns false if it was never issued or is already gone.
    pub fn release(&mut self, url: &PreviewUrl) -> bool {
        match self.live.remove(url) {
            Some(entry) => {
                self.released += 1;
                trace!(preview_url = %url, name = %entry.name, "Preview released");
                true
            }
            None => {
                warn!(preview_url = %url, "Release of unknown or already released preview");
                false
            }
        }
    }

    /// Release every outstanding handle, returning how many were released
    pub fn release_all(&mut self) -> usize {
        let count = self.live.len();
        self.released += count as u64;
        self.live.clear();
        count
    }

    /// Bytes behind a live handle
    pub fn resolve(&self, url: &PreviewUrl) -> Option<&Bytes> {
        self.live.get(url).map(|entry| &entry.bytes)
    }

    pub fn is_live(&self, url: &PreviewUrl) -> bool {
        self.live.contains_key(url)
    }

    /// Handles issued and not yet released
    pub fn outstanding(&self) -> usize {
        self.live.len()
    }

    pub fn issued_total(&self) -> u64 {
        self.next_sequence
    }

    pub fn released_total(&self) -> u64 {
        self.released
    }
}

impl Default for PreviewRegistry {
    fn default() -> Self {
        Self::new()
    }
}
