use crate::config::AssemblyConfig;
use crate::photo::PhotoId;
use crate::photo_store::PhotoStore;
use crate::submission::OrderDraft;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Reasons an order cannot be turned into a payload
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssembleError {
    #[error("Order form incomplete: missing {}", .missing.join(", "))]
    IncompleteForm { missing: Vec<&'static str> },

    #[error("No photos in the order")]
    NoPhotos,

    #[error("{} photo(s) have not finished uploading", .pending.len())]
    UploadsPending { pending: Vec<PhotoId> },
}

impl AssembleError {
    pub fn user_message(&self) -> String {
        match self {
            AssembleError::IncompleteForm { .. } => {
                "Please fill in the order number and the receiver.".to_string()
            }
            AssembleError::NoPhotos => "Please upload at least one photo.".to_string(),
            AssembleError::UploadsPending { pending } => format!(
                "{} photo(s) are still uploading or failed. Wait, retry or remove them.",
                pending.len()
            ),
        }
    }
}

/// Identifier a group of photos is submitted under
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupKey {
    /// Distinct key of the group
    pub key: String,
    /// Print specification the backend understands (e.g. "5x7")
    pub spec: String,
    /// Layout variant (e.g. "full"), when the size label carries one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl GroupKey {
    /// Group keyed by the size label itself
    pub fn label(size_key: &str) -> Self {
        Self {
            key: size_key.to_string(),
            spec: size_key.to_string(),
            variant: None,
        }
    }
}

/// Maps a size key onto the group it is submitted under
///
/// The mapping belongs to the submit service; implement this trait (or pass
/// a closure) to match a different backend's scheme.
pub trait GroupKeyPolicy: Send + Sync {
    fn group_key(&self, size_key: &str) -> GroupKey;
}

impl<F> GroupKeyPolicy for F
where
    F: Fn(&str) -> GroupKey + Send + Sync,
{
    fn group_key(&self, size_key: &str) -> GroupKey {
        self(size_key)
    }
}

/// Every size label is its own group
#[derive(Debug, Clone, Copy, Default)]
pub struct SizeLabelGrouping;

impl GroupKeyPolicy for SizeLabelGrouping {
    fn group_key(&self, size_key: &str) -> GroupKey {
        GroupKey::label(size_key)
    }
}

/// Splits labels such as "5x7-full" into a numeric spec and a layout variant
///
/// Labels whose first part is not a `<w>x<h>` dimension fall back to the
/// label itself.
#[derive(Debug, Clone, Copy)]
pub struct DimensionVariantGrouping {
    separator: char,
}

impl DimensionVariantGrouping {
    pub fn new(separator: char) -> Self {
        Self { separator }
    }

    fn normalize_dimension(raw: &str) -> Option<String> {
        let lowered = raw.trim().to_lowercase().replace(['×', '*'], "x");
        let (width, height) = lowered.split_once('x')?;
        let (width, height) = (width.trim(), height.trim());

        let is_number = |s: &str| s.parse::<u32>().is_ok_and(|v| v > 0);
        if !is_number(width) || !is_number(height) {
            return None;
        }

        Some(format!("{}x{}", width, height))
    }
}

impl Default for DimensionVariantGrouping {
    fn default() -> Self {
        Self::new('-')
    }
}

impl GroupKeyPolicy for DimensionVariantGrouping {
    fn group_key(&self, size_key: &str) -> GroupKey {
        let (dimension, variant) = match size_key.split_once(self.separator) {
            Some((dimension, variant)) => (dimension, Some(variant.trim().to_lowercase())),
            None => (size_key, None),
        };

        let Some(spec) = Self::normalize_dimension(dimension) else {
            return GroupKey::label(size_key);
        };

        let variant = variant.filter(|v| !v.is_empty());
        let key = match &variant {
            Some(v) => format!("{}{}{}", spec, self.separator, v),
            None => spec.clone(),
        };

        GroupKey { key, spec, variant }
    }
}

/// Built-in grouping schemes selectable from configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupingScheme {
    #[default]
    SizeLabel,
    DimensionVariant,
}

/// Handling of photos whose upload has not completed at submit time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingUploadPolicy {
    /// Refuse to assemble until every photo is uploaded
    #[default]
    RequireUploaded,
    /// Submit the local preview URL for photos without a server URL
    FallbackToPreview,
}

/// One group of the submission payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhotoGroup {
    #[serde(flatten)]
    pub key: GroupKey,
    pub urls: Vec<String>,
}

/// Flat per-photo manifest entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayloadPhoto {
    pub size: String,
    pub url: String,
    pub id: PhotoId,
}

/// Photos grouped for submission, groups in first-seen order
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SubmissionPayload {
    pub groups: Vec<PhotoGroup>,
    pub photos: Vec<PayloadPhoto>,
}

impl SubmissionPayload {
    pub fn group(&self, key: &str) -> Option<&PhotoGroup> {
        self.groups.iter().find(|g| g.key.key == key)
    }

    pub fn photo_count(&self) -> usize {
        self.photos.len()
    }

    fn push(&mut self, group_key: GroupKey, size_key: &str, id: &PhotoId, url: String) {
        match self.groups.iter_mut().find(|g| g.key.key == group_key.key) {
            Some(group) => group.urls.push(url.clone()),
            None => self.groups.push(PhotoGroup {
                key: group_key,
                urls: vec![url.clone()],
            }),
        }

        self.photos.push(PayloadPhoto {
            size: size_key.to_string(),
            url,
            id: id.clone(),
        });
    }
}

/// Turns the photo store into a grouped submission payload
#[derive(Clone)]
pub struct OrderAssembler {
    grouping: Arc<dyn GroupKeyPolicy>,
    pending_policy: PendingUploadPolicy,
}

impl OrderAssembler {
    pub fn new(grouping: impl GroupKeyPolicy + 'static, pending_policy: PendingUploadPolicy) -> Self {
        Self {
            grouping: Arc::new(grouping),
            pending_policy,
        }
    }

    pub fn from_config(config: &AssemblyConfig) -> Self {
        match config.grouping {
            GroupingScheme::SizeLabel => Self::new(SizeLabelGrouping, config.pending_policy),
            GroupingScheme::DimensionVariant => {
                Self::new(DimensionVariantGrouping::default(), config.pending_policy)
            }
        }
    }

    pub fn pending_policy(&self) -> PendingUploadPolicy {
        self.pending_policy
    }

    /// Build the payload for `draft` from the store's current contents
    pub fn assemble(
        &self,
        store: &PhotoStore,
        draft: &OrderDraft,
    ) -> Result<SubmissionPayload, AssembleError> {
        draft.validate()?;

        if store.total_count() == 0 {
            return Err(AssembleError::NoPhotos);
        }

        let mut payload = SubmissionPayload::default();
        let mut pending = Vec::new();

        let mut seen = HashSet::new();

        for size_key in &draft.sizes {
            // Each size is emitted once even if the draft lists it twice
            if !seen.insert(size_key.as_str()) || store.count_for(size_key) == 0 {
                continue;
            }
            let Some(bucket) = store.bucket(size_key) else {
                continue;
            };

            let group_key = self.grouping.group_key(size_key);

            for record in bucket.iter() {
                let url = match (self.pending_policy, &record.server_url) {
                    (_, Some(server_url)) if record.status.is_uploaded() => server_url.clone(),
                    (PendingUploadPolicy::RequireUploaded, _) => {
                        pending.push(record.id.clone());
                        continue;
                    }
                    (PendingUploadPolicy::FallbackToPreview, Some(server_url)) => {
                        server_url.clone()
                    }
                    (PendingUploadPolicy::FallbackToPreview, None) => {
                        record.preview_url.as_str().to_string()
                    }
                };

                payload.push(group_key.clone(), size_key, &record.id, url);
            }
        }

        if !pending.is_empty() {
            warn!(pending = pending.len(), "Order has unfinished uploads");
            return Err(AssembleError::UploadsPending { pending });
        }

        if payload.groups.is_empty() {
            return Err(AssembleError::NoPhotos);
        }

        debug!(
            groups = payload.groups.len(),
            photos = payload.photo_count(),
            "Submission payload assembled"
        );

        Ok(payload)
    }
}

impl Default for OrderAssembler {
    fn default() -> Self {
        Self::new(SizeLabelGrouping, PendingUploadPolicy::default())
    }
}

impl std::fmt::Debug for OrderAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderAssembler")
            .field("pending_policy", &self.pending_policy)
            .finish_non_exhaustive()
    }
}
