use crate::photo::{PhotoFile, PhotoId, PhotoRecord};
use crate::preview::{PreviewRegistry, PreviewUrl};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// Errors raised by store mutations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Print size '{0}' is not selected")]
    UnknownSize(String),

    #[error("Photo {0} is already in the store")]
    DuplicateId(PhotoId),
}

/// Active print sizes in the order they were selected
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SizeSelection {
    keys: Vec<String>,
}

impl SizeSelection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the size was already selected
    pub fn insert(&mut self, size_key: &str) -> bool {
        if self.contains(size_key) {
            return false;
        }
        self.keys.push(size_key.to_string());
        true
    }

    pub fn remove(&mut self, size_key: &str) -> bool {
        let before = self.keys.len();
        self.keys.retain(|k| k != size_key);
        before != self.keys.len()
    }

    pub fn contains(&self, size_key: &str) -> bool {
        self.keys.iter().any(|k| k == size_key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.keys.clone()
    }
}

/// Photos of one size in display order
#[derive(Debug, Clone, Default)]
pub struct SizeBucket {
    records: Vec<PhotoRecord>,
}

impl SizeBucket {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PhotoRecord> {
        self.records.iter()
    }

    fn get_mut(&mut self, id: &PhotoId) -> Option<&mut PhotoRecord> {
        self.records.iter_mut().find(|r| &r.id == id)
    }

    fn get(&self, id: &PhotoId) -> Option<&PhotoRecord> {
        self.records.iter().find(|r| &r.id == id)
    }

    // Linear scan; buckets hold tens of photos.
    fn remove(&mut self, id: &PhotoId) -> Option<PhotoRecord> {
        let index = self.records.iter().position(|r| &r.id == id)?;
        Some(self.records.remove(index))
    }
}

/// Per-size photo collections for one order session
///
/// A bucket exists exactly while its size is selected. Deselecting a size
/// drops its bucket and releases every preview handle it held; selecting it
/// again starts from an empty bucket.
#[derive(Debug, Default)]
pub struct PhotoStore {
    selection: SizeSelection,
    buckets: HashMap<String, SizeBucket>,
    owners: HashMap<PhotoId, String>,
    previews: PreviewRegistry,
}

impl PhotoStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select a size and create its bucket. Idempotent.
    pub fn add_size(&mut self, size_key: &str) -> bool {
        if !self.selection.insert(size_key) {
            return false;
        }
        self.buckets.entry(size_key.to_string()).or_default();
        debug!(size_key = %size_key, "Size selected");
        true
    }

    /// Deselect a size, dropping its bucket and releasing its previews
    pub fn remove_size(&mut self, size_key: &str) -> Vec<PhotoRecord> {
        self.selection.remove(size_key);

        let removed = match self.buckets.remove(size_key) {
            Some(bucket) => bucket.records,
            None => return Vec::new(),
        };

        for record in &removed {
            self.owners.remove(&record.id);
            self.previews.release(&record.preview_url);
        }

        debug!(
            size_key = %size_key,
            released = removed.len(),
            "Size deselected"
        );
        removed
    }

    /// Append a record to its size's bucket
    pub fn add(&mut self, record: PhotoRecord) -> Result<(), StoreError> {
        if self.owners.contains_key(&record.id) {
            return Err(StoreError::DuplicateId(record.id));
        }

        let bucket = self
            .buckets
            .get_mut(record.size_key())
            .ok_or_else(|| StoreError::UnknownSize(record.size_key().to_string()))?;

        self.owners
            .insert(record.id.clone(), record.size_key().to_string());
        bucket.records.push(record);
        Ok(())
    }

    /// Remove a record and release its preview. Unknown ids are a no-op.
    pub fn remove(&mut self, id: &PhotoId) -> Option<PhotoRecord> {
        let size_key = self.owners.remove(id)?;
        let record = self.buckets.get_mut(&size_key)?.remove(id)?;
        self.previews.release(&record.preview_url);
        Some(record)
    }

    pub fn get(&self, id: &PhotoId) -> Option<&PhotoRecord> {
        let size_key = self.owners.get(id)?;
        self.buckets.get(size_key)?.get(id)
    }

    pub fn get_mut(&mut self, id: &PhotoId) -> Option<&mut PhotoRecord> {
        let size_key = self.owners.get(id)?;
        self.buckets.get_mut(size_key)?.get_mut(id)
    }

    pub fn contains(&self, id: &PhotoId) -> bool {
        self.owners.contains_key(id)
    }

    /// Number of photos for a size; zero for unselected sizes
    pub fn count_for(&self, size_key: &str) -> usize {
        if !self.selection.contains(size_key) {
            return 0;
        }
        self.buckets.get(size_key).map_or(0, SizeBucket::len)
    }

    /// Sum of `count_for` over the selected sizes
    pub fn total_count(&self) -> usize {
        self.selection.iter().map(|key| self.count_for(key)).sum()
    }

    pub fn selection(&self) -> &SizeSelection {
        &self.selection
    }

    pub fn is_selected(&self, size_key: &str) -> bool {
        self.selection.contains(size_key)
    }

    pub fn bucket(&self, size_key: &str) -> Option<&SizeBucket> {
        self.buckets.get(size_key)
    }

    /// All records, selected sizes first-to-last, each bucket in display order
    pub fn records(&self) -> impl Iterator<Item = &PhotoRecord> {
        self.selection
            .iter()
            .filter_map(|key| self.buckets.get(key))
            .flat_map(SizeBucket::iter)
    }

    pub fn issue_preview(&mut self, file: &PhotoFile) -> PreviewUrl {
        self.previews.issue(file)
    }

    pub fn release_preview(&mut self, url: &PreviewUrl) -> bool {
        self.previews.release(url)
    }

    pub fn previews(&self) -> &PreviewRegistry {
        &self.previews
    }

    /// Drop every bucket and release every preview (session teardown)
    pub fn clear(&mut self) -> usize {
        self.buckets.clear();
        self.owners.clear();
        self.selection = SizeSelection::new();
        self.previews.release_all()
    }
}

impl Drop for PhotoStore {
    fn drop(&mut self) {
        let released = self.previews.release_all();
        if released > 0 {
            debug!(released, "Released outstanding previews on teardown");
        }
    }
}
