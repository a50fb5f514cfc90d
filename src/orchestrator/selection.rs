use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::warn;
use walkdir::{DirEntry, WalkDir};

use crate::utils::{has_extension, is_dicom_file, is_junk_entry, IMAGE_EXTENSIONS};

/// What a source file holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Raster image to convert
    Raster,
    /// Already a DICOM file, uploaded as-is
    Container,
}

/// One file picked for the batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceItem {
    pub path: PathBuf,
    pub kind: SourceKind,
}

impl SourceItem {
    /// Classify `path` by extension; `None` for anything the pipeline does not handle.
    pub fn classify(path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        let kind = if has_extension(&path, IMAGE_EXTENSIONS) {
            SourceKind::Raster
        } else if is_dicom_file(&path) {
            SourceKind::Container
        } else {
            return None;
        };
        Some(SourceItem { path, kind })
    }
}

/// Strategy picking the items of a batch below a dataset root.
pub trait ItemSelector: Send + Sync {
    fn select(&self, root: &Path) -> Vec<SourceItem>;
}

fn is_macos_metadata_dir(entry: &DirEntry) -> bool {
    entry.file_type().is_dir() && entry.file_name() == "__MACOSX"
}

/// Turn a walk entry into an item, skipping directories and archive junk.
fn candidate(root: &Path, entry: walkdir::Result<DirEntry>) -> Option<SourceItem> {
    let entry = match entry {
        Ok(entry) => entry,
        Err(e) => {
            warn!(
                "Could not read directory entry below {}: {}",
                root.display(),
                e
            );
            return None;
        }
    };
    if entry.file_type().is_dir() {
        return None;
    }
    let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
    if is_junk_entry(relative) {
        if SourceItem::classify(relative).is_some() {
            warn!("Skipping non-image file: {}", entry.path().display());
        }
        return None;
    }
    SourceItem::classify(entry.into_path())
}

/// Every recognized file below the root, in file name order.
#[derive(Debug, Clone, Copy)]
pub struct DirectoryWalk {
    /// Descend into subdirectories
    pub recursive: bool,
}

impl Default for DirectoryWalk {
    fn default() -> Self {
        DirectoryWalk { recursive: true }
    }
}

impl ItemSelector for DirectoryWalk {
    fn select(&self, root: &Path) -> Vec<SourceItem> {
        let max_depth = if self.recursive { usize::MAX } else { 1 };
        WalkDir::new(root)
            .max_depth(max_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_macos_metadata_dir(e))
            .filter_map(|entry| candidate(root, entry))
            .collect()
    }
}

/// The first `per_subset` recognized files (by name) of each named subdirectory.
#[derive(Debug, Clone)]
pub struct SubsetSample {
    pub subsets: Vec<String>,
    pub per_subset: usize,
}

impl SubsetSample {
    pub fn new(subsets: Vec<String>, per_subset: usize) -> Self {
        SubsetSample {
            subsets,
            per_subset,
        }
    }
}

impl ItemSelector for SubsetSample {
    fn select(&self, root: &Path) -> Vec<SourceItem> {
        let mut items = Vec::new();
        for subset in &self.subsets {
            let subset_path = root.join(subset);
            if !subset_path.is_dir() {
                warn!("Subset directory {} not found.", subset_path.display());
                continue;
            }
            items.extend(
                WalkDir::new(&subset_path)
                    .min_depth(1)
                    .max_depth(1)
                    .sort_by_file_name()
                    .into_iter()
                    .filter_map(|entry| candidate(&subset_path, entry))
                    .take(self.per_subset),
            );
        }
        items
    }
}
