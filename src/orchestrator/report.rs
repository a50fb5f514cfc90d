use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::uploader::{UploadOutcome, UploadResult};

/// Pipeline stage an item failed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Conversion,
    Upload,
}

/// Where an item is in the pipeline.
///
/// `Pending -> Converted -> Uploaded`, or `Pending -> Failed` from any stage.
/// A finished run only holds `Uploaded`, `Failed` and, when it was stopped,
/// `Pending` items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "stage")]
pub enum ItemState {
    /// Not processed yet
    Pending,
    /// Container available, not uploaded yet
    Converted,
    Uploaded,
    Failed(Stage),
}

impl ItemState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemState::Uploaded | ItemState::Failed(_))
    }
}

/// How the container of an item came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Conversion {
    /// Built in this run
    Converted,
    /// Artifact already on disk, or the source already was DICOM
    Skipped,
    Failed,
}

/// Outcome of one item
#[derive(Debug, Clone, Serialize)]
pub struct ItemRecord {
    pub source: PathBuf,
    pub artifact: Option<PathBuf>,
    pub state: ItemState,
    /// `None` while pending
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversion: Option<Conversion>,
    /// HTTP status of a rejected upload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub message: String,
}

impl ItemRecord {
    pub fn pending(source: PathBuf, artifact: Option<PathBuf>) -> Self {
        ItemRecord {
            source,
            artifact,
            state: ItemState::Pending,
            conversion: None,
            status: None,
            message: String::new(),
        }
    }

    pub fn conversion_failed(
        source: PathBuf,
        artifact: Option<PathBuf>,
        message: impl Into<String>,
    ) -> Self {
        ItemRecord {
            state: ItemState::Failed(Stage::Conversion),
            conversion: Some(Conversion::Failed),
            message: message.into(),
            ..Self::pending(source, artifact)
        }
    }

    /// `Pending -> Converted`, whether the container was built now or reused
    pub fn converted(self, conversion: Conversion) -> Self {
        debug_assert_eq!(self.state, ItemState::Pending);
        ItemRecord {
            state: ItemState::Converted,
            conversion: Some(conversion),
            ..self
        }
    }

    /// `Converted -> Uploaded` or `Converted -> Failed(Upload)`
    pub fn uploaded(self, result: &UploadResult) -> Self {
        debug_assert_eq!(self.state, ItemState::Converted);
        let (state, status) = match &result.outcome {
            UploadOutcome::Accepted { .. } => (ItemState::Uploaded, None),
            UploadOutcome::Rejected(e) => (ItemState::Failed(Stage::Upload), e.status()),
        };
        ItemRecord {
            state,
            status,
            message: result.diagnostic(),
            ..self
        }
    }
}

/// Counts and per-item diagnostics of a batch run
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub converted: usize,
    pub skipped_conversion: usize,
    pub upload_accepted: usize,
    pub upload_rejected: usize,
    pub conversion_failed: usize,
    /// Never processed because the run was stopped
    pub pending: usize,
    pub items: Vec<ItemRecord>,
}

impl BatchReport {
    pub fn record(&mut self, item: ItemRecord) {
        match item.conversion {
            Some(Conversion::Converted) => self.converted += 1,
            Some(Conversion::Skipped) => self.skipped_conversion += 1,
            Some(Conversion::Failed) => self.conversion_failed += 1,
            None => {}
        }
        match item.state {
            ItemState::Pending => self.pending += 1,
            ItemState::Uploaded => self.upload_accepted += 1,
            ItemState::Failed(Stage::Upload) => self.upload_rejected += 1,
            ItemState::Converted | ItemState::Failed(Stage::Conversion) => {}
        }
        self.items.push(item);
    }

    /// Items that did not reach the archive
    pub fn failures(&self) -> impl Iterator<Item = &ItemRecord> {
        self.items
            .iter()
            .filter(|i| matches!(i.state, ItemState::Failed(_)))
    }

    pub fn has_failures(&self) -> bool {
        self.conversion_failed > 0 || self.upload_rejected > 0
    }

    /// Stable ordering for output, workers finish in any order
    pub(crate) fn sort(&mut self) {
        self.items.sort_by(|a, b| a.source.cmp(&b.source));
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} converted, {} skipped conversion, {} conversion failed, {} uploaded, {} upload rejected",
            self.converted,
            self.skipped_conversion,
            self.conversion_failed,
            self.upload_accepted,
            self.upload_rejected
        )?;
        if self.pending > 0 {
            write!(f, ", {} not processed", self.pending)?;
        }
        Ok(())
    }
}
