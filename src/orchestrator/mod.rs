//! Batch orchestration: convert every selected item, persist it, upload it.
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use snafu::prelude::*;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::builder::{ContainerBuilder, ConversionError, SourceImage};
use crate::uploader::Archive;
use crate::utils::{artifact_path, partial_path};

mod report;
mod selection;

pub use report::{BatchReport, Conversion, ItemRecord, ItemState, Stage};
pub use selection::{DirectoryWalk, ItemSelector, SourceItem, SourceKind, SubsetSample};

/// Local storage failures. Any of them ends the run.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("could not create output directory {}", path.display()))]
    CreateOutputDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("could not write artifact {}", path.display()))]
    WriteArtifact {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("could not read artifact {}", path.display()))]
    ReadArtifact {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A worker task panicked
    #[snafu(display("batch worker failed"))]
    Worker { source: tokio::task::JoinError },
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Where containers are written, `<stem>.dcm` per source
    pub output_dir: PathBuf,
    /// Number of items processed at the same time
    pub concurrency: usize,
    /// Draw a progress bar on stderr
    pub show_progress: bool,
}

impl OrchestratorOptions {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        OrchestratorOptions {
            output_dir: output_dir.into(),
            concurrency: 1,
            show_progress: false,
        }
    }
}

/// Stops scheduling new items; items already in flight finish.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// An item with its artifact location decided
#[derive(Debug, Clone)]
struct PlannedItem {
    item: SourceItem,
    artifact: PathBuf,
}

struct Pipeline {
    builder: ContainerBuilder,
    archive: Arc<dyn Archive>,
    progress: Option<ProgressBar>,
}

pub struct BatchOrchestrator {
    builder: ContainerBuilder,
    archive: Arc<dyn Archive>,
    options: OrchestratorOptions,
    stop: StopHandle,
}

impl BatchOrchestrator {
    pub fn new(
        builder: ContainerBuilder,
        archive: Arc<dyn Archive>,
        options: OrchestratorOptions,
    ) -> Self {
        BatchOrchestrator {
            builder,
            archive,
            options,
            stop: StopHandle::default(),
        }
    }

    /// Handle to stop the run from elsewhere (e.g. a Ctrl-C handler)
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    /// Select items below `root` with `selector`, then [`run`](Self::run) them.
    pub async fn run_selected(
        &self,
        selector: &dyn ItemSelector,
        root: &Path,
    ) -> Result<BatchReport, Error> {
        let items = selector.select(root);
        info!("Selected {} items below {}", items.len(), root.display());
        self.run(items).await
    }

    /// Process every item. Per-item failures go into the report; only local
    /// storage failures end the run early and are returned as errors.
    pub async fn run(&self, items: Vec<SourceItem>) -> Result<BatchReport, Error> {
        let output_dir = &self.options.output_dir;
        std::fs::create_dir_all(output_dir)
            .context(CreateOutputDirSnafu { path: output_dir })?;

        let items = without_own_artifacts(items, output_dir);
        let mut report = BatchReport::default();
        let planned = plan(items, output_dir, &mut report);
        let total = planned.len();
        info!(
            "Processing {} items with {} worker(s), uploading to {}",
            total,
            self.options.concurrency.max(1),
            self.archive.describe()
        );

        let progress = if self.options.show_progress {
            let bar = ProgressBar::new(total as u64);
            let template = "[{elapsed_precise}] {bar:40} {pos}/{len} {wide_msg}";
            if let Ok(style) = ProgressStyle::with_template(template) {
                bar.set_style(style);
            }
            bar.enable_steady_tick(Duration::from_millis(480));
            Some(bar)
        } else {
            None
        };

        let pipeline = Arc::new(Pipeline {
            builder: self.builder.clone(),
            archive: self.archive.clone(),
            progress: progress.clone(),
        });
        let queue = Arc::new(Mutex::new(VecDeque::from(planned)));
        let records = Arc::new(Mutex::new(report));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..self.options.concurrency.max(1) {
            let pipeline = pipeline.clone();
            let queue = queue.clone();
            let records = records.clone();
            let stop = self.stop.clone();
            tasks.spawn(async move {
                loop {
                    if stop.is_stopped() {
                        break;
                    }
                    let next = queue.lock().await.pop_front();
                    let Some(planned) = next else { break };

                    match process_item(&pipeline, planned).await {
                        Ok(record) => records.lock().await.record(record),
                        Err(e) => {
                            stop.stop();
                            return Err(e);
                        }
                    }
                    if let Some(bar) = &pipeline.progress {
                        bar.inc(1);
                    }
                }
                Ok::<(), Error>(())
            });
        }

        let mut first_error = None;
        while let Some(result) = tasks.join_next().await {
            let outcome = result.context(WorkerSnafu).and_then(|r| r);
            if let Err(e) = outcome {
                error!("{}", snafu::Report::from_error(&e));
                self.stop.stop();
                first_error.get_or_insert(e);
            }
        }

        if let Some(bar) = progress {
            bar.finish_with_message("done");
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let mut report = std::mem::take(&mut *records.lock().await);
        for PlannedItem { item, artifact } in queue.lock().await.drain(..) {
            report.record(ItemRecord::pending(item.path, Some(artifact)));
        }
        if report.pending > 0 {
            warn!("Run stopped with {} items not processed", report.pending);
        }
        report.sort();
        info!("Batch finished: {}", report);
        Ok(report)
    }
}

/// Drop DICOM sources that are our own artifacts, found when the output
/// directory lies below the dataset root.
fn without_own_artifacts(items: Vec<SourceItem>, output_dir: &Path) -> Vec<SourceItem> {
    let output_dir = resolve_dir(output_dir);
    items
        .into_iter()
        .filter(|item| {
            let own = item.kind == SourceKind::Container
                && item.path.parent().map(resolve_dir).as_deref() == Some(&*output_dir);
            if own {
                debug!("Ignoring own artifact {}", item.path.display());
            }
            !own
        })
        .collect()
}

fn resolve_dir(dir: &Path) -> PathBuf {
    std::fs::canonicalize(dir).unwrap_or_else(|_| dir.into())
}

/// Decide artifact paths. Items without a usable file name, or whose artifact
/// path is already taken by an earlier item, fail right away.
fn plan(items: Vec<SourceItem>, output_dir: &Path, report: &mut BatchReport) -> Vec<PlannedItem> {
    let mut taken = HashSet::new();
    let mut planned = Vec::with_capacity(items.len());
    for item in items {
        let artifact = match item.kind {
            SourceKind::Container => Some(item.path.clone()),
            SourceKind::Raster => artifact_path(&item.path, output_dir),
        };
        let Some(artifact) = artifact else {
            warn!("Skipping {}: no file name", item.path.display());
            let record = ItemRecord::conversion_failed(item.path, None, "source has no file name");
            report.record(record);
            continue;
        };
        if !taken.insert(artifact.clone()) {
            warn!(
                "Skipping {}: {} is already the artifact of another item",
                item.path.display(),
                artifact.display()
            );
            let message = format!(
                "artifact path {} collides with another item",
                artifact.display()
            );
            let record = ItemRecord::conversion_failed(item.path, Some(artifact), message);
            report.record(record);
            continue;
        }
        planned.push(PlannedItem { item, artifact });
    }
    planned
}

/// Decode, build and encode on the blocking pool.
async fn convert(builder: &ContainerBuilder, source: &Path) -> Result<Vec<u8>, String> {
    let builder = builder.clone();
    let source = source.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<Vec<u8>, ConversionError> {
        let image = SourceImage::open(&source)?;
        let container = builder.build(&image)?;
        debug!(
            "Built instance {} ({}x{}) from {}",
            container.sop_instance_uid,
            container.columns,
            container.rows,
            source.display()
        );
        container.to_bytes()
    })
    .await
    .map_err(|e| format!("conversion task failed: {}", e))?
    .map_err(|e| e.to_string())
}

/// Write through a temporary sibling so a partial file is never taken for a finished artifact.
async fn persist(artifact: &Path, bytes: &[u8]) -> Result<(), Error> {
    let partial = partial_path(artifact);
    tokio::fs::write(&partial, bytes)
        .await
        .context(WriteArtifactSnafu { path: &partial })?;
    tokio::fs::rename(&partial, artifact)
        .await
        .context(WriteArtifactSnafu { path: artifact })
}

async fn process_item(pipeline: &Pipeline, planned: PlannedItem) -> Result<ItemRecord, Error> {
    let PlannedItem { item, artifact } = planned;
    if let Some(bar) = &pipeline.progress {
        bar.set_message(item.path.display().to_string());
    }
    let record = ItemRecord::pending(item.path.clone(), Some(artifact.clone()));

    let (record, fresh_bytes) = match item.kind {
        SourceKind::Container => {
            debug!("{} is already DICOM, uploading as-is", item.path.display());
            (record.converted(Conversion::Skipped), None)
        }
        SourceKind::Raster if artifact.exists() => {
            info!(
                "Skipping conversion: DICOM file {} already exists for {}",
                artifact.display(),
                item.path.display()
            );
            (record.converted(Conversion::Skipped), None)
        }
        SourceKind::Raster => {
            info!(
                "Converting {} to {}...",
                item.path.display(),
                artifact.display()
            );
            match convert(&pipeline.builder, &item.path).await {
                Ok(bytes) => {
                    persist(&artifact, &bytes).await?;
                    info!(
                        "Converted {} to {}",
                        item.path.display(),
                        artifact.display()
                    );
                    (record.converted(Conversion::Converted), Some(bytes))
                }
                Err(message) => {
                    warn!("Skipping {}: {}", item.path.display(), message);
                    let record = ItemRecord::conversion_failed(item.path, Some(artifact), message);
                    return Ok(record);
                }
            }
        }
    };

    let bytes = match fresh_bytes {
        Some(bytes) => bytes,
        None => match tokio::fs::read(&artifact).await {
            Ok(bytes) => bytes,
            // a dataset file vanishing is that item's problem, our own artifacts are not
            Err(e) if item.kind == SourceKind::Container => {
                let message = format!("could not read {}: {}", artifact.display(), e);
                warn!("Skipping {}", message);
                let record = ItemRecord::conversion_failed(item.path, Some(artifact), message);
                return Ok(record);
            }
            Err(e) => return Err(e).context(ReadArtifactSnafu { path: &artifact }),
        },
    };

    info!("Uploading {} to archive...", artifact.display());
    let result = pipeline
        .archive
        .upload(&artifact.display().to_string(), bytes)
        .await;
    Ok(record.uploaded(&result))
}
