use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use snafu::{Report, ResultExt, Whatever};
use tracing::{error, info, warn};

use pacs_ingest::builder::{DEFAULT_MODALITY, DEFAULT_PATIENT_ID, DEFAULT_PATIENT_NAME};
use pacs_ingest::orchestrator::{
    BatchOrchestrator, DirectoryWalk, ItemSelector, OrchestratorOptions, SubsetSample,
};
use pacs_ingest::provider::{DatasetProvider, HttpZipDataset, LocalDataset, KAGGLE_DATASET_URL};
use pacs_ingest::uploader::{ArchiveEndpoint, ArchiveUploader, Credentials};
use pacs_ingest::utils::init_tracing;
use pacs_ingest::{BatchReport, ContainerBuilder};

/// Convert raster images to DICOM and upload them to a PACS
#[derive(Debug, Parser)]
#[command(name = "pacs-ingest", version)]
struct App {
    /// directory holding the source images (the dataset is unpacked here)
    #[arg(long, env = "PACS_SOURCE_DIR")]
    source_dir: PathBuf,
    /// where DICOM files are written [default: <source-dir>/output_dicom]
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// base URL of the archive
    #[arg(long, env = "PACS_URL", default_value = "http://localhost:8042")]
    archive_url: String,
    /// archive username
    #[arg(long, env = "PACS_USER", default_value = "orthanc")]
    archive_user: String,
    /// archive password
    #[arg(
        long,
        env = "PACS_PASSWORD",
        default_value = "orthanc",
        hide_env_values = true
    )]
    archive_password: String,
    /// timeout of each upload request, in seconds
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// dataset to fetch into the source directory when it is empty
    #[arg(long)]
    dataset_id: Option<String>,
    /// download URL of the dataset zip, `{dataset}` is replaced by the dataset id
    #[arg(long, default_value = KAGGLE_DATASET_URL)]
    dataset_url: String,
    /// username for the dataset download
    #[arg(long, env = "KAGGLE_USERNAME")]
    dataset_user: Option<String>,
    /// API key for the dataset download
    #[arg(long, env = "KAGGLE_KEY", hide_env_values = true)]
    dataset_key: Option<String>,

    /// only take files from this subdirectory (repeatable)
    #[arg(long = "subset")]
    subsets: Vec<String>,
    /// how many files to take from each subset
    #[arg(long, default_value_t = 20)]
    per_subset: usize,
    /// only look at the top level of the source directory
    #[arg(long)]
    no_recursive: bool,

    /// placeholder patient name written into every instance
    #[arg(long, default_value = DEFAULT_PATIENT_NAME)]
    patient_name: String,
    /// placeholder patient ID written into every instance
    #[arg(long, default_value = DEFAULT_PATIENT_ID)]
    patient_id: String,
    /// modality written into every instance
    #[arg(long, default_value = DEFAULT_MODALITY)]
    modality: String,

    /// process these many items in parallel
    #[arg(long, default_value_t = 1)]
    concurrency: usize,
    /// write the batch report as JSON to this file
    #[arg(long)]
    report: Option<PathBuf>,
    /// verbose mode
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let app = App::parse();
    init_tracing(app.verbose);

    match run(app).await {
        Ok(report) => {
            for item in report.failures() {
                eprintln!("{}: {}", item.source.display(), item.message);
            }
            println!("{}", report);
        }
        Err(e) => {
            error!("{}", Report::from_error(e));
            std::process::exit(-2);
        }
    }
}

async fn run(app: App) -> Result<BatchReport, Whatever> {
    let App {
        source_dir,
        output_dir,
        archive_url,
        archive_user,
        archive_password,
        timeout_secs,
        dataset_id,
        dataset_url,
        dataset_user,
        dataset_key,
        subsets,
        per_subset,
        no_recursive,
        patient_name,
        patient_id,
        modality,
        concurrency,
        report: report_path,
        verbose,
    } = app;

    match dataset_id {
        Some(dataset_id) => {
            let credentials = match (dataset_user, dataset_key) {
                (Some(user), Some(key)) => Some(Credentials::new(user, key)),
                _ => None,
            };
            let provider = HttpZipDataset::new(dataset_url, credentials)
                .whatever_context("could not set up dataset download")?;
            provider
                .fetch_and_unpack(&dataset_id, &source_dir)
                .await
                .with_whatever_context(|_| format!("could not fetch dataset {}", dataset_id))?;
        }
        None => {
            LocalDataset
                .fetch_and_unpack("local", &source_dir)
                .await
                .whatever_context("no source images")?;
        }
    }

    let output_dir = output_dir.unwrap_or_else(|| source_dir.join("output_dicom"));
    let endpoint = ArchiveEndpoint::new(archive_url)
        .with_timeout(Duration::from_secs(timeout_secs));
    let uploader = ArchiveUploader::new(endpoint, Credentials::new(archive_user, archive_password))
        .whatever_context("could not set up archive client")?;
    let builder = ContainerBuilder::new()
        .with_patient(patient_name, patient_id)
        .with_modality(modality);

    let mut options = OrchestratorOptions::new(output_dir);
    options.concurrency = concurrency;
    options.show_progress = !verbose;
    let orchestrator = BatchOrchestrator::new(builder, Arc::new(uploader), options);

    let stop = orchestrator.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, letting in-flight items finish");
            stop.stop();
        }
    });

    let selector: Box<dyn ItemSelector> = if subsets.is_empty() {
        Box::new(DirectoryWalk {
            recursive: !no_recursive,
        })
    } else {
        Box::new(SubsetSample::new(subsets, per_subset))
    };

    let report = orchestrator
        .run_selected(selector.as_ref(), &source_dir)
        .await
        .whatever_context("batch aborted")?;

    if let Some(path) = report_path {
        let file = std::fs::File::create(&path)
            .with_whatever_context(|_| format!("could not create report {}", path.display()))?;
        serde_json::to_writer_pretty(file, &report)
            .with_whatever_context(|_| format!("could not write report {}", path.display()))?;
        info!("Report written to {}", path.display());
    }

    Ok(report)
}
