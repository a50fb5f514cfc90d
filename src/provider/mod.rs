//! Dataset providers put source images onto local storage.
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use snafu::prelude::*;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::uploader::Credentials;

/// Kaggle dataset download API, `{dataset}` is `owner/name`
pub const KAGGLE_DATASET_URL: &str = "https://www.kaggle.com/api/v1/datasets/download/{dataset}";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FetchError {
    /// No data where a local dataset was expected
    #[snafu(display("dataset {} not found at {}", dataset, path.display()))]
    Missing { dataset: String, path: PathBuf },

    #[snafu(display("could not create {}", path.display()))]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("could not download {}", url))]
    Download {
        url: String,
        source: reqwest::Error,
    },

    #[snafu(display("download of {} failed with HTTP {}", url, status))]
    DownloadStatus { url: String, status: u16 },

    #[snafu(display("could not access archive {}", path.display()))]
    WriteArchive {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("could not unpack {}", path.display()))]
    Unpack {
        path: PathBuf,
        source: zip::result::ZipError,
    },

    /// Unpacking task panicked or was cancelled
    #[snafu(display("unpack task failed"))]
    UnpackTask { source: tokio::task::JoinError },

    #[snafu(display("could not initialize HTTP client"))]
    HttpClient { source: reqwest::Error },
}

/// Fetches a dataset and unpacks it into a local directory.
///
/// Implementations must be a no-op when `destination` already holds data.
#[async_trait]
pub trait DatasetProvider: Send + Sync {
    async fn fetch_and_unpack(
        &self,
        dataset_id: &str,
        destination: &Path,
    ) -> Result<(), FetchError>;
}

/// Whether `dir` exists and has at least one entry
pub fn has_data(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Dataset that is expected to be on disk already.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalDataset;

#[async_trait]
impl DatasetProvider for LocalDataset {
    async fn fetch_and_unpack(
        &self,
        dataset_id: &str,
        destination: &Path,
    ) -> Result<(), FetchError> {
        ensure!(
            has_data(destination),
            MissingSnafu {
                dataset: dataset_id,
                path: destination,
            }
        );
        info!(
            "Dataset {} already present in {}",
            dataset_id,
            destination.display()
        );
        Ok(())
    }
}

/// Downloads a zip archive over HTTP and extracts it.
#[derive(Debug, Clone)]
pub struct HttpZipDataset {
    url_template: String,
    credentials: Option<Credentials>,
    client: reqwest::Client,
}

impl HttpZipDataset {
    /// `url_template` may contain `{dataset}`, replaced by the dataset id.
    pub fn new(
        url_template: impl Into<String>,
        credentials: Option<Credentials>,
    ) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().build().context(HttpClientSnafu)?;
        Ok(HttpZipDataset {
            url_template: url_template.into(),
            credentials,
            client,
        })
    }

    /// Kaggle dataset API with the account's username and API key
    pub fn kaggle(credentials: Credentials) -> Result<Self, FetchError> {
        Self::new(KAGGLE_DATASET_URL, Some(credentials))
    }

    pub fn url_for(&self, dataset_id: &str) -> String {
        self.url_template.replace("{dataset}", dataset_id)
    }

    async fn download(&self, url: &str, archive_path: &Path) -> Result<u64, FetchError> {
        let mut request = self.client.get(url);
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }
        let mut response = request.send().await.context(DownloadSnafu { url })?;
        ensure!(
            response.status().is_success(),
            DownloadStatusSnafu {
                url,
                status: response.status().as_u16(),
            }
        );

        let mut file = tokio::fs::File::create(archive_path)
            .await
            .context(WriteArchiveSnafu { path: archive_path })?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.context(DownloadSnafu { url })? {
            file.write_all(&chunk)
                .await
                .context(WriteArchiveSnafu { path: archive_path })?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .context(WriteArchiveSnafu { path: archive_path })?;
        Ok(written)
    }

    async fn download_and_unpack(
        &self,
        url: &str,
        archive_path: &Path,
        destination: &Path,
    ) -> Result<(), FetchError> {
        let size = self.download(url, archive_path).await?;
        info!(
            "Downloaded {} kB, extracting to {}",
            size / 1_000,
            destination.display()
        );

        let (archive, dest) = (archive_path.to_path_buf(), destination.to_path_buf());
        tokio::task::spawn_blocking(move || unpack(&archive, &dest))
            .await
            .context(UnpackTaskSnafu)?
    }
}

fn unpack(archive_path: &Path, destination: &Path) -> Result<(), FetchError> {
    let file = std::fs::File::open(archive_path)
        .context(WriteArchiveSnafu { path: archive_path })?;
    let mut archive = zip::ZipArchive::new(file)
        .context(UnpackSnafu { path: archive_path })?;
    archive
        .extract(destination)
        .context(UnpackSnafu { path: archive_path })
}

#[async_trait]
impl DatasetProvider for HttpZipDataset {
    async fn fetch_and_unpack(
        &self,
        dataset_id: &str,
        destination: &Path,
    ) -> Result<(), FetchError> {
        if has_data(destination) {
            info!("Dataset already downloaded in {}", destination.display());
            return Ok(());
        }
        std::fs::create_dir_all(destination)
            .context(CreateDirSnafu { path: destination })?;

        let url = self.url_for(dataset_id);
        let archive_name = format!("{}.zip", dataset_id.replace('/', "_"));
        let archive_path = destination.join(archive_name);

        info!("Downloading {} from {}...", dataset_id, url);
        let result = self
            .download_and_unpack(&url, &archive_path, destination)
            .await;

        // the archive is never kept, so a failed fetch leaves an empty destination to retry into
        if let Err(e) = std::fs::remove_file(&archive_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Could not remove {}: {}", archive_path.display(), e);
            }
        }

        result?;
        info!(
            "Downloaded and extracted {} to {}",
            dataset_id,
            destination.display()
        );
        Ok(())
    }
}
