//! Archive uploader: one authenticated `POST /instances` per container.
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde_json::Value;
use snafu::prelude::*;
use tracing::{error, info};

/// Content type of a DICOM Part 10 file
pub const DICOM_CONTENT_TYPE: &str = "application/dicom";
/// Per-request timeout unless configured otherwise
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum UploadError {
    /// The archive answered with something other than 200
    #[snafu(display("archive rejected instance with HTTP {}: {}", status, body))]
    Rejected { status: u16, body: String },

    /// Connection refused, timeout, DNS failure, broken response...
    #[snafu(display("could not reach archive: {}", error_chain(source)))]
    Transport { source: reqwest::Error },

    /// Could not set up the HTTP client
    #[snafu(display("could not initialize HTTP client: {}", source))]
    Client { source: reqwest::Error },
}

impl UploadError {
    /// HTTP status of a rejection, if the archive answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            UploadError::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Render an error together with its sources, `outer: inner: innermost`.
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut current = err.source();
    while let Some(cause) = current {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        current = cause.source();
    }
    message
}

/// Base URL of the archive and request limits
#[derive(Debug, Clone)]
pub struct ArchiveEndpoint {
    /// e.g. `http://localhost:8042`
    pub url: String,
    /// Bounds every request, connect included
    pub timeout: Duration,
}

impl ArchiveEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        ArchiveEndpoint {
            url: url.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `{url}/instances`
    pub fn instances_url(&self) -> String {
        format!("{}/instances", self.url.trim_end_matches('/'))
    }
}

impl Default for ArchiveEndpoint {
    fn default() -> Self {
        Self::new("http://localhost:8042")
    }
}

/// HTTP Basic credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// How the archive answered one upload
#[derive(Debug)]
pub enum UploadOutcome {
    /// HTTP 200; the acknowledgement body is opaque here
    Accepted { acknowledgement: Value },
    Rejected(UploadError),
}

/// Result of a single upload attempt
#[derive(Debug)]
pub struct UploadResult {
    /// What was uploaded (usually the artifact path)
    pub target: String,
    pub outcome: UploadOutcome,
}

impl UploadResult {
    pub fn accepted(target: impl Into<String>, acknowledgement: Value) -> Self {
        UploadResult {
            target: target.into(),
            outcome: UploadOutcome::Accepted { acknowledgement },
        }
    }

    pub fn rejected(target: impl Into<String>, error: UploadError) -> Self {
        UploadResult {
            target: target.into(),
            outcome: UploadOutcome::Rejected(error),
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, UploadOutcome::Accepted { .. })
    }

    /// HTTP status of a rejection, `None` on success or transport failure
    pub fn status(&self) -> Option<u16> {
        match &self.outcome {
            UploadOutcome::Accepted { .. } => None,
            UploadOutcome::Rejected(e) => e.status(),
        }
    }

    /// Human readable summary for logs and reports
    pub fn diagnostic(&self) -> String {
        match &self.outcome {
            UploadOutcome::Accepted { acknowledgement } => {
                format!("accepted: {}", acknowledgement)
            }
            UploadOutcome::Rejected(e) => e.to_string(),
        }
    }
}

/// Destination for serialized containers.
#[async_trait]
pub trait Archive: Send + Sync {
    /// Transmit one container. Never fails: problems end up in the result.
    async fn upload(&self, target: &str, container: Vec<u8>) -> UploadResult;

    /// Where uploads go, for logging
    fn describe(&self) -> String;
}

/// Uploads to an Orthanc-style REST archive.
#[derive(Debug, Clone)]
pub struct ArchiveUploader {
    endpoint: ArchiveEndpoint,
    credentials: Credentials,
    client: reqwest::Client,
}

impl ArchiveUploader {
    pub fn new(endpoint: ArchiveEndpoint, credentials: Credentials) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder()
            .timeout(endpoint.timeout)
            .build()
            .context(ClientSnafu)?;
        Ok(ArchiveUploader {
            endpoint,
            credentials,
            client,
        })
    }

    pub fn endpoint(&self) -> &ArchiveEndpoint {
        &self.endpoint
    }

    async fn send(&self, container: Vec<u8>) -> Result<Value, UploadError> {
        let response = self
            .client
            .post(self.endpoint.instances_url())
            .header(CONTENT_TYPE, DICOM_CONTENT_TYPE)
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .body(container)
            .send()
            .await
            .context(TransportSnafu)?;

        let status = response.status();
        let body = response.text().await.context(TransportSnafu)?;

        ensure!(
            status == StatusCode::OK,
            RejectedSnafu {
                status: status.as_u16(),
                body,
            }
        );

        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }
}

#[async_trait]
impl Archive for ArchiveUploader {
    async fn upload(&self, target: &str, container: Vec<u8>) -> UploadResult {
        let size = container.len();
        match self.send(container).await {
            Ok(acknowledgement) => {
                info!(
                    "Uploaded {} ({} kB) to archive: {}",
                    target,
                    size / 1_000,
                    acknowledgement
                );
                UploadResult::accepted(target, acknowledgement)
            }
            Err(e) => {
                error!("Failed to upload {} to archive: {}", target, e);
                UploadResult::rejected(target, e)
            }
        }
    }

    fn describe(&self) -> String {
        self.endpoint.instances_url()
    }
}
