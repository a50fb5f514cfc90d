#![deny(clippy::all)]

pub mod builder;
pub mod orchestrator;
pub mod provider;
pub mod uploader;
pub mod utils;

pub use builder::{ContainerBuilder, ConversionError, MedicalImageContainer, SourceImage};
pub use orchestrator::{
    BatchOrchestrator, BatchReport, DirectoryWalk, ItemSelector, OrchestratorOptions, SourceItem,
    SubsetSample,
};
pub use provider::{DatasetProvider, FetchError, HttpZipDataset, LocalDataset};
pub use uploader::{
    Archive, ArchiveEndpoint, ArchiveUploader, Credentials, UploadError, UploadResult,
};
