//! Container builder: wraps raster pixel data into a minimal DICOM instance.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local};
use dicom_core::{dicom_value, DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_object::{
    mem::InMemDicomObject, DefaultDicomObject, FileMetaTableBuilder, StandardDataDictionary,
};
use dicom_transfer_syntax_registry::entries::EXPLICIT_VR_LITTLE_ENDIAN;
use snafu::prelude::*;
use tracing::debug;

use crate::utils::{decode_image, flatten_to_gray8, UidGenerator};

/// Default placeholder patient name
pub const DEFAULT_PATIENT_NAME: &str = "ChestXRay^Patient";
/// Default placeholder patient ID
pub const DEFAULT_PATIENT_ID: &str = "123456";
/// Computed Radiography
pub const DEFAULT_MODALITY: &str = "CR";
/// Pixel data is always single-channel
pub const PHOTOMETRIC_INTERPRETATION: &str = "MONOCHROME2";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConversionError {
    #[snafu(display("could not read source image {}", path.display()))]
    ReadSource {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Bytes are not a decodable image
    #[snafu(display("unreadable image {}: {}", path.display(), source))]
    Unreadable {
        path: PathBuf,
        source: image::ImageError,
    },

    /// Rows and Columns are 16-bit in DICOM
    #[snafu(display(
        "image {} is {}x{}, larger than the 65535x65535 a DICOM image can hold",
        path.display(),
        width,
        height
    ))]
    Unrepresentable {
        path: PathBuf,
        width: u32,
        height: u32,
    },

    /// Could not build the file meta group
    #[snafu(display("could not build file meta information: {}", source))]
    BuildMeta { source: dicom_object::meta::Error },

    /// Could not encode the container
    #[snafu(display("could not encode container: {}", source))]
    Encode {
        source: Box<dicom_object::WriteError>,
    },
}

impl ConversionError {
    /// Whether the source bytes themselves were at fault (as opposed to encoding)
    pub fn is_unreadable(&self) -> bool {
        matches!(
            self,
            ConversionError::Unreadable { .. } | ConversionError::ReadSource { .. }
        )
    }
}

/// A raster image read from local storage, not yet decoded.
#[derive(Debug, Clone)]
pub struct SourceImage {
    path: PathBuf,
    bytes: Vec<u8>,
}

impl SourceImage {
    /// Read the raw bytes of `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ConversionError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).context(ReadSourceSnafu { path })?;
        Ok(Self::from_bytes(path, bytes))
    }

    pub fn from_bytes(path: impl Into<PathBuf>, bytes: Vec<u8>) -> Self {
        SourceImage {
            path: path.into(),
            bytes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// A minimal Secondary Capture instance around 8-bit grayscale pixels.
///
/// Fields are fixed at construction; the container is never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MedicalImageContainer {
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    pub study_instance_uid: String,
    pub series_instance_uid: String,
    pub patient_name: String,
    pub patient_id: String,
    pub modality: String,
    /// DA, `YYYYMMDD`
    pub content_date: String,
    /// TM, `HHMMSS`
    pub content_time: String,
    pub rows: u16,
    pub columns: u16,
    /// Row-major samples, `rows * columns` bytes
    pub pixel_bytes: Vec<u8>,
}

impl MedicalImageContainer {
    pub const SAMPLES_PER_PIXEL: u16 = 1;
    pub const BITS_ALLOCATED: u16 = 8;
    pub const BITS_STORED: u16 = 8;
    pub const HIGH_BIT: u16 = 7;
    /// unsigned
    pub const PIXEL_REPRESENTATION: u16 = 0;

    /// Build the DICOM object, file meta group included.
    pub fn to_dicom(&self) -> Result<DefaultDicomObject, ConversionError> {
        let mut pixel_data = self.pixel_bytes.clone();
        // OB values have even length
        if pixel_data.len() % 2 == 1 {
            pixel_data.push(0);
        }

        let obj = InMemDicomObject::<StandardDataDictionary>::from_element_iter([
            DataElement::new(
                tags::SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, self.sop_class_uid.as_str()),
            ),
            DataElement::new(
                tags::SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, self.sop_instance_uid.as_str()),
            ),
            DataElement::new(
                tags::CONTENT_DATE,
                VR::DA,
                dicom_value!(Str, self.content_date.as_str()),
            ),
            DataElement::new(
                tags::CONTENT_TIME,
                VR::TM,
                dicom_value!(Str, self.content_time.as_str()),
            ),
            DataElement::new(
                tags::MODALITY,
                VR::CS,
                dicom_value!(Str, self.modality.as_str()),
            ),
            DataElement::new(
                tags::PATIENT_NAME,
                VR::PN,
                dicom_value!(Str, self.patient_name.as_str()),
            ),
            DataElement::new(
                tags::PATIENT_ID,
                VR::LO,
                dicom_value!(Str, self.patient_id.as_str()),
            ),
            DataElement::new(
                tags::STUDY_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, self.study_instance_uid.as_str()),
            ),
            DataElement::new(
                tags::SERIES_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, self.series_instance_uid.as_str()),
            ),
            DataElement::new(
                tags::SAMPLES_PER_PIXEL,
                VR::US,
                dicom_value!(U16, [Self::SAMPLES_PER_PIXEL]),
            ),
            DataElement::new(
                tags::PHOTOMETRIC_INTERPRETATION,
                VR::CS,
                dicom_value!(Str, PHOTOMETRIC_INTERPRETATION),
            ),
            DataElement::new(tags::ROWS, VR::US, dicom_value!(U16, [self.rows])),
            DataElement::new(tags::COLUMNS, VR::US, dicom_value!(U16, [self.columns])),
            DataElement::new(
                tags::BITS_ALLOCATED,
                VR::US,
                dicom_value!(U16, [Self::BITS_ALLOCATED]),
            ),
            DataElement::new(
                tags::BITS_STORED,
                VR::US,
                dicom_value!(U16, [Self::BITS_STORED]),
            ),
            DataElement::new(tags::HIGH_BIT, VR::US, dicom_value!(U16, [Self::HIGH_BIT])),
            DataElement::new(
                tags::PIXEL_REPRESENTATION,
                VR::US,
                dicom_value!(U16, [Self::PIXEL_REPRESENTATION]),
            ),
            DataElement::new(tags::PIXEL_DATA, VR::OB, PrimitiveValue::from(pixel_data)),
        ]);

        let meta = FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(self.sop_class_uid.as_str())
            .media_storage_sop_instance_uid(self.sop_instance_uid.as_str())
            .transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN.uid())
            .build()
            .context(BuildMetaSnafu)?;

        Ok(obj.with_exact_meta(meta))
    }

    /// Serialize as a DICOM file: preamble, `DICM`, meta group, data set.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ConversionError> {
        let obj = self.to_dicom()?;
        let mut buf = Vec::with_capacity(self.pixel_bytes.len() + 1024);
        obj.write_all(&mut buf)
            .map_err(Box::from)
            .context(EncodeSnafu)?;
        Ok(buf)
    }
}

/// Builds containers from source images.
///
/// The placeholder identity fields are shared by every container; the three
/// instance UIDs are minted fresh for each one.
#[derive(Debug, Clone)]
pub struct ContainerBuilder {
    uids: Arc<UidGenerator>,
    patient_name: String,
    patient_id: String,
    modality: String,
}

impl Default for ContainerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerBuilder {
    pub fn new() -> Self {
        ContainerBuilder {
            uids: Arc::new(UidGenerator::new()),
            patient_name: DEFAULT_PATIENT_NAME.to_string(),
            patient_id: DEFAULT_PATIENT_ID.to_string(),
            modality: DEFAULT_MODALITY.to_string(),
        }
    }

    pub fn with_patient(mut self, name: impl Into<String>, id: impl Into<String>) -> Self {
        self.patient_name = name.into();
        self.patient_id = id.into();
        self
    }

    pub fn with_modality(mut self, modality: impl Into<String>) -> Self {
        self.modality = modality.into();
        self
    }

    /// Share a UID generator with other builders
    pub fn with_uid_generator(mut self, uids: Arc<UidGenerator>) -> Self {
        self.uids = uids;
        self
    }

    /// Decode `source` and wrap its pixels into a new container.
    pub fn build(&self, source: &SourceImage) -> Result<MedicalImageContainer, ConversionError> {
        self.build_at(source, Local::now())
    }

    /// Same as [`build`](Self::build) with an explicit content timestamp.
    pub fn build_at(
        &self,
        source: &SourceImage,
        now: DateTime<Local>,
    ) -> Result<MedicalImageContainer, ConversionError> {
        let decoded = decode_image(source.bytes()).context(UnreadableSnafu {
            path: source.path(),
        })?;

        let (width, height) = (decoded.width(), decoded.height());
        let (rows, columns) = match (u16::try_from(height), u16::try_from(width)) {
            (Ok(rows), Ok(columns)) => (rows, columns),
            _ => {
                return UnrepresentableSnafu {
                    path: source.path(),
                    width,
                    height,
                }
                .fail()
            }
        };

        let gray = flatten_to_gray8(decoded);
        debug!(
            "Decoded {} as {}x{} grayscale ({} bytes)",
            source.path().display(),
            columns,
            rows,
            gray.samples.len()
        );

        Ok(MedicalImageContainer {
            sop_class_uid: uids::SECONDARY_CAPTURE_IMAGE_STORAGE.to_string(),
            sop_instance_uid: self.uids.generate(),
            study_instance_uid: self.uids.generate(),
            series_instance_uid: self.uids.generate(),
            patient_name: self.patient_name.clone(),
            patient_id: self.patient_id.clone(),
            modality: self.modality.clone(),
            content_date: now.format("%Y%m%d").to_string(),
            content_time: now.format("%H%M%S").to_string(),
            rows,
            columns,
            pixel_bytes: gray.samples,
        })
    }
}
