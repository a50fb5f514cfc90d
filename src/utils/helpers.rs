use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

/// Extension of serialized containers written by the pipeline
pub const DICOM_EXTENSION: &str = "dcm";

/// Raster extensions the builder converts
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Directory created by macOS archive tools next to the real content
const MACOS_METADATA_DIR: &str = "__MACOSX";

/// Lowercased extension of `path`, if any
pub fn extension_lowercase(path: &Path) -> Option<String> {
    path.extension()
        .and_then(OsStr::to_str)
        .map(|ext| ext.to_ascii_lowercase())
}

/// Whether `path` carries one of `extensions` (case-insensitive)
pub fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    match extension_lowercase(path) {
        Some(ext) => extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext)),
        None => false,
    }
}

/// Whether `path` is already a DICOM file
pub fn is_dicom_file(path: &Path) -> bool {
    has_extension(path, &[DICOM_EXTENSION])
}

/// Junk left behind by archive extraction: AppleDouble `._*` files,
/// anything under `__MACOSX`, and hidden dot-files.
pub fn is_junk_entry(path: &Path) -> bool {
    let under_macos_dir = path.components().any(|c| match c {
        Component::Normal(name) => name == OsStr::new(MACOS_METADATA_DIR),
        _ => false,
    });
    if under_macos_dir {
        return true;
    }
    match path.file_name().and_then(OsStr::to_str) {
        Some(name) => name.contains("._") || name.starts_with('.'),
        None => true,
    }
}

/// Where the container for `source` is stored: the source file name with
/// its extension replaced by `.dcm`, placed in `output_dir`.
pub fn artifact_path(source: &Path, output_dir: &Path) -> Option<PathBuf> {
    let mut name = source.file_stem()?.to_os_string();
    name.push(".");
    name.push(DICOM_EXTENSION);
    Some(output_dir.join(name))
}

/// Temporary sibling used while an artifact is being written
pub fn partial_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    artifact.with_file_name(name)
}
