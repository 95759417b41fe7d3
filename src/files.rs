use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;
pub const MAX_IMAGE_SIZE: u64 = 5 * 1024 * 1024;

const IMAGE_TYPES: &[&str] = &["image/jpeg", "image/jpg", "image/png", "image/webp", "image/gif"];
const DOCUMENT_EXTENSIONS: &[&str] = &[".pdf", ".doc", ".docx", ".txt", ".csv", ".json"];
const MEDIA_TYPES: &[&str] = &[
    "video/mp4",
    "video/webm",
    "audio/mp3",
    "audio/mpeg",
    "audio/wav",
    "audio/ogg",
];

#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("File not found: {0}")]
    NotFound(PathBuf),
    #[error("File size exceeds {}MB limit", MAX_FILE_SIZE / 1024 / 1024)]
    TooLarge,
    #[error("Image size exceeds {}MB limit", MAX_IMAGE_SIZE / 1024 / 1024)]
    ImageTooLarge,
    #[error("File type not supported: {0}")]
    Unsupported(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A validated file waiting to be sent with a message.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedFile {
    pub name: String,
    pub path: PathBuf,
    pub mime: String,
    pub size: u64,
    pub is_image: bool,
    pub is_document: bool,
    pub is_media: bool,
}

impl ProcessedFile {
    /// Classifies and validates the file at `path`.
    pub fn from_path(path: &Path) -> Result<Self, FileError> {
        let meta = fs::metadata(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FileError::NotFound(path.to_path_buf()),
            _ => FileError::Io(e),
        })?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mime = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        let file = Self::classify(name, path.to_path_buf(), mime, meta.len());
        file.validate()?;
        debug!("Accepted attachment {} ({})", file.name, file.mime);
        Ok(file)
    }

    fn classify(name: String, path: PathBuf, mime: String, size: u64) -> Self {
        let lower = name.to_lowercase();
        Self {
            is_image: IMAGE_TYPES.contains(&mime.as_str()),
            is_document: DOCUMENT_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)),
            is_media: MEDIA_TYPES.contains(&mime.as_str()),
            name,
            path,
            mime,
            size,
        }
    }

    fn validate(&self) -> Result<(), FileError> {
        if self.size > MAX_FILE_SIZE {
            return Err(FileError::TooLarge);
        }
        if !self.is_image && !self.is_document && !self.is_media {
            return Err(FileError::Unsupported(self.name.clone()));
        }
        if self.is_image && self.size > MAX_IMAGE_SIZE {
            return Err(FileError::ImageTooLarge);
        }
        Ok(())
    }

    pub fn kind(&self) -> &'static str {
        if self.is_image {
            "image"
        } else if self.is_media && self.mime.starts_with("video/") {
            "video"
        } else if self.is_media {
            "audio"
        } else {
            "document"
        }
    }

    pub fn describe(&self) -> String {
        format!("{} [{}, {}]", self.name, self.kind(), format_file_size(self.size))
    }
}

/// Human readable size: `0 Bytes`, `1.5 KB`, `2 MB`.
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["Bytes", "KB", "MB", "GB"];
    if bytes == 0 {
        return "0 Bytes".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rounded = format!("{:.2}", value);
    let trimmed = rounded.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", trimmed, UNITS[unit])
}

/// Files attached to the message currently being composed.
#[derive(Debug, Default)]
pub struct AttachmentTray {
    files: Vec<ProcessedFile>,
}

impl AttachmentTray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, path: &Path) -> Result<&ProcessedFile, FileError> {
        let file = ProcessedFile::from_path(path)?;
        self.files.push(file);
        Ok(&self.files[self.files.len() - 1])
    }

    pub fn remove(&mut self, index: usize) -> Option<ProcessedFile> {
        (index < self.files.len()).then(|| self.files.remove(index))
    }

    /// Empties the tray, handing its files to the send.
    pub fn take(&mut self) -> Vec<ProcessedFile> {
        std::mem::take(&mut self.files)
    }

    pub fn files(&self) -> &[ProcessedFile] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, size: u64) -> PathBuf {
        let path = dir.path().join(name);
        let file = fs::File::create(&path).unwrap();
        file.set_len(size).unwrap();
        path
    }

    #[test]
    fn test_classifies_by_mime_and_extension() {
        let dir = TempDir::new().unwrap();
        let png = ProcessedFile::from_path(&write(&dir, "shot.png", 2048)).unwrap();
        assert!(png.is_image);
        assert_eq!(png.mime, "image/png");
        assert_eq!(png.kind(), "image");

        let csv = ProcessedFile::from_path(&write(&dir, "Report.CSV", 10)).unwrap();
        assert!(csv.is_document);
        assert!(!csv.is_image);

        let video = ProcessedFile::from_path(&write(&dir, "clip.mp4", 10)).unwrap();
        assert!(video.is_media);
        assert_eq!(video.kind(), "video");
    }

    #[test]
    fn test_rejects_unsupported_and_oversized() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            ProcessedFile::from_path(&write(&dir, "setup.exe", 10)),
            Err(FileError::Unsupported(_))
        ));
        assert!(matches!(
            ProcessedFile::from_path(&write(&dir, "big.png", MAX_IMAGE_SIZE + 1)),
            Err(FileError::ImageTooLarge)
        ));
        assert!(matches!(
            ProcessedFile::from_path(&write(&dir, "huge.txt", MAX_FILE_SIZE + 1)),
            Err(FileError::TooLarge)
        ));
        // Under the general limit documents may exceed the image limit.
        assert!(ProcessedFile::from_path(&write(&dir, "notes.txt", MAX_IMAGE_SIZE + 1)).is_ok());
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = ProcessedFile::from_path(&dir.path().join("gone.pdf")).unwrap_err();
        assert!(matches!(err, FileError::NotFound(_)));
    }

    #[test]
    fn test_format_file_size() {
        assert_eq!(format_file_size(0), "0 Bytes");
        assert_eq!(format_file_size(512), "512 Bytes");
        assert_eq!(format_file_size(1024), "1 KB");
        assert_eq!(format_file_size(1536), "1.5 KB");
        assert_eq!(format_file_size(5 * 1024 * 1024), "5 MB");
    }

    #[test]
    fn test_tray_add_remove_take() {
        let dir = TempDir::new().unwrap();
        let mut tray = AttachmentTray::new();
        tray.add(&write(&dir, "a.txt", 1)).unwrap();
        tray.add(&write(&dir, "b.json", 1)).unwrap();
        assert!(tray.add(&write(&dir, "c.bin", 1)).is_err());
        assert_eq!(tray.len(), 2);

        assert_eq!(tray.remove(0).map(|f| f.name), Some("a.txt".to_string()));
        assert!(tray.remove(5).is_none());

        let taken = tray.take();
        assert_eq!(taken.len(), 1);
        assert!(tray.is_empty());
    }
}
