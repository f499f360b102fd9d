//! Artifact identities and scoped file ownership
//!
//! Every upload is held through a [`ScopedFile`], which removes the file
//! exactly once: either when explicitly released at request termination or,
//! failing that, when it is dropped on an error or cancellation path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

const MAX_FILENAME_CHARS: usize = 128;

/// Opaque, collision-resistant identifier (32 lowercase hex chars).
pub fn generate_token() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn is_valid_token(id: &str) -> bool {
    id.len() == 32 && id.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Reduce a client-supplied name to a safe basename.
///
/// Keeps `[A-Za-z0-9._-]`, maps whitespace to `_`, strips leading dots and
/// never returns an empty string.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();

    let mut cleaned: String = base
        .chars()
        .filter_map(|c| match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '.' | '-' | '_' => Some(c),
            c if c.is_whitespace() => Some('_'),
            _ => None,
        })
        .collect();

    cleaned = cleaned.trim_start_matches('.').to_string();

    if cleaned.chars().count() > MAX_FILENAME_CHARS {
        let ext = extension_of(&cleaned).map(|e| format!(".{}", e)).unwrap_or_default();
        let keep = MAX_FILENAME_CHARS.saturating_sub(ext.len());
        cleaned = cleaned.chars().take(keep).collect::<String>() + &ext;
    }

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.' || c == '_') {
        "file".to_string()
    } else {
        cleaned
    }
}

/// Lowercase extension without the dot, if the name has a plausible one.
pub fn extension_of(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next()?;
    let (stem, ext) = base.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > 10 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// File stem of a display name, used to derive output names.
pub fn stem_of(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    }
}

/// Remove a file, treating "already gone" as success.
///
/// Returns whether a file was actually removed.
pub fn remove_quietly(path: &Path) -> io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

pub async fn remove_quietly_async(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Owns a path on disk and deletes it exactly once.
#[derive(Debug)]
pub struct ScopedFile {
    path: PathBuf,
    armed: bool,
}

impl ScopedFile {
    /// Take ownership of `path`. The file need not exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            armed: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete now. Later calls and the eventual drop are no-ops.
    pub fn release(&mut self) -> io::Result<bool> {
        if !self.armed {
            return Ok(false);
        }
        self.armed = false;
        remove_quietly(&self.path)
    }

    pub fn is_released(&self) -> bool {
        !self.armed
    }
}

impl Drop for ScopedFile {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = remove_quietly(&self.path) {
                warn!(path = %self.path.display(), error = %e, "failed to remove scoped file");
            }
        }
    }
}

/// A file received for one request. Never shared across requests.
#[derive(Debug)]
pub struct UploadArtifact {
    pub id: String,
    /// Sanitized client filename
    pub original_filename: String,
    pub size: u64,
    pub mime: String,
    pub created_at: DateTime<Utc>,
    pub(crate) file: ScopedFile,
}

impl UploadArtifact {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn extension(&self) -> Option<String> {
        extension_of(&self.original_filename)
    }

    pub fn release(&mut self) -> io::Result<bool> {
        self.file.release()
    }

    pub fn is_released(&self) -> bool {
        self.file.is_released()
    }
}

/// A produced file, addressed only by its opaque id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputArtifact {
    pub id: String,
    pub display_name: String,
    pub size: u64,
    pub mime: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub download_count: u64,
    #[serde(skip)]
    pub(crate) stored_path: PathBuf,
}

impl OutputArtifact {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn stored_path(&self) -> &Path {
        &self.stored_path
    }
}

/// Sniff content type from magic bytes, falling back to the extension table.
pub fn detect_mime(path: &Path, ext: Option<&str>) -> String {
    match infer::get_from_path(path) {
        Ok(Some(kind)) => kind.mime_type().to_string(),
        _ => mime_from_extension(ext.unwrap_or_default()).to_string(),
    }
}

pub fn mime_from_extension(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        // Images
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "tiff" | "tif" => "image/tiff",
        "bmp" => "image/bmp",
        // Video
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "wmv" => "video/x-ms-wmv",
        "flv" => "video/x-flv",
        // Audio
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "aac" => "audio/aac",
        "m4a" => "audio/mp4",
        // Documents
        "pdf" => "application/pdf",
        "json" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\Users\\me\\My Report.pdf"), "My_Report.pdf");
        assert_eq!(sanitize_filename(".hidden.png"), "hidden.png");
        assert_eq!(sanitize_filename("résumé (1).pdf"), "rsum_1.pdf");
        assert_eq!(sanitize_filename("..."), "file");
        assert_eq!(sanitize_filename(""), "file");

        let long = format!("{}.jpeg", "a".repeat(400));
        let cleaned = sanitize_filename(&long);
        assert_eq!(cleaned.len(), MAX_FILENAME_CHARS);
        assert!(cleaned.ends_with(".jpeg"));
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("photo.JPG").as_deref(), Some("jpg"));
        assert_eq!(extension_of("archive.tar.gz").as_deref(), Some("gz"));
        assert_eq!(extension_of("noext"), None);
        assert_eq!(extension_of(".bashrc"), None);
        assert_eq!(extension_of("evil.p%df"), None);
    }

    #[test]
    fn test_tokens_are_unique_and_valid() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        assert!(is_valid_token(&a));
        assert!(!is_valid_token("../../../etc/passwd"));
        assert!(!is_valid_token(&a.to_uppercase()));
    }

    #[test]
    fn test_scoped_file_deletes_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.bin");
        std::fs::write(&path, b"data").unwrap();

        let mut scoped = ScopedFile::new(&path);
        assert!(scoped.release().unwrap());
        assert!(!path.exists());
        // A file recreated at the same path is no longer ours
        std::fs::write(&path, b"other").unwrap();
        assert!(!scoped.release().unwrap());
        drop(scoped);
        assert!(path.exists());
    }

    #[test]
    fn test_scoped_file_drop_removes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        std::fs::write(&path, b"partial").unwrap();
        drop(ScopedFile::new(&path));
        assert!(!path.exists());

        // Dropping a guard whose file never existed is fine
        drop(ScopedFile::new(dir.path().join("never-created")));
    }

    #[test]
    fn test_mime_detection() {
        let dir = tempfile::tempdir().unwrap();
        let png = dir.path().join("x.dat");
        std::fs::write(&png, [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0]).unwrap();
        assert_eq!(detect_mime(&png, Some("dat")), "image/png");

        let text = dir.path().join("notes.txt");
        std::fs::write(&text, b"plain words").unwrap();
        assert_eq!(detect_mime(&text, Some("txt")), "text/plain; charset=utf-8");
    }
}
