//! File sources for multipart uploads and file downloads

use bytes::Bytes;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Content type used when a download does not declare one
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// An uploaded or attached file.
///
/// Items whose content is memory-resident hand their bytes over directly.
/// Other items are asked to [`write_to`](Self::write_to) a temporary file,
/// which is deleted once the request completes.
pub trait FileItem: Send + Sync {
    /// File name sent in the part's `Content-Disposition`
    fn name(&self) -> &str;

    /// Declared MIME type, if any
    fn content_type(&self) -> Option<&str>;

    /// Whether [`bytes`](Self::bytes) is available without touching the disk
    fn is_in_memory(&self) -> bool;

    /// In-memory content; `None` for items that are not memory-resident
    fn bytes(&self) -> Option<Bytes>;

    /// Copy the content to `path`
    ///
    /// # Errors
    /// Returns the underlying I/O error.
    fn write_to(&self, path: &Path) -> io::Result<()>;
}

/// A file held entirely in memory.
#[derive(Clone, PartialEq, Eq)]
pub struct MemoryFileItem {
    data: Bytes,
    name: String,
    size: u64,
    content_type: String,
}

impl MemoryFileItem {
    #[must_use]
    pub fn new(
        data: impl Into<Bytes>,
        name: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        let data = data.into();
        Self {
            size: data.len() as u64,
            data,
            name: name.into(),
            content_type: content_type.into(),
        }
    }

    /// Override the declared size (e.g. from a `Content-Length` header)
    #[must_use]
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    #[must_use]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

impl fmt::Debug for MemoryFileItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryFileItem")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

impl FileItem for MemoryFileItem {
    fn name(&self) -> &str {
        &self.name
    }

    fn content_type(&self) -> Option<&str> {
        Some(&self.content_type)
    }

    fn is_in_memory(&self) -> bool {
        true
    }

    fn bytes(&self) -> Option<Bytes> {
        Some(self.data.clone())
    }

    fn write_to(&self, path: &Path) -> io::Result<()> {
        std::fs::write(path, &self.data)
    }
}

/// A file stored on disk.
///
/// Never memory-resident: uploads copy it to a temporary file first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskFileItem {
    path: PathBuf,
    name: String,
    content_type: Option<String>,
}

impl DiskFileItem {
    /// Item named after the last component of `path`
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path,
            name,
            content_type: None,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FileItem for DiskFileItem {
    fn name(&self) -> &str {
        &self.name
    }

    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    fn is_in_memory(&self) -> bool {
        false
    }

    fn bytes(&self) -> Option<Bytes> {
        None
    }

    fn write_to(&self, path: &Path) -> io::Result<()> {
        std::fs::copy(&self.path, path).map(|_| ())
    }
}
