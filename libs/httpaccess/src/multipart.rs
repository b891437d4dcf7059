//! `multipart/form-data` encoding
//!
//! Text parts and memory-resident files are encoded in memory. File items
//! that are not memory-resident are written to a temporary file owned by a
//! [`TempFileSet`], and the part content is streamed from that file while the
//! request is sent. The set is cleaned up by the executor once the exchange is
//! over.

use crate::body::{OutgoingBody, SegmentedBody};
use crate::charset::Charset;
use crate::error::HttpAccessError;
use crate::file_item::{DEFAULT_CONTENT_TYPE, FileItem};
use crate::request::MultipartForm;
use bytes::{BufMut, BytesMut};
use rand::Rng;
use std::sync::Arc;
use tempfile::NamedTempFile;

const TEMP_FILE_PREFIX: &str = "httpaccess-";
const TEMP_FILE_SUFFIX: &str = ".part";

/// Temporary files created for one request.
///
/// Files are removed by [`cleanup`](Self::cleanup), which reports failures
/// through the log. A set dropped without cleanup (cancelled future) still
/// removes its files through `NamedTempFile`'s own drop.
#[derive(Debug, Default)]
pub struct TempFileSet {
    files: Vec<NamedTempFile>,
}

impl TempFileSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    #[cfg(test)]
    fn paths(&self) -> impl Iterator<Item = &std::path::Path> {
        self.files.iter().map(NamedTempFile::path)
    }

    /// Write `item` to a fresh temporary file and open it for reading.
    ///
    /// Returns the open file and its length.
    async fn materialize(
        &mut self,
        item: Arc<dyn FileItem>,
    ) -> Result<(tokio::fs::File, u64), HttpAccessError> {
        let (file, written) = tokio::task::spawn_blocking(move || {
            let file = tempfile::Builder::new()
                .prefix(TEMP_FILE_PREFIX)
                .suffix(TEMP_FILE_SUFFIX)
                .tempfile()
                .map_err(|e| HttpAccessError::local("Error creating temporary file", e))?;
            // the file is kept even when the write fails, so cleanup removes it
            let written = item.write_to(file.path());
            Ok::<_, HttpAccessError>((file, written))
        })
        .await
        .map_err(|e| HttpAccessError::local("Temporary file task failed", e.into()))??;

        let path = file.path().to_path_buf();
        self.files.push(file);
        let context = || format!("Error writing temporary file {}", path.display());
        written.map_err(|e| HttpAccessError::local(context(), e))?;

        let source = tokio::fs::File::open(&path)
            .await
            .map_err(|e| HttpAccessError::local(context(), e))?;
        let len = source
            .metadata()
            .await
            .map_err(|e| HttpAccessError::local(context(), e))?
            .len();
        tracing::trace!(path = %path.display(), len, "Temporary file ready for upload");
        Ok((source, len))
    }

    /// Delete every file, logging failures. Each file is deleted exactly once.
    pub fn cleanup(self) {
        for file in self.files {
            let path = file.path().to_path_buf();
            match file.close() {
                Ok(()) => tracing::trace!(path = %path.display(), "Temporary file deleted"),
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to delete temporary file"
                ),
            }
        }
    }
}

/// An encoded multipart body and its `Content-Type` header value
#[derive(Debug)]
pub struct EncodedMultipart {
    pub content_type: String,
    /// Streamed from the temporary files when there are any, buffered otherwise
    pub body: OutgoingBody,
}

/// Encodes parts in order: caller text fields, extra (authenticator) fields,
/// then files.
pub struct MultipartEncoder {
    boundary: String,
    buf: BytesMut,
    body: SegmentedBody,
    content_charset: Charset,
    element_charset: Charset,
}

impl MultipartEncoder {
    pub fn new(content_charset: Charset, element_charset: Charset) -> Self {
        Self {
            boundary: gen_boundary(),
            buf: BytesMut::new(),
            body: SegmentedBody::new(),
            content_charset,
            element_charset,
        }
    }

    pub async fn encode(
        mut self,
        form: &MultipartForm,
        extra_fields: &[(String, String)],
        temp_files: &mut TempFileSet,
    ) -> Result<EncodedMultipart, HttpAccessError> {
        for (name, values) in &form.fields {
            for value in values {
                self.text_part(name, value);
            }
        }
        for (name, value) in extra_fields {
            self.text_part(name, value);
        }
        for (name, item) in &form.files {
            self.file_part_start(name, item.as_ref());
            match item.bytes().filter(|_| item.is_in_memory()) {
                Some(bytes) => self.buf.put_slice(&bytes),
                None => {
                    let (file, len) = temp_files.materialize(Arc::clone(item)).await?;
                    self.flush_buf();
                    self.body.push_file(file, len);
                }
            }
            self.buf.put_slice(b"\r\n");
        }

        self.buf.put_slice(b"--");
        self.buf.put_slice(self.boundary.as_bytes());
        self.buf.put_slice(b"--\r\n");
        self.flush_buf();

        Ok(EncodedMultipart {
            content_type: format!("multipart/form-data; boundary={}", self.boundary),
            body: self.body.finish(),
        })
    }

    fn flush_buf(&mut self) {
        self.body.push_bytes(self.buf.split().freeze());
    }

    fn text_part(&mut self, name: &str, value: &str) {
        self.part_start(name, None);
        self.header_line(&format!(
            "Content-Type: text/plain; charset={}",
            self.content_charset
        ));
        self.header_line("Content-Transfer-Encoding: 8bit");
        self.buf.put_slice(b"\r\n");
        self.buf.put_slice(&self.content_charset.encode(value));
        self.buf.put_slice(b"\r\n");
    }

    fn file_part_start(&mut self, name: &str, item: &dyn FileItem) {
        self.part_start(name, Some(item.name()));
        self.header_line(&format!(
            "Content-Type: {}",
            item.content_type().unwrap_or(DEFAULT_CONTENT_TYPE)
        ));
        self.header_line("Content-Transfer-Encoding: binary");
        self.buf.put_slice(b"\r\n");
    }

    fn part_start(&mut self, name: &str, filename: Option<&str>) {
        self.buf.put_slice(b"--");
        self.buf.put_slice(self.boundary.as_bytes());
        self.buf.put_slice(b"\r\n");

        let mut disposition = format!(
            "Content-Disposition: form-data; name=\"{}\"",
            encode_quoted(name)
        );
        if let Some(filename) = filename {
            disposition.push_str("; filename=\"");
            disposition.push_str(&encode_quoted(filename));
            disposition.push('"');
        }
        self.header_line(&disposition);
    }

    fn header_line(&mut self, line: &str) {
        self.buf.put_slice(&self.element_charset.encode(line));
        self.buf.put_slice(b"\r\n");
    }
}

/// Quoted parameter value with `"`, CR and LF percent-encoded, as browsers do
fn encode_quoted(value: &str) -> String {
    value
        .replace('"', "%22")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}

fn gen_boundary() -> String {
    let mut rng = rand::rng();
    let a: u64 = rng.random();
    let b: u64 = rng.random();
    format!("----httpaccess{a:016x}{b:016x}")
}
