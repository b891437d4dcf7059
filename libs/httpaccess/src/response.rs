use crate::charset::Charset;
use crate::error::{BoxError, TransportError};
use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderMap, Response};
use http_body::Frame;
use http_body_util::BodyExt;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Type alias for the boxed response body that supports decompression.
///
/// The body is type-erased so connection-limit permits and the decompression
/// layer can wrap it transparently.
pub type ResponseBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;

static FILENAME_REGEX: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"filename="([^"]+)""#).ok());

/// Outcome of a successful exchange.
///
/// Header names are lowercase; when the server repeats a header, the last
/// value wins.
#[derive(Debug, Clone)]
pub struct HttpOutcome {
    status: u16,
    headers: HashMap<String, String>,
    body: Bytes,
    charset: Charset,
}

impl HttpOutcome {
    #[must_use]
    pub fn new(
        status: u16,
        headers: HashMap<String, String>,
        body: Bytes,
        charset: Charset,
    ) -> Self {
        Self {
            status,
            headers,
            body,
            charset,
        }
    }

    #[must_use]
    pub fn status(&self) -> u16 {
        self.status
    }

    #[must_use]
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Header value by case-insensitive name
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    #[must_use]
    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Body decoded with the configured content charset
    #[must_use]
    pub fn text(&self) -> String {
        self.charset.decode(&self.body)
    }
}

/// Copy response headers into a map, the last value of a repeated name wins.
#[must_use]
pub fn collect_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut collected = HashMap::with_capacity(headers.keys_len());
    for (name, value) in headers {
        collected.insert(
            name.as_str().to_owned(),
            String::from_utf8_lossy(value.as_bytes()).into_owned(),
        );
    }
    collected
}

async fn next_frame(
    body: &mut ResponseBody,
    timeout: Option<Duration>,
) -> Result<Option<Frame<Bytes>>, TransportError> {
    let frame = match timeout {
        Some(limit) => tokio::time::timeout(limit, body.frame())
            .await
            .map_err(|_| TransportError::Timeout(limit))?,
        None => body.frame().await,
    };
    frame.transpose().map_err(TransportError::Io)
}

/// Read the whole body; `timeout` bounds the wait for each frame.
pub async fn read_body(
    mut body: ResponseBody,
    timeout: Option<Duration>,
) -> Result<Bytes, TransportError> {
    let mut buf = BytesMut::new();
    while let Some(frame) = next_frame(&mut body, timeout).await? {
        if let Ok(data) = frame.into_data() {
            buf.put(data);
        }
    }
    Ok(buf.freeze())
}

/// Failure while streaming a body to a writer
#[derive(Debug)]
pub enum CopyError {
    Read(TransportError),
    Write(std::io::Error),
}

/// Stream the body into `writer`, returning the number of bytes written.
///
/// The writer is flushed but not shut down.
pub async fn copy_body<W>(
    mut body: ResponseBody,
    timeout: Option<Duration>,
    writer: &mut W,
) -> Result<u64, CopyError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut written = 0u64;
    while let Some(frame) = next_frame(&mut body, timeout)
        .await
        .map_err(CopyError::Read)?
    {
        if let Ok(data) = frame.into_data() {
            writer.write_all(&data).await.map_err(CopyError::Write)?;
            written += data.len() as u64;
        }
    }
    writer.flush().await.map_err(CopyError::Write)?;
    Ok(written)
}

/// Map the decompression response to our boxed response body type.
pub fn map_decompression_response<B>(response: Response<B>) -> Response<ResponseBody>
where
    B: http_body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    let (parts, body) = response.into_parts();
    let boxed_body: ResponseBody = body.map_err(Into::into).boxed();
    Response::from_parts(parts, boxed_body)
}

/// File name announced by a `Content-Disposition` value, else the last path
/// segment of `url`.
///
/// A `Content-Disposition` without a quoted `filename` yields `None`.
#[must_use]
pub fn derive_file_name(content_disposition: Option<&str>, url: &str) -> Option<String> {
    if let Some(disposition) = content_disposition {
        return FILENAME_REGEX
            .as_ref()
            .and_then(|regex| regex.captures(disposition))
            .map(|captures| captures[1].to_owned());
    }
    last_path_segment(url)
}

fn last_path_segment(url: &str) -> Option<String> {
    match url::Url::parse(url) {
        Ok(parsed) => parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|segment| !segment.is_empty())
            .map(str::to_owned),
        Err(_) => url
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty())
            .map(str::to_owned),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use http::HeaderValue;
    use http_body_util::Full;

    fn full_body(data: &'static [u8]) -> ResponseBody {
        Full::new(Bytes::from_static(data))
            .map_err(|never| -> BoxError { match never {} })
            .boxed()
    }

    #[test]
    fn test_collect_headers_last_wins() {
        let mut headers = HeaderMap::new();
        headers.append("x-dup", HeaderValue::from_static("1"));
        headers.append("x-dup", HeaderValue::from_static("2"));
        headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        let collected = collect_headers(&headers);
        assert_eq!(collected["x-dup"], "2");
        assert_eq!(collected["content-type"], "text/plain");
    }

    #[test]
    fn test_outcome_accessors() {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_owned(), "text/plain".to_owned());
        let outcome = HttpOutcome::new(
            200,
            headers,
            Bytes::from_static(b"caf\xE9"),
            Charset::Latin1,
        );

        assert_eq!(outcome.status(), 200);
        assert_eq!(outcome.header("Content-Type"), Some("text/plain"));
        assert_eq!(outcome.text(), "caf\u{e9}");
        assert_eq!(outcome.into_body().len(), 4);
    }

    #[tokio::test]
    async fn test_read_body_collects_frames() {
        let body = read_body(full_body(b"hello"), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(body, "hello");
    }

    struct StalledBody;

    impl http_body::Body for StalledBody {
        type Data = Bytes;
        type Error = BoxError;

        fn poll_frame(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
            std::task::Poll::Pending
        }
    }

    #[tokio::test]
    async fn test_read_body_times_out_between_frames() {
        let result = read_body(StalledBody.boxed(), Some(Duration::from_millis(20))).await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_copy_body_writes_everything() {
        let mut out = Vec::new();
        let written = copy_body(full_body(b"payload"), None, &mut out)
            .await
            .unwrap();
        assert_eq!(written, 7);
        assert_eq!(out, b"payload");
    }

    #[test]
    fn test_file_name_from_disposition() {
        assert_eq!(
            derive_file_name(
                Some("attachment; filename=\"report.pdf\""),
                "http://h/download?id=3"
            )
            .as_deref(),
            Some("report.pdf")
        );
        assert!(derive_file_name(Some("inline"), "http://h/a/b.txt").is_none());
    }

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(
            derive_file_name(None, "http://h/files/a.txt?x=1").as_deref(),
            Some("a.txt")
        );
        assert!(derive_file_name(None, "http://h/files/").is_none());
        assert_eq!(last_path_segment("not a url/x.bin").as_deref(), Some("x.bin"));
    }
}
