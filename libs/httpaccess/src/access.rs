use crate::auth::{AuthenticationContext, AuthenticationMaterial};
use crate::body::OutgoingBody;
use crate::charset::Charset;
use crate::error::{HttpAccessError, InvalidUriKind, TransportError};
use crate::file_item::{DEFAULT_CONTENT_TYPE, MemoryFileItem};
use crate::multipart::{MultipartEncoder, TempFileSet};
use crate::request::{MultipartForm, RequestBody, RequestOptions, Verb};
use crate::response::{
    CopyError, HttpOutcome, ResponseBody, collect_headers, copy_body, derive_file_name, read_body,
};
use crate::security::redact_url;
use crate::service::HttpAccessService;
use crate::validator::ResponseStatusValidator;
use http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response, Uri};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use url::form_urlencoded;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Body text reported when a rejected response body cannot be read
const UNREADABLE_BODY: &str = "<response body unavailable>";

/// Name of a downloaded item when neither headers nor URL provide one
const DEFAULT_DOWNLOAD_NAME: &str = "download";

/// Encoded request entity and its `Content-Type`
struct Entity {
    content_type: String,
    body: OutgoingBody,
    /// Set the entity type even when the caller supplied a `Content-Type`
    overrides_caller_type: bool,
}

/// Executes HTTP requests through a shared [`HttpAccessService`].
///
/// Every call goes through the same steps: the URL is validated, caller headers
/// are applied (a later value replaces an earlier one of the same name), the
/// authenticator's parameters and headers are merged (its headers win), the
/// body is encoded, and the exchange runs on the pooled client. A status
/// rejected by the validator becomes
/// [`InvalidResponseStatus`](HttpAccessError::InvalidResponseStatus) carrying
/// the response body. Temporary files created for multipart uploads are
/// removed once the exchange is over, whatever its outcome.
///
/// URLs in errors and log lines are password-redacted.
///
/// ```ignore
/// let service = Arc::new(HttpAccessService::new(config)?);
/// let access = HttpAccess::new(service);
///
/// let page = access.do_get("https://example.com/", RequestOptions::new()).await?;
/// let outcome = access
///     .execute(Verb::Post, "https://example.com/api", RequestOptions::new().json(&payload)?)
///     .await?;
/// ```
#[derive(Clone)]
pub struct HttpAccess {
    service: Arc<HttpAccessService>,
    validator: Option<Arc<dyn ResponseStatusValidator>>,
}

impl HttpAccess {
    #[must_use]
    pub fn new(service: Arc<HttpAccessService>) -> Self {
        Self {
            service,
            validator: None,
        }
    }

    /// Executor validating statuses with `validator` instead of the service's
    #[must_use]
    pub fn with_validator(
        service: Arc<HttpAccessService>,
        validator: Arc<dyn ResponseStatusValidator>,
    ) -> Self {
        Self {
            service,
            validator: Some(validator),
        }
    }

    #[must_use]
    pub fn service(&self) -> &HttpAccessService {
        &self.service
    }

    fn validator(&self) -> &dyn ResponseStatusValidator {
        match &self.validator {
            Some(validator) => validator.as_ref(),
            None => self.service.validator(),
        }
    }

    /// Send one request and read the whole response.
    ///
    /// # Errors
    /// - [`HttpAccessError::InvalidUri`] for a malformed or non-HTTP URL;
    /// - [`HttpAccessError::Authentication`] (or any error) raised by the authenticator;
    /// - [`HttpAccessError::LocalResource`] when a multipart temp file cannot be written;
    /// - [`HttpAccessError::AccessFailed`] on transport failure or timeout;
    /// - [`HttpAccessError::InvalidResponseStatus`] when the validator rejects the status.
    pub async fn execute(
        &self,
        verb: Verb,
        url: &str,
        options: RequestOptions,
    ) -> Result<HttpOutcome, HttpAccessError> {
        let redacted = redact_url(url);
        let (request, temp_files) = self.prepare(verb, url, &redacted, options).await?;
        let result = self.fetch(verb, request, &redacted).await;
        temp_files.cleanup();
        result
    }

    /// Send one request and stream the accepted response body into `writer`.
    ///
    /// The writer is shut down on every path. Returns the number of bytes written.
    ///
    /// # Errors
    /// Same as [`execute`](Self::execute), plus
    /// [`HttpAccessError::LocalResource`] when writing to or closing `writer` fails.
    pub async fn execute_into<W>(
        &self,
        verb: Verb,
        url: &str,
        options: RequestOptions,
        writer: &mut W,
    ) -> Result<u64, HttpAccessError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let redacted = redact_url(url);
        let result = self.stream_into(verb, url, &redacted, options, writer).await;
        match writer.shutdown().await {
            Ok(()) => result,
            Err(e) if result.is_ok() => Err(HttpAccessError::local("Error closing output", e)),
            Err(e) => {
                tracing::warn!(url = %redacted, error = %e, "Failed to close output");
                result
            }
        }
    }

    /// GET `url` and return the body as text
    ///
    /// # Errors
    /// See [`execute`](Self::execute).
    pub async fn do_get(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<String, HttpAccessError> {
        self.text(Verb::Get, url, options).await
    }

    /// POST a URL-encoded form
    ///
    /// # Errors
    /// See [`execute`](Self::execute).
    pub async fn do_post<I, K, V>(
        &self,
        url: &str,
        params: I,
        options: RequestOptions,
    ) -> Result<String, HttpAccessError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.text(Verb::Post, url, options.form(params)).await
    }

    /// POST a URL-encoded form where a name may carry several values
    ///
    /// # Errors
    /// See [`execute`](Self::execute).
    pub async fn do_post_multi_values<I, K, VS, V>(
        &self,
        url: &str,
        params: I,
        options: RequestOptions,
    ) -> Result<String, HttpAccessError>
    where
        I: IntoIterator<Item = (K, VS)>,
        K: Into<String>,
        VS: IntoIterator<Item = V>,
        V: Into<String>,
    {
        let fields: Vec<(String, String)> = params
            .into_iter()
            .flat_map(|(name, values)| {
                let name: String = name.into();
                values
                    .into_iter()
                    .map(move |value| (name.clone(), value.into()))
            })
            .collect();
        self.text(Verb::Post, url, options.form(fields)).await
    }

    /// POST a JSON document
    ///
    /// # Errors
    /// See [`execute`](Self::execute).
    pub async fn do_post_json(
        &self,
        url: &str,
        json: &str,
        options: RequestOptions,
    ) -> Result<String, HttpAccessError> {
        self.text(Verb::Post, url, options.json_text(json)).await
    }

    /// POST a `multipart/form-data` body
    ///
    /// # Errors
    /// See [`execute`](Self::execute).
    pub async fn do_post_multipart(
        &self,
        url: &str,
        form: MultipartForm,
        options: RequestOptions,
    ) -> Result<String, HttpAccessError> {
        self.text(Verb::Post, url, options.multipart(form)).await
    }

    /// PUT a URL-encoded form
    ///
    /// # Errors
    /// See [`execute`](Self::execute).
    pub async fn do_put<I, K, V>(
        &self,
        url: &str,
        params: I,
        options: RequestOptions,
    ) -> Result<String, HttpAccessError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.text(Verb::Put, url, options.form(params)).await
    }

    /// PUT a JSON document
    ///
    /// # Errors
    /// See [`execute`](Self::execute).
    pub async fn do_put_json(
        &self,
        url: &str,
        json: &str,
        options: RequestOptions,
    ) -> Result<String, HttpAccessError> {
        self.text(Verb::Put, url, options.json_text(json)).await
    }

    /// PUT text with an explicit content type
    ///
    /// # Errors
    /// See [`execute`](Self::execute).
    pub async fn do_put_raw(
        &self,
        url: &str,
        content: &str,
        content_type: &str,
        options: RequestOptions,
    ) -> Result<String, HttpAccessError> {
        self.text(Verb::Put, url, options.raw(content, content_type))
            .await
    }

    /// # Errors
    /// See [`execute`](Self::execute).
    pub async fn do_delete(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<String, HttpAccessError> {
        self.text(Verb::Delete, url, options).await
    }

    /// DELETE with a JSON document as body
    ///
    /// # Errors
    /// See [`execute`](Self::execute).
    pub async fn do_delete_json(
        &self,
        url: &str,
        json: &str,
        options: RequestOptions,
    ) -> Result<String, HttpAccessError> {
        self.text(Verb::Delete, url, options.json_text(json)).await
    }

    /// GET `url` into a file at `path`, created or truncated.
    ///
    /// A partially written file is left in place when the transfer fails.
    ///
    /// # Errors
    /// See [`execute_into`](Self::execute_into); failing to create the file
    /// is a [`HttpAccessError::LocalResource`].
    pub async fn download_file(
        &self,
        url: &str,
        path: impl AsRef<Path>,
        options: RequestOptions,
    ) -> Result<u64, HttpAccessError> {
        let path = path.as_ref();
        let mut file = tokio::fs::File::create(path).await.map_err(|e| {
            HttpAccessError::local(format!("Error creating file {}", path.display()), e)
        })?;
        self.execute_into(Verb::Get, url, options, &mut file).await
    }

    /// GET `url` into `writer`, which is shut down afterwards
    ///
    /// # Errors
    /// See [`execute_into`](Self::execute_into).
    pub async fn download_to_writer<W>(
        &self,
        url: &str,
        options: RequestOptions,
        writer: &mut W,
    ) -> Result<u64, HttpAccessError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.execute_into(Verb::Get, url, options, writer).await
    }

    /// GET `url` into memory.
    ///
    /// The item is named after the `Content-Disposition` file name or the last
    /// URL path segment, and typed after `Content-Type`.
    ///
    /// # Errors
    /// See [`execute`](Self::execute).
    pub async fn download_file_item(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<MemoryFileItem, HttpAccessError> {
        let outcome = self.execute(Verb::Get, url, options).await?;
        let name = derive_file_name(outcome.header(CONTENT_DISPOSITION.as_str()), url)
            .unwrap_or_else(|| DEFAULT_DOWNLOAD_NAME.to_owned());
        let content_type = outcome
            .header(CONTENT_TYPE.as_str())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_owned();
        Ok(MemoryFileItem::new(outcome.into_body(), name, content_type))
    }

    /// File name a GET of `url` would download, without reading the body.
    ///
    /// Taken from the `Content-Disposition` `filename`, else the last URL path
    /// segment. `None` when a `Content-Disposition` carries no quoted filename.
    ///
    /// # Errors
    /// See [`execute`](Self::execute).
    pub async fn get_file_name(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<Option<String>, HttpAccessError> {
        let redacted = redact_url(url);
        let (request, temp_files) = self.prepare(Verb::Get, url, &redacted, options).await?;
        let result = self
            .dispatch(Verb::Get, request, &redacted)
            .await
            .map(|(response, _)| {
                // the body is dropped unread
                let disposition = response
                    .headers()
                    .get(CONTENT_DISPOSITION)
                    .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned());
                derive_file_name(disposition.as_deref(), url)
            });
        temp_files.cleanup();
        result
    }

    async fn text(
        &self,
        verb: Verb,
        url: &str,
        options: RequestOptions,
    ) -> Result<String, HttpAccessError> {
        Ok(self.execute(verb, url, options).await?.text())
    }

    async fn stream_into<W>(
        &self,
        verb: Verb,
        url: &str,
        redacted: &str,
        options: RequestOptions,
        writer: &mut W,
    ) -> Result<u64, HttpAccessError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let (request, temp_files) = self.prepare(verb, url, redacted, options).await?;
        let result = async {
            let (response, socket_timeout) = self.dispatch(verb, request, redacted).await?;
            copy_body(response.into_body(), socket_timeout, writer)
                .await
                .map_err(|e| match e {
                    CopyError::Read(source) => access_failed(redacted, source),
                    CopyError::Write(source) => {
                        HttpAccessError::local("Error writing response to output", source)
                    }
                })
        }
        .await;
        temp_files.cleanup();
        result
    }

    async fn fetch(
        &self,
        verb: Verb,
        request: Request<OutgoingBody>,
        redacted: &str,
    ) -> Result<HttpOutcome, HttpAccessError> {
        let (response, socket_timeout) = self.dispatch(verb, request, redacted).await?;
        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let body = read_body(response.into_body(), socket_timeout)
            .await
            .map_err(|source| access_failed(redacted, source))?;
        Ok(HttpOutcome::new(
            status,
            headers,
            body,
            self.service.content_charset(),
        ))
    }

    /// Run the exchange and validate the status.
    ///
    /// Returns the accepted response and the per-read timeout for its body.
    async fn dispatch(
        &self,
        verb: Verb,
        request: Request<OutgoingBody>,
        redacted: &str,
    ) -> Result<(Response<ResponseBody>, Option<Duration>), HttpAccessError> {
        let host = request.uri().host().unwrap_or_default().to_owned();
        let client = self.service.client_for(&host).await?;

        tracing::debug!(method = %verb, url = %redacted, "Sending HTTP request");
        let response = client
            .send(request)
            .await
            .map_err(|source| access_failed(redacted, source))?;

        let status = response.status().as_u16();
        if !self.validator().validate(status) {
            let body = match read_body(response.into_body(), client.socket_timeout()).await {
                Ok(bytes) => self.service.content_charset().decode(&bytes),
                Err(e) => {
                    tracing::warn!(url = %redacted, error = %e, "Could not read rejected response body");
                    UNREADABLE_BODY.to_owned()
                }
            };
            tracing::error!(status, url = %redacted, "HTTP response status rejected");
            return Err(HttpAccessError::InvalidResponseStatus {
                status,
                url: redacted.to_owned(),
                body,
            });
        }

        tracing::debug!(status, url = %redacted, "HTTP response accepted");
        Ok((response, client.socket_timeout()))
    }

    /// Build the request; temp files created on the way are returned with it
    /// or removed on failure.
    async fn prepare(
        &self,
        verb: Verb,
        url: &str,
        redacted: &str,
        options: RequestOptions,
    ) -> Result<(Request<OutgoingBody>, TempFileSet), HttpAccessError> {
        let mut temp_files = TempFileSet::new();
        match self
            .build_request(verb, url, redacted, options, &mut temp_files)
            .await
        {
            Ok(request) => Ok((request, temp_files)),
            Err(err) => {
                temp_files.cleanup();
                Err(err)
            }
        }
    }

    async fn build_request(
        &self,
        verb: Verb,
        url: &str,
        redacted: &str,
        options: RequestOptions,
        temp_files: &mut TempFileSet,
    ) -> Result<Request<OutgoingBody>, HttpAccessError> {
        parse_uri(url, redacted)?;
        let RequestOptions {
            headers: caller_headers,
            authenticator,
            signing_elements,
            body,
        } = options;

        let material = match &authenticator {
            Some(authenticator) => {
                let parameters: &[(String, String)] = match &body {
                    RequestBody::Form(fields) => fields,
                    _ => &[],
                };
                let context = AuthenticationContext {
                    verb,
                    url,
                    parameters,
                };
                authenticator
                    .authenticate(&context, &signing_elements)
                    .await?
            }
            None => AuthenticationMaterial::default(),
        };

        let (query, entity) = self
            .encode_body(verb, body, material.parameters, temp_files)
            .await?;
        let uri = with_query(url, redacted, &query, self.service.content_charset())?;

        let mut headers = HeaderMap::new();
        for (name, value) in caller_headers.iter().chain(&material.headers) {
            headers.insert(
                HeaderName::from_bytes(name.as_bytes())?,
                HeaderValue::from_str(value)?,
            );
        }

        let body = match entity {
            Some(entity) => {
                if entity.overrides_caller_type || !headers.contains_key(CONTENT_TYPE) {
                    headers.insert(CONTENT_TYPE, HeaderValue::from_str(&entity.content_type)?);
                }
                entity.body
            }
            None => OutgoingBody::empty(),
        };

        let mut request = Request::builder()
            .method(verb.method())
            .uri(uri)
            .body(body)?;
        *request.headers_mut() = headers;
        Ok(request)
    }

    /// Encode the body, returning the parameters left for the query string.
    ///
    /// Authenticator parameters join the form for POST and PUT, the multipart
    /// text parts for multipart bodies, and the query string otherwise.
    async fn encode_body(
        &self,
        verb: Verb,
        body: RequestBody,
        mut auth_params: Vec<(String, String)>,
        temp_files: &mut TempFileSet,
    ) -> Result<(Vec<(String, String)>, Option<Entity>), HttpAccessError> {
        let charset = self.service.content_charset();
        let encoded = match body {
            RequestBody::Empty if verb.encloses_form() && !auth_params.is_empty() => {
                (Vec::new(), Some(form_entity(&auth_params, charset)))
            }
            RequestBody::Empty => (auth_params, None),
            RequestBody::Form(mut fields) => {
                fields.append(&mut auth_params);
                if verb.encloses_form() {
                    (Vec::new(), Some(form_entity(&fields, charset)))
                } else {
                    (fields, None)
                }
            }
            RequestBody::Multipart(form) => {
                let encoded = MultipartEncoder::new(charset, self.service.element_charset())
                    .encode(&form, &auth_params, temp_files)
                    .await?;
                let entity = Entity {
                    content_type: encoded.content_type,
                    body: encoded.body,
                    overrides_caller_type: true,
                };
                (Vec::new(), Some(entity))
            }
            RequestBody::Raw {
                content,
                content_type,
                charset: explicit,
            } => (
                auth_params,
                Some(raw_entity(&content, &content_type, explicit.unwrap_or(charset))),
            ),
        };
        Ok(encoded)
    }
}

impl fmt::Debug for HttpAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpAccess")
            .field("service", &self.service)
            .field("custom_validator", &self.validator.is_some())
            .finish()
    }
}

fn access_failed(url: &str, source: TransportError) -> HttpAccessError {
    tracing::error!(url, error = %source, "HTTP access failed");
    HttpAccessError::AccessFailed {
        url: url.to_owned(),
        source,
    }
}

fn invalid_uri(redacted: &str, kind: InvalidUriKind, reason: String) -> HttpAccessError {
    HttpAccessError::InvalidUri {
        url: redacted.to_owned(),
        kind,
        reason,
    }
}

fn parse_uri(url: &str, redacted: &str) -> Result<Uri, HttpAccessError> {
    let uri: Uri = url.parse().map_err(|e: http::uri::InvalidUri| {
        invalid_uri(redacted, InvalidUriKind::ParseError, e.to_string())
    })?;

    if uri.authority().is_none() {
        return Err(invalid_uri(
            redacted,
            InvalidUriKind::MissingAuthority,
            "missing host/authority".to_owned(),
        ));
    }

    match uri.scheme_str() {
        Some("http" | "https") => Ok(uri),
        Some(scheme) => Err(invalid_uri(
            redacted,
            InvalidUriKind::UnsupportedScheme,
            format!("unsupported scheme '{scheme}'"),
        )),
        None => Err(invalid_uri(
            redacted,
            InvalidUriKind::UnsupportedScheme,
            "missing scheme".to_owned(),
        )),
    }
}

/// Append `query` to the URL's query string, encoded with `charset`
fn with_query(
    url: &str,
    redacted: &str,
    query: &[(String, String)],
    charset: Charset,
) -> Result<Uri, HttpAccessError> {
    if query.is_empty() {
        return parse_uri(url, redacted);
    }
    let mut parsed = url::Url::parse(url)
        .map_err(|e| invalid_uri(redacted, InvalidUriKind::ParseError, e.to_string()))?;
    parsed
        .query_pairs_mut()
        .encoding_override(charset.form_encoding())
        .extend_pairs(query);
    parse_uri(parsed.as_str(), redacted)
}

fn form_entity(fields: &[(String, String)], charset: Charset) -> Entity {
    let body = form_urlencoded::Serializer::new(String::new())
        .encoding_override(charset.form_encoding())
        .extend_pairs(fields)
        .finish();
    Entity {
        content_type: format!("{FORM_CONTENT_TYPE}; charset={charset}"),
        body: OutgoingBody::buffered(body),
        overrides_caller_type: false,
    }
}

/// Text entity; a charset named by `content_type` takes precedence over `fallback`
fn raw_entity(content: &str, content_type: &str, fallback: Charset) -> Entity {
    let declared = content_type
        .parse::<mime::Mime>()
        .ok()
        .and_then(|parsed| parsed.get_param(mime::CHARSET).map(|c| c.as_str().to_owned()));
    let (content_type, charset) = match declared {
        Some(name) => (content_type.to_owned(), name.parse().unwrap_or(fallback)),
        None => (format!("{content_type}; charset={fallback}"), fallback),
    };
    Entity {
        content_type,
        body: OutgoingBody::buffered(charset.encode(content).into_owned()),
        overrides_caller_type: true,
    }
}
