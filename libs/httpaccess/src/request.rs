use crate::auth::RequestAuthenticator;
use crate::charset::Charset;
use crate::error::HttpAccessError;
use crate::file_item::FileItem;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Content type sent with JSON bodies
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// HTTP verbs supported by [`HttpAccess`](crate::HttpAccess)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Post,
    Put,
    Delete,
}

impl Verb {
    #[must_use]
    pub fn method(self) -> http::Method {
        match self {
            Self::Get => http::Method::GET,
            Self::Post => http::Method::POST,
            Self::Put => http::Method::PUT,
            Self::Delete => http::Method::DELETE,
        }
    }

    /// Whether authenticator parameters go into the form body rather than the URL
    #[must_use]
    pub fn encloses_form(self) -> bool {
        matches!(self, Self::Post | Self::Put)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method().as_str())
    }
}

/// Body of an outgoing request
#[derive(Default)]
#[non_exhaustive]
pub enum RequestBody {
    #[default]
    Empty,
    /// `application/x-www-form-urlencoded` fields, repeated names allowed
    Form(Vec<(String, String)>),
    /// `multipart/form-data`
    Multipart(MultipartForm),
    /// Text sent as-is with the given content type
    ///
    /// `charset` defaults to the configured content charset.
    Raw {
        content: String,
        content_type: String,
        charset: Option<Charset>,
    },
}

/// Fields and files of a `multipart/form-data` body
#[derive(Default, Clone)]
pub struct MultipartForm {
    pub(crate) fields: Vec<(String, Vec<String>)>,
    pub(crate) files: Vec<(String, Arc<dyn FileItem>)>,
}

impl MultipartForm {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one text part
    #[must_use]
    pub fn text(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.texts(name, [value])
    }

    /// Add one text part per value, all with the same name
    #[must_use]
    pub fn texts<I, V>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.fields
            .push((name.into(), values.into_iter().map(Into::into).collect()));
        self
    }

    /// Add a file part
    #[must_use]
    pub fn file(mut self, name: impl Into<String>, item: impl FileItem + 'static) -> Self {
        self.files.push((name.into(), Arc::new(item)));
        self
    }

    /// Add a shared file part
    #[must_use]
    pub fn shared_file(mut self, name: impl Into<String>, item: Arc<dyn FileItem>) -> Self {
        self.files.push((name.into(), item));
        self
    }
}

/// Per-call options of [`HttpAccess::execute`](crate::HttpAccess::execute).
///
/// Every field is optional; the default sends a bodiless request with no extra
/// headers and no authenticator.
///
/// ```ignore
/// let options = RequestOptions::new()
///     .header("Accept", "application/json")
///     .form([("q", "rust")]);
/// ```
#[derive(Default)]
pub struct RequestOptions {
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) authenticator: Option<Arc<dyn RequestAuthenticator>>,
    pub(crate) signing_elements: Vec<String>,
    pub(crate) body: RequestBody,
}

impl RequestOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a request header; a later value for the same name replaces earlier ones
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Add several request headers
    #[must_use]
    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.headers
            .extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Sign the request with `authenticator`, passing it `signing_elements`
    #[must_use]
    pub fn authenticator(
        mut self,
        authenticator: Arc<dyn RequestAuthenticator>,
        signing_elements: Vec<String>,
    ) -> Self {
        self.authenticator = Some(authenticator);
        self.signing_elements = signing_elements;
        self
    }

    #[must_use]
    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    /// URL-encoded form body
    #[must_use]
    pub fn form<I, K, V>(self, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.body(RequestBody::Form(
            fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        ))
    }

    #[must_use]
    pub fn multipart(self, form: MultipartForm) -> Self {
        self.body(RequestBody::Multipart(form))
    }

    /// Raw text body encoded with the configured content charset
    #[must_use]
    pub fn raw(self, content: impl Into<String>, content_type: impl Into<String>) -> Self {
        self.body(RequestBody::Raw {
            content: content.into(),
            content_type: content_type.into(),
            charset: None,
        })
    }

    /// JSON text body
    #[must_use]
    pub fn json_text(self, json: impl Into<String>) -> Self {
        self.raw(json, JSON_CONTENT_TYPE)
    }

    /// Serialize `value` as the JSON body
    ///
    /// # Errors
    /// Returns [`HttpAccessError::Json`] if serialization fails.
    pub fn json<T: Serialize + ?Sized>(self, value: &T) -> Result<Self, HttpAccessError> {
        Ok(self.json_text(serde_json::to_string(value)?))
    }
}
