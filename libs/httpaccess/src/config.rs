use crate::charset::Charset;
use crate::error::HttpAccessError;
use crate::validator::DEFAULT_AUTHORIZED_STATUS_CODES;
use figment::Figment;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::BuildHasher;
use std::str::FromStr;
use std::time::Duration;

/// Key prefix of every setting, in properties files and figment profiles
pub const CONFIG_SECTION: &str = "httpAccess";

/// Default idle timeout of pooled connections
pub const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// What to do with a proxy host whose port is missing or not a valid port number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyPortPolicy {
    /// Log a warning and send every request directly
    #[default]
    Lenient,
    /// Refuse to build the service
    Strict,
}

/// Redirect following settings
///
/// Redirects are followed transparently to any host. The remaining knobs only
/// control how far and how safely.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RedirectConfig {
    /// Maximum number of redirects to follow (default: 10)
    ///
    /// Set to `0` to return 3xx responses as-is.
    pub max_redirects: usize,

    /// Remove `Authorization`, `Cookie` and `Proxy-Authorization` when a
    /// redirect leaves the original origin (default: true)
    pub strip_sensitive_headers: bool,

    /// Follow HTTPS → HTTP redirects (default: false)
    pub allow_https_downgrade: bool,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            max_redirects: 10,
            strip_sensitive_headers: true,
            allow_https_downgrade: false,
        }
    }
}

impl RedirectConfig {
    /// Never follow redirects
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_redirects: 0,
            ..Self::default()
        }
    }
}

/// Settings of one [`HttpAccessService`](crate::HttpAccessService).
///
/// Fields are plain data: nothing is validated until the service is built, so
/// a partially filled configuration (a proxy host without port, say) loads
/// fine and is judged later according to [`ProxyPortPolicy`].
///
/// Three ways to obtain one:
/// - struct literal with `..Default::default()`;
/// - [`from_properties`](Self::from_properties) for `httpAccess.*` keys;
/// - [`from_figment`](Self::from_figment) for layered YAML/env sources.
#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HttpClientConfiguration {
    pub proxy_host: Option<String>,

    /// Raw port text; see [`proxy_port_number`](Self::proxy_port_number)
    #[serde(deserialize_with = "deserialize_port")]
    pub proxy_port: Option<String>,

    pub proxy_user_name: Option<String>,

    #[serde(deserialize_with = "deserialize_secret")]
    pub proxy_password: Option<SecretString>,

    /// Hosts reached without proxy, as glob patterns
    #[serde(deserialize_with = "deserialize_patterns")]
    pub no_proxy_for: Vec<String>,

    /// Charset of request text and decoded response bodies (default: UTF-8)
    pub content_charset: String,

    /// Charset of multipart part headers; falls back to `content_charset`
    pub element_charset: Option<String>,

    /// Socket read timeout in milliseconds
    pub socket_timeout: Option<u64>,

    /// Connect timeout in milliseconds
    pub connection_timeout: Option<u64>,

    /// Enables the connection limits below
    pub connection_pool_enabled: bool,

    pub connection_pool_max_total_connections: Option<usize>,

    pub connection_pool_max_connections_per_host: Option<usize>,

    /// Comma-separated allow-list for the default response validator
    pub responses_code_authorized: String,

    pub proxy_port_policy: ProxyPortPolicy,

    pub redirect: RedirectConfig,
}

impl Default for HttpClientConfiguration {
    fn default() -> Self {
        Self {
            proxy_host: None,
            proxy_port: None,
            proxy_user_name: None,
            proxy_password: None,
            no_proxy_for: Vec::new(),
            content_charset: Charset::Utf8.name().to_owned(),
            element_charset: None,
            socket_timeout: None,
            connection_timeout: None,
            connection_pool_enabled: false,
            connection_pool_max_total_connections: None,
            connection_pool_max_connections_per_host: None,
            responses_code_authorized: DEFAULT_AUTHORIZED_STATUS_CODES.to_owned(),
            proxy_port_policy: ProxyPortPolicy::Lenient,
            redirect: RedirectConfig::default(),
        }
    }
}

impl HttpClientConfiguration {
    /// Load from a flat properties map with `httpAccess.`-prefixed keys.
    ///
    /// Blank values count as absent. Values that fail to parse are logged and
    /// ignored, leaving the default in place.
    #[must_use]
    pub fn from_properties<S: BuildHasher>(properties: &HashMap<String, String, S>) -> Self {
        let props = Properties(properties);
        let defaults = Self::default();

        Self {
            proxy_host: props.text("proxyHost"),
            proxy_port: props.text("proxyPort"),
            proxy_user_name: props.text("proxyUserName"),
            proxy_password: props
                .text("proxyPassword")
                .map(|password| SecretString::new(password.into())),
            no_proxy_for: props
                .text("noProxyFor")
                .map(|list| split_patterns(&list))
                .unwrap_or_default(),
            content_charset: props
                .text("contentCharset")
                .unwrap_or(defaults.content_charset),
            element_charset: props.text("elementCharset"),
            socket_timeout: props.parsed("socketTimeout"),
            connection_timeout: props.parsed("connectionTimeout"),
            connection_pool_enabled: props
                .parsed("connectionPoolEnabled")
                .unwrap_or(defaults.connection_pool_enabled),
            connection_pool_max_total_connections: props
                .parsed("connectionPoolMaxTotalConnections"),
            connection_pool_max_connections_per_host: props
                .parsed("connectionPoolMaxConnectionsPerHost"),
            responses_code_authorized: props
                .text("responsesCodeAuthorized")
                .unwrap_or(defaults.responses_code_authorized),
            proxy_port_policy: match props.parsed::<bool>("strictProxyPort") {
                Some(true) => ProxyPortPolicy::Strict,
                _ => ProxyPortPolicy::Lenient,
            },
            redirect: defaults.redirect,
        }
    }

    /// Extract the `httpAccess` section of a figment.
    ///
    /// A figment without that section yields the default configuration.
    ///
    /// # Errors
    /// Returns [`HttpAccessError::Configuration`] if the section does not
    /// deserialize.
    pub fn from_figment(figment: &Figment) -> Result<Self, HttpAccessError> {
        if !figment.contains(CONFIG_SECTION) {
            return Ok(Self::default());
        }
        figment
            .extract_inner(CONFIG_SECTION)
            .map_err(|e| HttpAccessError::Configuration(e.to_string()))
    }

    /// Proxy port as a number, if present and in `1..=65535`
    #[must_use]
    pub fn proxy_port_number(&self) -> Option<u16> {
        self.proxy_port
            .as_deref()
            .and_then(|port| port.trim().parse::<u16>().ok())
            .filter(|port| *port != 0)
    }

    #[must_use]
    pub fn socket_timeout(&self) -> Option<Duration> {
        self.socket_timeout.map(Duration::from_millis)
    }

    #[must_use]
    pub fn connection_timeout(&self) -> Option<Duration> {
        self.connection_timeout.map(Duration::from_millis)
    }

    /// # Errors
    /// Returns [`HttpAccessError::UnsupportedCharset`] for unknown names.
    pub fn content_charset(&self) -> Result<Charset, HttpAccessError> {
        self.content_charset.parse()
    }

    /// Element charset, or the content charset when unset
    ///
    /// # Errors
    /// Returns [`HttpAccessError::UnsupportedCharset`] for unknown names.
    pub fn element_charset(&self) -> Result<Charset, HttpAccessError> {
        match &self.element_charset {
            Some(name) => name.parse(),
            None => self.content_charset(),
        }
    }

    /// Per-host connection limit, when pooling limits are enabled
    #[must_use]
    pub fn max_connections_per_host(&self) -> Option<usize> {
        self.connection_pool_max_connections_per_host
            .filter(|_| self.connection_pool_enabled)
    }

    /// Total connection limit, when pooling limits are enabled
    #[must_use]
    pub fn max_total_connections(&self) -> Option<usize> {
        self.connection_pool_max_total_connections
            .filter(|_| self.connection_pool_enabled)
    }
}

struct Properties<'a, S>(&'a HashMap<String, String, S>);

impl<S: BuildHasher> Properties<'_, S> {
    fn text(&self, key: &str) -> Option<String> {
        self.0
            .get(&format!("{CONFIG_SECTION}.{key}"))
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
    }

    fn parsed<T>(&self, key: &str) -> Option<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        let raw = self.text(key)?;
        match raw.parse() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(
                    key = %format!("{CONFIG_SECTION}.{key}"),
                    value = %raw,
                    error = %e,
                    "Invalid httpAccess property, ignored"
                );
                None
            }
        }
    }
}

fn split_patterns(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|pattern| !pattern.is_empty())
        .map(str::to_owned)
        .collect()
}

fn deserialize_patterns<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Patterns {
        Joined(String),
        List(Vec<String>),
    }

    Ok(match Patterns::deserialize(deserializer)? {
        Patterns::Joined(list) => split_patterns(&list),
        Patterns::List(list) => list
            .iter()
            .flat_map(|entry| split_patterns(entry))
            .collect(),
    })
}

fn deserialize_port<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u64),
        Text(String),
    }

    Ok(Option::<Port>::deserialize(deserializer)?.map(|port| match port {
        Port::Number(n) => n.to_string(),
        Port::Text(text) => text,
    }))
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(|secret| SecretString::new(secret.into())))
}
