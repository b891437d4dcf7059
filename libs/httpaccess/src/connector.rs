//! Proxy-aware dialing for the shared connection pool
//!
//! The proxy decision is taken per destination host when a new connection is
//! opened, so proxied and direct destinations share one pool. Proxied https
//! destinations are reached through a `CONNECT` tunnel. Plain http requests
//! are sent to the proxy itself in absolute form, with the credentials added
//! per request by [`ProxyRouting::authorize_forwarded`].

use crate::config::{HttpClientConfiguration, ProxyPortPolicy};
use crate::error::{BoxError, HttpAccessError};
use crate::pattern;
use base64::{Engine as _, engine::general_purpose};
use http::header::PROXY_AUTHORIZATION;
use http::uri::Scheme;
use http::{HeaderValue, Request, Uri};
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_util::client::legacy::connect::proxy::Tunnel;
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use hyper_util::rt::TokioIo;
use secrecy::ExposeSecret;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::TcpStream;
use tower::{Service, ServiceExt};

/// The proxy a destination is reached through
#[derive(Debug, Clone)]
pub struct ProxyRoute {
    uri: Uri,
    authorization: Option<HeaderValue>,
}

impl ProxyRoute {
    /// Proxy address, `http://{proxyHost}:{proxyPort}`
    #[must_use]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Whether `Proxy-Authorization` is sent to the proxy
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        self.authorization.is_some()
    }
}

/// Decides, per destination host, whether to go through the proxy.
#[derive(Debug, Clone, Default)]
pub struct ProxyRouting {
    proxy: Option<ProxyRoute>,
    no_proxy_for: Vec<String>,
}

impl ProxyRouting {
    /// # Errors
    /// Returns [`HttpAccessError::Configuration`] when the proxy host has no
    /// valid port under [`ProxyPortPolicy::Strict`], or when the proxy address
    /// or credentials are not valid header material.
    pub fn from_config(config: &HttpClientConfiguration) -> Result<Self, HttpAccessError> {
        let Some(host) = config.proxy_host.as_deref().filter(|h| !h.is_empty()) else {
            return Ok(Self::default());
        };

        let Some(port) = config.proxy_port_number() else {
            let raw = config.proxy_port.as_deref().unwrap_or_default();
            return match config.proxy_port_policy {
                ProxyPortPolicy::Strict => Err(HttpAccessError::Configuration(format!(
                    "proxy host '{host}' has no valid port (got '{raw}')"
                ))),
                ProxyPortPolicy::Lenient => {
                    tracing::warn!(
                        proxy_host = %host,
                        proxy_port = %raw,
                        "Proxy port missing or invalid, requests go direct"
                    );
                    Ok(Self::default())
                }
            };
        };

        let uri: Uri = format!("http://{host}:{port}").parse().map_err(
            |e: http::uri::InvalidUri| {
                HttpAccessError::Configuration(format!("invalid proxy host '{host}': {e}"))
            },
        )?;

        let authorization = match (&config.proxy_user_name, &config.proxy_password) {
            (Some(user), Some(password)) => {
                Some(basic_authorization(user, password.expose_secret())?)
            }
            _ => None,
        };

        tracing::debug!(
            proxy = %uri,
            credentials = authorization.is_some(),
            no_proxy_for = ?config.no_proxy_for,
            "Proxy routing configured"
        );

        Ok(Self {
            proxy: Some(ProxyRoute { uri, authorization }),
            no_proxy_for: config.no_proxy_for.clone(),
        })
    }

    /// The proxy to use for `host`, or `None` to connect directly.
    ///
    /// IPv6 literals match with or without their brackets.
    #[must_use]
    pub fn proxy_for(&self, host: &str) -> Option<&ProxyRoute> {
        let proxy = self.proxy.as_ref()?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if pattern::matches_any(&self.no_proxy_for, host) {
            tracing::debug!(host, "Proxy bypassed");
            return None;
        }
        Some(proxy)
    }

    /// Add `Proxy-Authorization` to a plain http request sent through a proxy
    /// with credentials. https requests authenticate on the `CONNECT` instead.
    pub fn authorize_forwarded<B>(&self, request: &mut Request<B>) {
        if request.uri().scheme() != Some(&Scheme::HTTP) {
            return;
        }
        let authorization = request
            .uri()
            .host()
            .and_then(|host| self.proxy_for(host))
            .and_then(|route| route.authorization.clone());
        if let Some(authorization) = authorization {
            request.headers_mut().insert(PROXY_AUTHORIZATION, authorization);
        }
    }
}

fn basic_authorization(user: &str, password: &str) -> Result<HeaderValue, HttpAccessError> {
    let encoded = general_purpose::STANDARD.encode(format!("{user}:{password}"));
    let mut value = HeaderValue::from_str(&format!("Basic {encoded}"))?;
    value.set_sensitive(true);
    Ok(value)
}

/// Connector dialing destinations directly, through a `CONNECT` tunnel (https)
/// or to the forwarding proxy (plain http).
#[derive(Debug, Clone)]
pub struct ProxyConnector {
    http: HttpConnector,
    routing: Arc<ProxyRouting>,
}

impl ProxyConnector {
    #[must_use]
    pub fn new(routing: Arc<ProxyRouting>, connect_timeout: Option<std::time::Duration>) -> Self {
        let mut http = HttpConnector::new();
        // https is handled by the TLS connector wrapping this one
        http.enforce_http(false);
        http.set_connect_timeout(connect_timeout);
        Self { http, routing }
    }
}

impl Service<Uri> for ProxyConnector {
    type Response = ProxiedStream;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.http.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let http = self.http.clone();
        let route = dst
            .host()
            .and_then(|host| self.routing.proxy_for(host))
            .cloned();

        Box::pin(async move {
            let Some(route) = route else {
                let inner = http.oneshot(dst).await?;
                return Ok(ProxiedStream::direct(inner));
            };

            if dst.scheme() == Some(&Scheme::HTTPS) {
                tracing::debug!(proxy = %route.uri, host = ?dst.host(), "Opening proxy tunnel");
                let mut tunnel = Tunnel::new(route.uri, http);
                if let Some(authorization) = route.authorization {
                    tunnel = tunnel.with_auth(authorization);
                }
                let inner = tunnel.oneshot(dst).await?;
                return Ok(ProxiedStream::direct(inner));
            }

            tracing::debug!(proxy = %route.uri, host = ?dst.host(), "Connecting to forwarding proxy");
            let inner = http.oneshot(route.uri).await?;
            Ok::<_, BoxError>(ProxiedStream::forwarding(inner))
        })
    }
}

/// Connection opened by [`ProxyConnector`].
///
/// A forwarding connection reports itself as proxied, so requests on it are
/// written with an absolute-form target.
#[derive(Debug)]
pub struct ProxiedStream {
    inner: TokioIo<TcpStream>,
    forwarding: bool,
}

impl ProxiedStream {
    fn direct(inner: TokioIo<TcpStream>) -> Self {
        Self {
            inner,
            forwarding: false,
        }
    }

    fn forwarding(inner: TokioIo<TcpStream>) -> Self {
        Self {
            inner,
            forwarding: true,
        }
    }

    /// Whether requests on this connection go to a forwarding proxy
    #[must_use]
    pub fn is_forwarding(&self) -> bool {
        self.forwarding
    }
}

impl Connection for ProxiedStream {
    fn connected(&self) -> Connected {
        self.inner.connected().proxy(self.forwarding)
    }
}

impl Read for ProxiedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl Write for ProxiedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn proxied_config() -> HttpClientConfiguration {
        HttpClientConfiguration {
            proxy_host: Some("proxy.local".to_owned()),
            proxy_port: Some("3128".to_owned()),
            no_proxy_for: vec!["*.internal".to_owned(), "localhost".to_owned()],
            ..Default::default()
        }
    }

    #[test]
    fn test_bypass_list_is_honoured() {
        let routing = ProxyRouting::from_config(&proxied_config()).unwrap();

        assert!(routing.proxy_for("svc.internal").is_none());
        assert!(routing.proxy_for("localhost").is_none());

        let route = routing.proxy_for("svc.external.com").unwrap();
        assert_eq!(route.uri().host(), Some("proxy.local"));
        assert_eq!(route.uri().port_u16(), Some(3128));
        assert_eq!(route.uri().scheme_str(), Some("http"));
        assert!(!route.has_credentials());
    }

    #[test]
    fn test_no_proxy_host_means_direct() {
        let routing = ProxyRouting::from_config(&HttpClientConfiguration::default()).unwrap();
        assert!(routing.proxy_for("svc.external.com").is_none());
    }

    #[test]
    fn test_bad_port_is_lenient_by_default() {
        for port in [None, Some("abc"), Some("0"), Some("70000")] {
            let config = HttpClientConfiguration {
                proxy_port: port.map(str::to_owned),
                ..proxied_config()
            };
            let routing = ProxyRouting::from_config(&config).unwrap();
            assert!(routing.proxy_for("svc.external.com").is_none());
        }
    }

    #[test]
    fn test_bad_port_warning_is_logged() {
        use std::sync::Mutex;
        use tracing_subscriber::layer::SubscriberExt;

        #[derive(Clone, Default)]
        struct WarningCapture {
            warnings: Arc<Mutex<Vec<String>>>,
        }

        impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for WarningCapture {
            fn on_event(
                &self,
                event: &tracing::Event<'_>,
                _ctx: tracing_subscriber::layer::Context<'_, S>,
            ) {
                if *event.metadata().level() == tracing::Level::WARN {
                    let mut visitor = MessageVisitor(String::new());
                    event.record(&mut visitor);
                    self.warnings.lock().unwrap().push(visitor.0);
                }
            }
        }

        struct MessageVisitor(String);
        impl tracing::field::Visit for MessageVisitor {
            fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                if field.name() == "message" {
                    self.0 = format!("{value:?}");
                }
            }
        }

        let capture = WarningCapture::default();
        let warnings = capture.warnings.clone();
        let subscriber = tracing_subscriber::registry().with(capture);

        let config = HttpClientConfiguration {
            proxy_port: Some("not-a-port".to_owned()),
            ..proxied_config()
        };
        tracing::subscriber::with_default(subscriber, || {
            _ = ProxyRouting::from_config(&config);
        });

        let captured = warnings.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert!(captured[0].contains("requests go direct"));
    }

    #[test]
    fn test_bad_port_fails_when_strict() {
        let config = HttpClientConfiguration {
            proxy_port: Some("abc".to_owned()),
            proxy_port_policy: ProxyPortPolicy::Strict,
            ..proxied_config()
        };
        let err = ProxyRouting::from_config(&config).unwrap_err();
        assert!(matches!(err, HttpAccessError::Configuration(_)));
        assert!(err.to_string().contains("proxy.local"));
    }

    #[test]
    fn test_credentials_need_user_and_password() {
        let user_only = HttpClientConfiguration {
            proxy_user_name: Some("bob".to_owned()),
            ..proxied_config()
        };
        let routing = ProxyRouting::from_config(&user_only).unwrap();
        assert!(!routing.proxy_for("a.com").unwrap().has_credentials());

        let both = HttpClientConfiguration {
            proxy_user_name: Some("bob".to_owned()),
            proxy_password: Some(SecretString::new("s3cret".into())),
            ..proxied_config()
        };
        let routing = ProxyRouting::from_config(&both).unwrap();
        assert!(routing.proxy_for("a.com").unwrap().has_credentials());
    }

    #[test]
    fn test_ipv6_literal_matches_without_brackets() {
        let config = HttpClientConfiguration {
            no_proxy_for: vec!["::1".to_owned()],
            ..proxied_config()
        };
        let routing = ProxyRouting::from_config(&config).unwrap();

        let dst: Uri = "http://[::1]:8080/health".parse().unwrap();
        assert_eq!(dst.host(), Some("[::1]"));
        assert!(routing.proxy_for("[::1]").is_none());
        assert!(routing.proxy_for("::1").is_none());
        assert!(routing.proxy_for("[::2]").is_some());
    }

    #[test]
    fn test_forwarded_http_requests_carry_proxy_credentials() {
        let config = HttpClientConfiguration {
            proxy_user_name: Some("bob".to_owned()),
            proxy_password: Some(SecretString::new("s3cret".into())),
            ..proxied_config()
        };
        let routing = ProxyRouting::from_config(&config).unwrap();
        let request = |uri: &str| Request::get(uri).body(()).unwrap();

        let mut plain = request("http://svc.external.com/a");
        routing.authorize_forwarded(&mut plain);
        assert_eq!(
            plain.headers()[PROXY_AUTHORIZATION].to_str().unwrap(),
            "Basic Ym9iOnMzY3JldA=="
        );

        let mut tunnelled = request("https://svc.external.com/a");
        routing.authorize_forwarded(&mut tunnelled);
        assert!(!tunnelled.headers().contains_key(PROXY_AUTHORIZATION));

        let mut bypassed = request("http://svc.internal/a");
        routing.authorize_forwarded(&mut bypassed);
        assert!(!bypassed.headers().contains_key(PROXY_AUTHORIZATION));
    }

    #[test]
    fn test_basic_authorization_header() {
        let value = basic_authorization("bob", "s3cret").unwrap();
        assert_eq!(value.to_str().unwrap(), "Basic Ym9iOnMzY3JldA==");
        assert!(value.is_sensitive());
    }
}
