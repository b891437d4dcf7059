use crate::body::OutgoingBody;
use crate::charset::Charset;
use crate::config::{DEFAULT_POOL_IDLE_TIMEOUT, HttpClientConfiguration};
use crate::connector::{ProxyConnector, ProxyRoute, ProxyRouting};
use crate::error::{BoxError, HttpAccessError, TransportError};
use crate::layers::{ConnectionLimitLayer, RedirectPolicy};
use crate::response::{ResponseBody, map_decompression_response};
use crate::validator::{ResponseStatusValidator, SimpleResponseValidator};
use http::{Request, Response};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tower::buffer::Buffer;
use tower::timeout::TimeoutLayer;
use tower::util::BoxCloneService;
use tower::{Layer, Service, ServiceBuilder, ServiceExt};
use tower_http::decompression::DecompressionLayer;
use tower_http::follow_redirect::FollowRedirectLayer;

const BUFFER_CAPACITY: usize = 1024;

type InnerService =
    BoxCloneService<Request<OutgoingBody>, Response<ResponseBody>, TransportError>;

/// Future type of the inner service
pub type ServiceFuture =
    Pin<Box<dyn Future<Output = Result<Response<ResponseBody>, TransportError>> + Send>>;

type BufferedService = Buffer<Request<OutgoingBody>, ServiceFuture>;

/// Reusable client bound to one connection pool.
///
/// Cloning is cheap: clones share the pool, the connection limits and the
/// buffer worker.
#[derive(Clone)]
pub struct PooledClient {
    service: BufferedService,
    socket_timeout: Option<Duration>,
}

impl PooledClient {
    /// Send one request.
    ///
    /// Every HTTP status is returned as `Ok`; only transport failures are errors.
    ///
    /// # Errors
    /// Returns [`TransportError`] on connect, TLS, tunnel or timeout failures.
    pub async fn send(
        &self,
        request: Request<OutgoingBody>,
    ) -> Result<Response<ResponseBody>, TransportError> {
        let mut service = self.service.clone();
        service.ready().await.map_err(map_buffer_error)?;
        service.call(request).await.map_err(map_buffer_error)
    }

    /// Bound applied to each body read, when configured
    #[must_use]
    pub fn socket_timeout(&self) -> Option<Duration> {
        self.socket_timeout
    }
}

impl fmt::Debug for PooledClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledClient")
            .field("socket_timeout", &self.socket_timeout)
            .finish_non_exhaustive()
    }
}

/// Owner of the pooled, proxy-aware client and of the settings it was built from.
///
/// Construction validates the configuration (charsets, proxy port policy) but
/// does not touch the network. The client itself is built on first use; when
/// several calls race for it, exactly one pool is created.
///
/// Share one service between executors through `Arc`:
///
/// ```ignore
/// let service = Arc::new(HttpAccessService::new(config)?);
/// let access = HttpAccess::new(Arc::clone(&service));
/// ```
pub struct HttpAccessService {
    config: HttpClientConfiguration,
    routing: Arc<ProxyRouting>,
    validator: Arc<dyn ResponseStatusValidator>,
    content_charset: Charset,
    element_charset: Charset,
    client: OnceCell<PooledClient>,
}

impl HttpAccessService {
    /// Build a service validating statuses against the configured allow-list.
    ///
    /// # Errors
    /// Returns [`HttpAccessError::UnsupportedCharset`] for unknown charsets and
    /// [`HttpAccessError::Configuration`] for a rejected proxy setup.
    pub fn new(config: HttpClientConfiguration) -> Result<Self, HttpAccessError> {
        let validator = SimpleResponseValidator::new(&config.responses_code_authorized);
        Self::with_validator(config, Arc::new(validator))
    }

    /// Build a service with a custom status validator.
    ///
    /// # Errors
    /// Same as [`new`](Self::new).
    pub fn with_validator(
        config: HttpClientConfiguration,
        validator: Arc<dyn ResponseStatusValidator>,
    ) -> Result<Self, HttpAccessError> {
        let content_charset = config.content_charset()?;
        let element_charset = config.element_charset()?;
        let routing = Arc::new(ProxyRouting::from_config(&config)?);

        Ok(Self {
            config,
            routing,
            validator,
            content_charset,
            element_charset,
            client: OnceCell::new(),
        })
    }

    #[must_use]
    pub fn configuration(&self) -> &HttpClientConfiguration {
        &self.config
    }

    #[must_use]
    pub fn validator(&self) -> &dyn ResponseStatusValidator {
        self.validator.as_ref()
    }

    #[must_use]
    pub fn content_charset(&self) -> Charset {
        self.content_charset
    }

    #[must_use]
    pub fn element_charset(&self) -> Charset {
        self.element_charset
    }

    /// The proxy requests to `host` go through, `None` for direct access
    #[must_use]
    pub fn proxy_for(&self, host: &str) -> Option<&ProxyRoute> {
        self.routing.proxy_for(host)
    }

    /// The pooled client serving `host`.
    ///
    /// All hosts share one pool; the proxy decision for `host` is applied by
    /// the connector when a connection is opened.
    ///
    /// # Errors
    /// Returns [`HttpAccessError::Tls`] if the TLS connector cannot be built.
    pub async fn client_for(&self, host: &str) -> Result<&PooledClient, HttpAccessError> {
        let client = self
            .client
            .get_or_try_init(|| async { build_client(&self.config, Arc::clone(&self.routing)) })
            .await?;
        tracing::trace!(
            host,
            proxied = self.routing.proxy_for(host).is_some(),
            "Pooled client selected"
        );
        Ok(client)
    }
}

impl fmt::Debug for HttpAccessService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpAccessService")
            .field("config", &self.config)
            .field("routing", &self.routing)
            .field("content_charset", &self.content_charset)
            .field("element_charset", &self.element_charset)
            .field("client_built", &self.client.initialized())
            .finish_non_exhaustive()
    }
}

/// Assemble the hyper client and its tower stack.
///
/// Request flow (outer → inner):
///   Buffer → ConnectionLimit? → Timeout? → Decompression → FollowRedirect →
///   forwarded proxy credentials → hyper client → TLS → `ProxyConnector`
fn build_client(
    config: &HttpClientConfiguration,
    routing: Arc<ProxyRouting>,
) -> Result<PooledClient, HttpAccessError> {
    let connect_timeout = config.connection_timeout();
    let socket_timeout = config.socket_timeout();

    let forward_routing = Arc::clone(&routing);
    let connector = ProxyConnector::new(routing, connect_timeout);
    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_provider_and_webpki_roots(get_crypto_provider())
        .map_err(|e| HttpAccessError::Tls(Box::new(e)))?
        .https_or_http()
        .enable_http1()
        .wrap_connector(connector);

    let mut client_builder = Client::builder(TokioExecutor::new());
    // pool_timer is required for pool_idle_timeout to work
    client_builder
        .pool_timer(TokioTimer::new())
        .pool_idle_timeout(DEFAULT_POOL_IDLE_TIMEOUT);
    if let Some(max_per_host) = config.max_connections_per_host() {
        client_builder.pool_max_idle_per_host(max_per_host);
    }
    let hyper_client = client_builder.build::<_, OutgoingBody>(https);

    let redirect_policy = RedirectPolicy::new(config.redirect.clone());
    let service = ServiceBuilder::new()
        .layer(DecompressionLayer::new())
        .layer(FollowRedirectLayer::with_policy(redirect_policy))
        // below the redirect layer, so every hop is authorized
        .map_request(move |mut request: Request<OutgoingBody>| {
            forward_routing.authorize_forwarded(&mut request);
            request
        })
        .service(hyper_client)
        .map_response(map_decompression_response)
        .map_err(move |e: hyper_util::client::legacy::Error| {
            map_client_error(e, connect_timeout)
        });
    let mut boxed_service: InnerService = service.boxed_clone();

    if let Some(timeout) = socket_timeout {
        boxed_service = ServiceBuilder::new()
            .layer(TimeoutLayer::new(timeout))
            .service(boxed_service)
            .map_err(move |e: BoxError| map_tower_error(e, timeout))
            .boxed_clone();
    }

    let max_total = config.max_total_connections();
    let max_per_host = config.max_connections_per_host();
    if max_total.is_some() || max_per_host.is_some() {
        boxed_service = ConnectionLimitLayer::new(max_total, max_per_host)
            .layer(boxed_service)
            .boxed_clone();
    }

    tracing::debug!(
        connect_timeout = ?connect_timeout,
        socket_timeout = ?socket_timeout,
        max_total = ?max_total,
        max_per_host = ?max_per_host,
        "Pooled HTTP client built"
    );

    Ok(PooledClient {
        service: Buffer::new(boxed_service, BUFFER_CAPACITY),
        socket_timeout,
    })
}

/// Crypto provider for TLS: the process default if installed, else aws-lc-rs.
fn get_crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

/// A connect attempt cut by the connector's timeout surfaces as `TimedOut`.
fn map_client_error(
    err: hyper_util::client::legacy::Error,
    connect_timeout: Option<Duration>,
) -> TransportError {
    match connect_timeout {
        Some(timeout) if err.is_connect() && is_timed_out(&err) => {
            TransportError::Timeout(timeout)
        }
        _ => TransportError::Io(Box::new(err)),
    }
}

fn is_timed_out(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = Some(err);
    while let Some(current) = source {
        if let Some(io) = current.downcast_ref::<std::io::Error>()
            && io.kind() == std::io::ErrorKind::TimedOut
        {
            return true;
        }
        source = current.source();
    }
    false
}

/// Map tower errors to `TransportError` with the actual timeout duration
fn map_tower_error(err: BoxError, timeout: Duration) -> TransportError {
    if err.is::<tower::timeout::error::Elapsed>() {
        return TransportError::Timeout(timeout);
    }
    match err.downcast::<TransportError>() {
        Ok(transport_err) => *transport_err,
        Err(other) => TransportError::Io(other),
    }
}

/// Map buffer errors back to the inner `TransportError`
fn map_buffer_error(err: BoxError) -> TransportError {
    match err.downcast::<TransportError>() {
        Ok(transport_err) => *transport_err,
        Err(err) => {
            tracing::error!(
                error = %err,
                "buffer worker closed unexpectedly; service unavailable"
            );
            TransportError::ServiceClosed
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::config::ProxyPortPolicy;
    use http_body_util::BodyExt;
    use httpmock::prelude::*;

    fn get(url: &str) -> Request<OutgoingBody> {
        Request::builder()
            .uri(url)
            .body(OutgoingBody::empty())
            .unwrap()
    }

    #[test]
    fn test_unknown_charset_is_rejected() {
        let config = HttpClientConfiguration {
            content_charset: "KOI8-R".to_owned(),
            ..Default::default()
        };
        let err = HttpAccessService::new(config).unwrap_err();
        assert!(matches!(err, HttpAccessError::UnsupportedCharset(_)));
    }

    #[test]
    fn test_strict_proxy_port_is_rejected() {
        let config = HttpClientConfiguration {
            proxy_host: Some("proxy.local".to_owned()),
            proxy_port: Some("http".to_owned()),
            proxy_port_policy: ProxyPortPolicy::Strict,
            ..Default::default()
        };
        assert!(matches!(
            HttpAccessService::new(config),
            Err(HttpAccessError::Configuration(_))
        ));
    }

    #[test]
    fn test_default_validator_uses_allow_list() {
        let config = HttpClientConfiguration {
            responses_code_authorized: "200, 204".to_owned(),
            ..Default::default()
        };
        let service = HttpAccessService::new(config).unwrap();
        assert!(service.validator().validate(204));
        assert!(!service.validator().validate(201));
    }

    #[test]
    fn test_custom_validator() {
        let service = HttpAccessService::with_validator(
            HttpClientConfiguration::default(),
            Arc::new(|status: u16| status == 404),
        )
        .unwrap();
        assert!(service.validator().validate(404));
        assert!(!service.validator().validate(200));
    }

    #[test]
    fn test_proxy_decision_per_host() {
        let config = HttpClientConfiguration {
            proxy_host: Some("proxy.local".to_owned()),
            proxy_port: Some("8080".to_owned()),
            no_proxy_for: vec!["*.internal".to_owned()],
            ..Default::default()
        };
        let service = HttpAccessService::new(config).unwrap();
        assert!(service.proxy_for("svc.internal").is_none());
        assert!(service.proxy_for("svc.external.com").is_some());
    }

    #[tokio::test]
    async fn test_client_is_built_once() {
        let service = HttpAccessService::new(HttpClientConfiguration::default()).unwrap();

        let (a, b) = tokio::join!(
            service.client_for("a.example"),
            service.client_for("b.example")
        );
        assert!(std::ptr::eq(a.unwrap(), b.unwrap()));
    }

    #[tokio::test]
    async fn test_send_returns_any_status() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(GET).path("/missing");
            then.status(404).body("nope");
        });

        let service = HttpAccessService::new(HttpClientConfiguration::default()).unwrap();
        let client = service.client_for("127.0.0.1").await.unwrap();
        let response = client.send(get(&server.url("/missing"))).await.unwrap();

        assert_eq!(response.status(), 404);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "nope");
    }

    #[tokio::test]
    async fn test_socket_timeout_applies_to_response_headers() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(GET).path("/slow");
            then.status(200).delay(Duration::from_millis(500));
        });

        let config = HttpClientConfiguration {
            socket_timeout: Some(50),
            ..Default::default()
        };
        let service = HttpAccessService::new(config).unwrap();
        let client = service.client_for("127.0.0.1").await.unwrap();
        let err = client.send(get(&server.url("/slow"))).await.unwrap_err();

        assert!(matches!(err, TransportError::Timeout(d) if d == Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn test_redirects_are_followed() {
        let server = MockServer::start();
        let _from = server.mock(|when, then| {
            when.method(GET).path("/old");
            then.status(302).header("Location", "/new");
        });
        let _to = server.mock(|when, then| {
            when.method(GET).path("/new");
            then.status(200).body("moved here");
        });

        let service = HttpAccessService::new(HttpClientConfiguration::default()).unwrap();
        let client = service.client_for("127.0.0.1").await.unwrap();
        let response = client.send(get(&server.url("/old"))).await.unwrap();

        assert_eq!(response.status(), 200);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "moved here");
    }

    #[tokio::test]
    async fn test_connection_refused_is_io_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let service = HttpAccessService::new(HttpClientConfiguration::default()).unwrap();
        let client = service.client_for("127.0.0.1").await.unwrap();
        let err = client
            .send(get(&format!("http://127.0.0.1:{port}/")))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
    }

    #[test]
    fn test_map_tower_error_elapsed() {
        let err: BoxError = Box::new(tower::timeout::error::Elapsed::new());
        let mapped = map_tower_error(err, Duration::from_secs(3));
        assert!(matches!(mapped, TransportError::Timeout(d) if d == Duration::from_secs(3)));
    }

    #[test]
    fn test_map_tower_error_passes_transport_error_through() {
        let err: BoxError = Box::new(TransportError::ServiceClosed);
        assert!(matches!(
            map_tower_error(err, Duration::from_secs(1)),
            TransportError::ServiceClosed
        ));
    }

    #[test]
    fn test_map_buffer_error_unknown_is_service_closed() {
        let err: BoxError = Box::new(std::io::Error::other("worker gone"));
        assert!(matches!(map_buffer_error(err), TransportError::ServiceClosed));
    }

    #[test]
    fn test_timed_out_is_found_in_source_chain() {
        #[derive(Debug)]
        struct Wrapper(std::io::Error);
        impl fmt::Display for Wrapper {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("connect failed")
            }
        }
        impl std::error::Error for Wrapper {
            fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
                Some(&self.0)
            }
        }

        let timed_out = Wrapper(std::io::Error::from(std::io::ErrorKind::TimedOut));
        let refused = Wrapper(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert!(is_timed_out(&timed_out));
        assert!(!is_timed_out(&refused));
    }
}
