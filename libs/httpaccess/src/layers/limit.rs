//! Connection limits for the pooled client
//!
//! A request holds one total permit and one permit for its route (scheme,
//! host and port) from the moment it is sent until its response body is
//! dropped, which is when hyper hands the connection back to the pool.
//! Requests over the limit wait for a permit. Routes with no request in flight
//! are forgotten when a new route is first seen.

use crate::error::TransportError;
use crate::response::ResponseBody;
use bytes::Bytes;
use dashmap::DashMap;
use http::{Request, Response, Uri};
use http_body::Frame;
use http_body_util::BodyExt;
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tower::{Layer, Service};

#[derive(Debug)]
struct ConnectionLimits {
    total: Option<Arc<Semaphore>>,
    per_route: Option<usize>,
    routes: DashMap<String, Arc<Semaphore>>,
}

#[derive(Debug)]
struct Permits {
    _route: Option<OwnedSemaphorePermit>,
    _total: Option<OwnedSemaphorePermit>,
}

impl ConnectionLimits {
    async fn acquire(&self, uri: &Uri) -> Result<Permits, TransportError> {
        // route first, so a request blocked on a busy host does not hold a total permit
        let route = match self.per_route {
            Some(max) => Some(acquire(self.route_semaphore(route_key(uri), max)).await?),
            None => None,
        };
        let total = match &self.total {
            Some(semaphore) => Some(acquire(Arc::clone(semaphore)).await?),
            None => None,
        };
        Ok(Permits {
            _route: route,
            _total: total,
        })
    }

    fn route_semaphore(&self, key: String, max: usize) -> Arc<Semaphore> {
        if let Some(existing) = self.routes.get(&key) {
            return Arc::clone(&existing);
        }
        // permits and waiters hold a clone, so a count of 1 means idle
        self.routes.retain(|_, semaphore| {
            Arc::strong_count(semaphore) > 1 || semaphore.available_permits() < max
        });
        Arc::clone(
            &self
                .routes
                .entry(key)
                .or_insert_with(|| Arc::new(Semaphore::new(max))),
        )
    }
}

async fn acquire(semaphore: Arc<Semaphore>) -> Result<OwnedSemaphorePermit, TransportError> {
    semaphore
        .acquire_owned()
        .await
        .map_err(|_| TransportError::ServiceClosed)
}

fn route_key(uri: &Uri) -> String {
    let scheme = uri.scheme_str().unwrap_or("http");
    let host = uri.host().unwrap_or_default();
    match uri.port_u16() {
        Some(port) => format!("{scheme}://{host}:{port}"),
        None => format!("{scheme}://{host}"),
    }
}

/// Limits connections in use, in total and per route.
///
/// A limit of `0` is treated as `1`.
#[derive(Debug, Clone)]
pub struct ConnectionLimitLayer {
    limits: Arc<ConnectionLimits>,
}

impl ConnectionLimitLayer {
    #[must_use]
    pub fn new(max_total: Option<usize>, max_per_route: Option<usize>) -> Self {
        Self {
            limits: Arc::new(ConnectionLimits {
                total: max_total.map(|max| Arc::new(Semaphore::new(max.max(1)))),
                per_route: max_per_route.map(|max| max.max(1)),
                routes: DashMap::new(),
            }),
        }
    }
}

impl<S> Layer<S> for ConnectionLimitLayer {
    type Service = ConnectionLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ConnectionLimitService {
            inner,
            limits: Arc::clone(&self.limits),
        }
    }
}

/// Service created by [`ConnectionLimitLayer`]
#[derive(Debug, Clone)]
pub struct ConnectionLimitService<S> {
    inner: S,
    limits: Arc<ConnectionLimits>,
}

impl<S, B> Service<Request<B>> for ConnectionLimitService<S>
where
    S: Service<Request<B>, Response = Response<ResponseBody>, Error = TransportError>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
    B: Send + 'static,
{
    type Response = Response<ResponseBody>;
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        // keep the instance that was polled ready
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let limits = Arc::clone(&self.limits);

        Box::pin(async move {
            let permits = limits.acquire(request.uri()).await?;
            let response = inner.call(request).await?;
            Ok(response.map(|body| PermitBody::new(body, permits).boxed()))
        })
    }
}

pin_project! {
    /// Response body that releases connection permits when dropped.
    struct PermitBody {
        #[pin]
        inner: ResponseBody,
        _permits: Permits,
    }
}

impl PermitBody {
    fn new(inner: ResponseBody, permits: Permits) -> Self {
        Self {
            inner,
            _permits: permits,
        }
    }
}

impl http_body::Body for PermitBody {
    type Data = Bytes;
    type Error = crate::error::BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.project().inner.poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}
