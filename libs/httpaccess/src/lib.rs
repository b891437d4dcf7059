#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Pooled, proxy-aware HTTP access
//!
//! This crate provides a shared HTTP client and a request executor with:
//! - One connection pool per service, built lazily on first use
//! - Per-host proxy routing, with a glob bypass list and optional basic proxy
//!   credentials; https goes through `CONNECT` tunnels, plain http is forwarded
//! - Connection limits, in total and per host
//! - Connect and socket timeouts
//! - Status validation against an allow-list of codes
//! - URL-encoded, JSON, raw and `multipart/form-data` bodies, with file parts
//!   streamed from disk
//! - Request signing through a pluggable [`RequestAuthenticator`]
//! - File downloads to disk, to a writer or to memory
//!
//! Passwords found in URL query strings never reach errors or log lines.
//!
//! # Example
//!
//! ```ignore
//! use httpaccess::{HttpAccess, HttpAccessService, HttpClientConfiguration, RequestOptions};
//! use std::sync::Arc;
//!
//! let config = HttpClientConfiguration {
//!     proxy_host: Some("proxy.corp".to_owned()),
//!     proxy_port: Some("3128".to_owned()),
//!     no_proxy_for: vec!["*.corp".to_owned()],
//!     ..Default::default()
//! };
//! let access = HttpAccess::new(Arc::new(HttpAccessService::new(config)?));
//!
//! let page = access.do_get("https://example.com/", RequestOptions::new()).await?;
//! let created = access
//!     .do_post("https://example.com/items", [("name", "a")], RequestOptions::new())
//!     .await?;
//! ```

mod access;
mod auth;
mod body;
mod charset;
mod config;
mod connector;
mod error;
mod file_item;
mod layers;
mod multipart;
pub mod pattern;
mod request;
mod response;
pub mod security;
mod service;
mod validator;

pub use access::HttpAccess;
pub use auth::{AuthenticationContext, AuthenticationMaterial, RequestAuthenticator};
pub use body::{OutgoingBody, SegmentedBody};
pub use charset::Charset;
pub use config::{
    CONFIG_SECTION, DEFAULT_POOL_IDLE_TIMEOUT, HttpClientConfiguration, ProxyPortPolicy,
    RedirectConfig,
};
pub use connector::{ProxiedStream, ProxyConnector, ProxyRoute, ProxyRouting};
pub use error::{BoxError, HttpAccessError, InvalidUriKind, TransportError};
pub use file_item::{DEFAULT_CONTENT_TYPE, DiskFileItem, FileItem, MemoryFileItem};
pub use layers::{ConnectionLimitLayer, ConnectionLimitService, RedirectPolicy};
pub use multipart::{EncodedMultipart, MultipartEncoder, TempFileSet};
pub use request::{JSON_CONTENT_TYPE, MultipartForm, RequestBody, RequestOptions, Verb};
pub use response::{HttpOutcome, ResponseBody, derive_file_name};
pub use service::{HttpAccessService, PooledClient, ServiceFuture};
pub use validator::{
    DEFAULT_AUTHORIZED_STATUS_CODES, ResponseStatusValidator, SimpleResponseValidator,
};
