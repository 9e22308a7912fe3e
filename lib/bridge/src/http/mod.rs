//! The HTTP seam used to fetch [`ModuleSource::Url`][crate::ModuleSource::Url]
//! sources.

#[cfg(feature = "host-reqwest")]
pub mod reqwest;

use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{HeaderMap, Method, StatusCode, header::CONTENT_TYPE};
use url::Url;

pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// The media type compiled modules should be served with.
pub const WASM_CONTENT_TYPE: &str = "application/wasm";

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

/// A response, either produced by an [`HttpClient`] or obtained by the host
/// ahead of time and handed over as
/// [`ModuleSource::Response`][crate::ModuleSource::Response].
#[derive(Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub redirected: bool,
}

impl HttpResponse {
    /// A `200 OK` response serving `body` as `application/wasm`.
    pub fn wasm(body: impl Into<Bytes>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, http::HeaderValue::from_static(WASM_CONTENT_TYPE));

        HttpResponse {
            status: StatusCode::OK,
            headers,
            body: Some(body.into()),
            redirected: false,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_success()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &self.body.as_ref().map(|b| b.len()))
            .field("redirected", &self.redirected)
            .finish()
    }
}

pub trait HttpClient: std::fmt::Debug {
    fn request(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, anyhow::Error>>;
}

pub type DynHttpClient = Arc<dyn HttpClient + Send + Sync + 'static>;

/// The client used when the host doesn't provide one.
#[cfg(feature = "host-reqwest")]
pub fn default_http_client() -> Option<DynHttpClient> {
    Some(Arc::new(self::reqwest::ReqwestHttpClient::default()))
}

/// The client used when the host doesn't provide one.
#[cfg(not(feature = "host-reqwest"))]
pub fn default_http_client() -> Option<DynHttpClient> {
    None
}
