use std::time::Duration;

use anyhow::Context;
use futures::future::BoxFuture;

use super::{HttpRequest, HttpResponse};

#[derive(Clone, Debug)]
pub struct ReqwestHttpClient {
    connect_timeout: Duration,
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self {
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl ReqwestHttpClient {
    const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, anyhow::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .build()
            .context("Could not create reqwest client")?;

        let mut builder = client
            .request(request.method, request.url.as_str())
            .headers(request.headers);

        if let Some(body) = request.body {
            builder = builder.body(reqwest::Body::from(body));
        }

        let request = builder
            .build()
            .context("Failed to construct http request")?;
        let requested_url = request.url().clone();

        let mut response = client.execute(request).await?;
        let headers = std::mem::take(response.headers_mut());
        let status = response.status();
        let redirected = response.url() != &requested_url;
        let body = response.bytes().await?;

        Ok(HttpResponse {
            status,
            headers,
            body: Some(body),
            redirected,
        })
    }
}

impl super::HttpClient for ReqwestHttpClient {
    fn request(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, anyhow::Error>> {
        let client = self.clone();
        let f = async move { client.request(request).await };
        Box::pin(f)
    }
}
