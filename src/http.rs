use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fleet_http::HttpRequest;
use http::{Request, Response};

/// [`HttpRequest`] backed by a pooled `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// # Errors
    ///
    /// Returns an error when the TLS backend cannot be initialised.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building http client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpRequest for ReqwestClient {
    async fn fetch(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>> {
        let (parts, body) = request.into_parts();
        let url = parts.uri.to_string();

        let response = self
            .client
            .request(parts.method, &url)
            .headers(parts.headers)
            .body(body)
            .send()
            .await
            .with_context(|| format!("sending request to {url}"))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.context("reading response body")?;

        let mut reply = Response::new(body.to_vec());
        *reply.status_mut() = status;
        *reply.headers_mut() = headers;
        Ok(reply)
    }
}
