//! # Provider
//!
//! External interfaces the HTTP store depends on.

use anyhow::Result;
use async_trait::async_trait;
use http::{Request, Response};

/// Host-provided HTTP client abstraction.
#[async_trait]
pub trait HttpRequest: Send + Sync + 'static {
    /// Make an outbound HTTP request and return the raw response.
    ///
    /// An `Err` means the request never produced a response.
    async fn fetch(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>>;
}
