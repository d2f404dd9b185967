//! The network seam used by the cache worker and the service worker host.

use async_trait::async_trait;
use tracing::debug;

use crate::{NetError, Request, ResourceLoader, Response};

/// Something that can turn a request into a response.
///
/// The service worker layer only ever talks to the network through this
/// trait, which keeps it independent of reqwest.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Perform the request.
    async fn fetch(&self, request: Request) -> Result<Response, NetError>;
}

#[async_trait]
impl Fetcher for ResourceLoader {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        self.load(request).await
    }
}

/// A fetcher for running without connectivity: every request fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisconnectedFetcher;

#[async_trait]
impl Fetcher for DisconnectedFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        debug!(url = %request.url, "Network disconnected");
        Err(NetError::Offline(request.url.to_string()))
    }
}
