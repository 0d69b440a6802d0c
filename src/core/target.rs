//! # Endpoint Targets
//!
//! Where a feed connects to. Besides a fixed URL the target can be a closure
//! resolved on every connection attempt, so rotating gateways and short-lived
//! ticket URLs slot in without special casing in the drivers.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use url::Url;

use crate::error::FeedError;

/// Endpoint of a feed, resolved at connect time.
#[derive(Clone)]
pub enum Target {
    /// A fixed endpoint.
    Url(String),
    /// Resolved synchronously on each attempt.
    Provider(Arc<dyn Fn() -> String + Send + Sync>),
    /// Resolved through an async lookup on each attempt. Lookup failures are
    /// treated like connection failures by the drivers.
    AsyncProvider(Arc<dyn Fn() -> BoxFuture<'static, Result<String, FeedError>> + Send + Sync>),
}

impl Target {
    /// Produces and validates the endpoint for the next attempt.
    pub async fn resolve(&self) -> Result<Url, FeedError> {
        let raw = match self {
            Target::Url(url) => url.clone(),
            Target::Provider(provider) => provider(),
            Target::AsyncProvider(provider) => provider().await?,
        };
        Ok(Url::parse(&raw)?)
    }
}

impl From<&str> for Target {
    fn from(url: &str) -> Self {
        Target::Url(url.to_string())
    }
}

impl From<String> for Target {
    fn from(url: String) -> Self {
        Target::Url(url)
    }
}

impl From<Url> for Target {
    fn from(url: Url) -> Self {
        Target::Url(url.into())
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Url(url) => f.debug_tuple("Url").field(url).finish(),
            Target::Provider(_) => f.write_str("Provider(..)"),
            Target::AsyncProvider(_) => f.write_str("AsyncProvider(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixed_url_resolves_and_validates() {
        let target = Target::from("wss://stream.example.com/feed?version=2");
        let url = target.resolve().await.expect("valid url");
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.host_str(), Some("stream.example.com"));
    }

    #[tokio::test]
    async fn invalid_url_is_rejected() {
        let target = Target::from("not a url");
        assert!(matches!(
            target.resolve().await,
            Err(FeedError::InvalidEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn provider_runs_on_every_resolve() {
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let calls = Arc::clone(&counter);
        let target = Target::Provider(Arc::new(move || {
            let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            format!("https://gw{n}.example.com/poll")
        }));

        let first = target.resolve().await.expect("valid");
        let second = target.resolve().await.expect("valid");
        assert_eq!(first.host_str(), Some("gw0.example.com"));
        assert_eq!(second.host_str(), Some("gw1.example.com"));
    }

    #[tokio::test]
    async fn async_provider_failures_surface() {
        let target = Target::AsyncProvider(Arc::new(|| {
            Box::pin(async { Err(FeedError::ResolveFailed("ticket service down".into())) })
        }));
        assert!(matches!(
            target.resolve().await,
            Err(FeedError::ResolveFailed(_))
        ));
    }
}
