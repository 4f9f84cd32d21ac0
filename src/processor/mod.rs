//! Request handlers
//!
//! A [`Processor`] turns an incoming request into the [`Resource`] that
//! answers it. The [`Router`](crate::router::Router) picks the processor by
//! method and URL pattern.

pub mod connect;
pub mod get_post;

pub use connect::ConnectProcessor;
pub use get_post::GetPostProcessor;

use crate::config::ProxyConfig;
use crate::error::Result;
use crate::http::RequestHeader;
use crate::resource::Resource;
use async_trait::async_trait;
use regex::Regex;

/// Produces a resource for the requests it is registered for
#[async_trait]
pub trait Processor: Send + Sync {
    /// Methods to register the processor under
    fn supported_methods(&self) -> &[&'static str];

    /// URL prefix pattern; `None` matches every URL
    fn supported_url(&self) -> Option<&Regex> {
        None
    }

    /// Build the resource answering `request`
    ///
    /// The processor may rewrite `request` before it is relayed.
    async fn on_request(
        &self,
        request: &mut RequestHeader,
        config: &ProxyConfig,
    ) -> Result<Box<dyn Resource>>;
}
