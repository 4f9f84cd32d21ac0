use super::Processor;
use crate::config::ProxyConfig;
use crate::error::Result;
use crate::http::RequestHeader;
use crate::resource::{RemoteResource, Resource};
use crate::upstream::UpstreamClient;
use async_trait::async_trait;
use std::sync::Arc;

/// Plain pass-through of GET, POST and HEAD requests
pub struct GetPostProcessor {
    upstream: Arc<UpstreamClient>,
}

impl GetPostProcessor {
    pub fn new(upstream: Arc<UpstreamClient>) -> Self {
        GetPostProcessor { upstream }
    }
}

#[async_trait]
impl Processor for GetPostProcessor {
    fn supported_methods(&self) -> &[&'static str] {
        &["GET", "POST", "HEAD"]
    }

    async fn on_request(
        &self,
        request: &mut RequestHeader,
        config: &ProxyConfig,
    ) -> Result<Box<dyn Resource>> {
        let client = self.upstream.client(config)?;
        Ok(Box::new(RemoteResource::new(client, request.uri())))
    }
}
