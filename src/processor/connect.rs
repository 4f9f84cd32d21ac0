use super::Processor;
use crate::config::ProxyConfig;
use crate::error::Result;
use crate::http::RequestHeader;
use crate::resource::{Resource, TunnelResource};
use async_trait::async_trait;

/// Opens a tunnel for CONNECT requests
#[derive(Default)]
pub struct ConnectProcessor;

impl ConnectProcessor {
    pub fn new() -> Self {
        ConnectProcessor
    }
}

#[async_trait]
impl Processor for ConnectProcessor {
    fn supported_methods(&self) -> &[&'static str] {
        &["CONNECT"]
    }

    async fn on_request(
        &self,
        request: &mut RequestHeader,
        _config: &ProxyConfig,
    ) -> Result<Box<dyn Resource>> {
        Ok(Box::new(TunnelResource::new(request.uri())?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProxyError;

    #[tokio::test]
    async fn test_rejects_bad_target() {
        let mut request = RequestHeader::new("CONNECT", "no-port", "HTTP/1.1");
        let result = ConnectProcessor::new()
            .on_request(&mut request, &ProxyConfig::default())
            .await;
        assert!(matches!(result, Err(ProxyError::InvalidHostport(_))));
    }
}
