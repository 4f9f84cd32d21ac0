//! Processors that learn video types from pages the browser visits
//!
//! The video server URL only carries the numeric id, so the type prefix is
//! recorded whenever it shows up elsewhere. The request itself is relayed
//! unchanged.

use super::metadata::MetadataCache;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::http::RequestHeader;
use crate::processor::Processor;
use crate::resource::{RemoteResource, Resource};
use crate::upstream::UpstreamClient;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

static TYPE_ID_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^http://(?:ext\.nicovideo\.jp/thumb(?:_watch)?|www\.nicovideo\.jp/api/getflv)/([a-z]{2})(\d+)",
    )
    .expect("type id url regex")
});

static WATCH_PAGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^http://www\.nicovideo\.jp/watch/([a-z]{2})?(\d+)(?:\?.*)?$")
        .expect("watch page regex")
});

/// Records the type from embedded player and API URLs
pub struct RecordingUrlProcessor {
    metadata: Arc<MetadataCache>,
    upstream: Arc<UpstreamClient>,
}

impl RecordingUrlProcessor {
    pub fn new(metadata: Arc<MetadataCache>, upstream: Arc<UpstreamClient>) -> Self {
        RecordingUrlProcessor { metadata, upstream }
    }
}

#[async_trait]
impl Processor for RecordingUrlProcessor {
    fn supported_methods(&self) -> &[&'static str] {
        &["GET", "HEAD"]
    }

    fn supported_url(&self) -> Option<&Regex> {
        Some(&*TYPE_ID_URL_RE)
    }

    async fn on_request(
        &self,
        request: &mut RequestHeader,
        config: &ProxyConfig,
    ) -> Result<Box<dyn Resource>> {
        let caps = TYPE_ID_URL_RE
            .captures(request.uri())
            .ok_or_else(|| ProxyError::NoRoute(request.uri().to_string()))?;
        self.metadata.put_pending(&caps[1], &caps[2]);
        debug!("type recorded: {} => {}", &caps[2], &caps[1]);

        let client = self.upstream.client(config)?;
        Ok(Box::new(RemoteResource::new(client, request.uri())))
    }
}

/// Records the type from watch page URLs
pub struct RecordingWatchProcessor {
    metadata: Arc<MetadataCache>,
    upstream: Arc<UpstreamClient>,
}

impl RecordingWatchProcessor {
    pub fn new(metadata: Arc<MetadataCache>, upstream: Arc<UpstreamClient>) -> Self {
        RecordingWatchProcessor { metadata, upstream }
    }
}

#[async_trait]
impl Processor for RecordingWatchProcessor {
    fn supported_methods(&self) -> &[&'static str] {
        &["GET"]
    }

    fn supported_url(&self) -> Option<&Regex> {
        Some(&*WATCH_PAGE_RE)
    }

    async fn on_request(
        &self,
        request: &mut RequestHeader,
        config: &ProxyConfig,
    ) -> Result<Box<dyn Resource>> {
        let caps = WATCH_PAGE_RE
            .captures(request.uri())
            .ok_or_else(|| ProxyError::NoRoute(request.uri().to_string()))?;
        if let Some(kind) = caps.get(1) {
            self.metadata.put_pending(kind.as_str(), &caps[2]);
            debug!("type recorded: {} => {}", &caps[2], kind.as_str());
        }

        let client = self.upstream.client(config)?;
        Ok(Box::new(RemoteResource::new(client, request.uri())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processors() -> (Arc<MetadataCache>, RecordingUrlProcessor, RecordingWatchProcessor) {
        let metadata = Arc::new(MetadataCache::new(100));
        let upstream = Arc::new(UpstreamClient::new());
        (
            metadata.clone(),
            RecordingUrlProcessor::new(metadata.clone(), upstream.clone()),
            RecordingWatchProcessor::new(metadata, upstream),
        )
    }

    #[test]
    fn test_url_patterns() {
        assert!(TYPE_ID_URL_RE.is_match("http://ext.nicovideo.jp/thumb/sm9"));
        assert!(TYPE_ID_URL_RE.is_match("http://ext.nicovideo.jp/thumb_watch/nm123?w=1"));
        assert!(TYPE_ID_URL_RE.is_match("http://www.nicovideo.jp/api/getflv/sm9?as3=1"));
        assert!(!TYPE_ID_URL_RE.is_match("http://www.nicovideo.jp/api/getflv?v=sm9"));

        assert!(WATCH_PAGE_RE.is_match("http://www.nicovideo.jp/watch/sm9"));
        assert!(WATCH_PAGE_RE.is_match("http://www.nicovideo.jp/watch/1234?ref=top"));
        assert!(!WATCH_PAGE_RE.is_match("http://www.nicovideo.jp/watch/sm9/extra"));
    }

    #[tokio::test]
    async fn test_records_type_from_thumb_url() {
        let (metadata, url_processor, _) = processors();
        let mut request = RequestHeader::new("GET", "http://ext.nicovideo.jp/thumb/nm42", "HTTP/1.1");
        url_processor
            .on_request(&mut request, &ProxyConfig::default())
            .await
            .unwrap();

        let info = metadata.get("42").unwrap();
        assert_eq!(info.kind, "nm");
        assert!(!info.title_valid());
    }

    #[tokio::test]
    async fn test_watch_page_without_type_records_nothing() {
        let (metadata, _, watch_processor) = processors();
        let mut request = RequestHeader::new("GET", "http://www.nicovideo.jp/watch/1234", "HTTP/1.1");
        watch_processor
            .on_request(&mut request, &ProxyConfig::default())
            .await
            .unwrap();
        assert!(metadata.is_empty());

        let mut request = RequestHeader::new("GET", "http://www.nicovideo.jp/watch/sm9", "HTTP/1.1");
        watch_processor
            .on_request(&mut request, &ProxyConfig::default())
            .await
            .unwrap();
        assert_eq!(metadata.get("9").unwrap().kind, "sm");
    }
}
