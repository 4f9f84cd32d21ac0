//! Serves video downloads from the cache, filling it on a miss

use super::caching_listener::CachingListener;
use super::metadata::MetadataCache;
use super::title::TitleResolver;
use crate::cache::{CacheEntry, CacheStore};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::http::RequestHeader;
use crate::metrics::ProxyMetrics;
use crate::processor::Processor;
use crate::resource::{FileResource, RemoteResource, Resource};
use crate::upstream::UpstreamClient;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::{info, warn};

/// Video server URL, e.g. `http://smile-clb51.nicovideo.jp/smile?s=7074214.90075as3`
static MOVIE_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^http://[^/]+(?:smilevideo|nicovideo)\.jp/smile\?(\w)=([^.]+)\.\d+(?:as3)?(low)?$")
        .expect("movie url regex")
});

/// The parts of a video server URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovieRequest {
    /// Format letter: `v`, `m` or `s`
    pub format: String,
    /// Numeric id without the type prefix
    pub id: String,
    /// Whether the low quality variant was requested
    pub low: bool,
}

impl MovieRequest {
    pub fn parse(uri: &str) -> Option<Self> {
        let caps = MOVIE_URL_RE.captures(uri)?;
        Some(MovieRequest {
            format: caps[1].to_string(),
            id: caps[2].to_string(),
            low: caps.get(3).is_some(),
        })
    }

    /// Cache file extension for the format
    pub fn extension(&self) -> &'static str {
        match self.format.as_str() {
            "v" => ".flv",
            "m" => ".mp4",
            "s" => ".swf",
            _ => ".unknown",
        }
    }

    /// Type prefix to assume when nothing is recorded for the id
    pub fn guessed_kind(&self) -> &'static str {
        if self.format.ends_with('s') {
            "nm"
        } else {
            "sm"
        }
    }
}

/// Processor for video server requests
pub struct CachingProcessor {
    store: Arc<CacheStore>,
    metadata: Arc<MetadataCache>,
    titles: Arc<dyn TitleResolver>,
    upstream: Arc<UpstreamClient>,
    metrics: Arc<ProxyMetrics>,
}

impl CachingProcessor {
    pub fn new(
        store: Arc<CacheStore>,
        metadata: Arc<MetadataCache>,
        titles: Arc<dyn TitleResolver>,
        upstream: Arc<UpstreamClient>,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        CachingProcessor {
            store,
            metadata,
            titles,
            upstream,
            metrics,
        }
    }

    /// Resolve the cache entry for `movie`
    ///
    /// The low quality id is used only when the regular one is not cached.
    async fn entry_for(&self, movie: &MovieRequest, kind: &str, title: Option<&str>) -> CacheEntry {
        let entry = self
            .store
            .open(&format!("{}{}", kind, movie.id), movie.extension(), title);
        if movie.low && !entry.exists().await {
            return self.store.open(
                &format!("{}{}low", kind, movie.id),
                movie.extension(),
                title,
            );
        }
        entry
    }

    /// Build the resource for `movie`
    ///
    /// On a miss the video is fetched from `request`'s URI and mirrored into
    /// the cache.
    pub async fn resource_for(
        &self,
        movie: &MovieRequest,
        request: &mut RequestHeader,
        config: &ProxyConfig,
    ) -> Result<Box<dyn Resource>> {
        let info = if config.title {
            self.metadata.get(&movie.id)
        } else {
            None
        };
        let kind = info
            .as_ref()
            .map(|info| info.kind.clone())
            .unwrap_or_else(|| movie.guessed_kind().to_string());
        let title = info.as_ref().and_then(|info| info.title.as_deref());

        let entry = self.entry_for(movie, &kind, title).await;

        if entry.exists().await {
            info!("using cache: {}", entry.file_name());
            if config.touch_cache {
                if let Err(e) = entry.touch().await {
                    warn!("{}: {}", entry.file_name(), e);
                }
            }
            self.metrics
                .record_cache_hit(entry.len().await.unwrap_or_default());
            return Ok(Box::new(FileResource::new(entry.file())));
        }

        let client = self.upstream.client(config)?;

        let title_task = if config.title && !info.as_ref().is_some_and(|i| i.title_valid()) {
            let titles = Arc::clone(&self.titles);
            let id = movie.id.clone();
            let kind = kind.clone();
            Some(tokio::spawn(async move { titles.resolve(&kind, &id).await }))
        } else {
            None
        };

        info!("no cache found: {}", entry.file_name());

        // the browser's own range would not line up with the cache
        request.headers_mut().remove("Range");
        request.headers_mut().remove("If-Range");

        let duplicate = self.store.is_in_progress(entry.id());
        let temp_len = entry.temp_len().await?;
        let (cached_prefix, resume_from) =
            if temp_len > 0 && (duplicate || config.resume_download) {
                request
                    .headers_mut()
                    .set("Range", format!("bytes={}-", temp_len));
                (Some(entry.open_temp_reader().await?), temp_len)
            } else {
                (None, 0)
            };

        if !duplicate {
            self.store.set_in_progress(entry.id(), u64::MAX);
        }
        self.metrics.record_cache_miss(duplicate);

        let mut resource = RemoteResource::new(client, request.uri());
        resource.add_transfer_listener(Box::new(CachingListener::new(
            entry,
            title_task,
            cached_prefix,
            resume_from,
            duplicate,
            config.resume_download,
            Arc::clone(&self.metrics),
        )));
        Ok(Box::new(resource))
    }
}

#[async_trait]
impl Processor for CachingProcessor {
    fn supported_methods(&self) -> &[&'static str] {
        &["GET"]
    }

    fn supported_url(&self) -> Option<&Regex> {
        Some(&*MOVIE_URL_RE)
    }

    async fn on_request(
        &self,
        request: &mut RequestHeader,
        config: &ProxyConfig,
    ) -> Result<Box<dyn Resource>> {
        let movie = MovieRequest::parse(request.uri())
            .ok_or_else(|| ProxyError::NoRoute(request.uri().to_string()))?;
        self.resource_for(&movie, request, config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_movie_url() {
        let movie = MovieRequest::parse("http://smile-clb51.nicovideo.jp/smile?s=7074214.90075as3").unwrap();
        assert_eq!(movie.format, "s");
        assert_eq!(movie.id, "7074214");
        assert!(!movie.low);
        assert_eq!(movie.extension(), ".swf");
        assert_eq!(movie.guessed_kind(), "nm");

        let movie = MovieRequest::parse("http://s-clb5.smilevideo.jp/smile?v=102982.92382low").unwrap();
        assert_eq!(movie.id, "102982");
        assert!(movie.low);
        assert_eq!(movie.extension(), ".flv");
        assert_eq!(movie.guessed_kind(), "sm");
    }

    #[test]
    fn test_rejects_other_urls() {
        assert!(MovieRequest::parse("http://www.nicovideo.jp/watch/sm9").is_none());
        assert!(MovieRequest::parse("http://example.com/smile?v=9.1").is_none());
        assert!(MovieRequest::parse("http://a.nicovideo.jp/smile?v=9.1&x=1").is_none());
    }

    #[test]
    fn test_extensions() {
        let mut movie = MovieRequest {
            format: "m".to_string(),
            id: "1".to_string(),
            low: false,
        };
        assert_eq!(movie.extension(), ".mp4");
        movie.format = "x".to_string();
        assert_eq!(movie.extension(), ".unknown");
    }
}
