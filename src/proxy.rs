//! Wires the proxy services together
//!
//! Initialization order matters: the cache index is built before the
//! server accepts its first connection, and the metadata cache starts
//! empty.

use crate::cache::CacheStore;
use crate::config::SharedConfig;
use crate::connection::ConnectionContext;
use crate::error::Result;
use crate::metrics::ProxyMetrics;
use crate::nico::{
    CachingProcessor, MetadataCache, RecordingUrlProcessor, RecordingWatchProcessor,
    ThumbInfoTitleResolver, TitleResolver,
};
use crate::processor::{ConnectProcessor, GetPostProcessor};
use crate::router::Router;
use crate::server::Server;
use crate::upstream::UpstreamClient;
use std::sync::Arc;
use tracing::info;

/// The caching proxy and the services its connections share
pub struct NicoCacheProxy {
    config: SharedConfig,
    store: Arc<CacheStore>,
    metadata: Arc<MetadataCache>,
    upstream: Arc<UpstreamClient>,
    titles: Arc<dyn TitleResolver>,
    metrics: Arc<ProxyMetrics>,
}

impl NicoCacheProxy {
    /// Build the services and index the cache directory
    ///
    /// Leftovers of unfinished moves are removed from the cache root.
    pub async fn new(config: SharedConfig) -> Result<Self> {
        let current = config.current();
        current.validate()?;

        let store = Arc::new(CacheStore::from_config(&current));
        store.init().await?;
        let removed = store.cleanup().await?;
        if removed > 0 {
            info!("Removed {} stale temp files", removed);
        }
        info!(
            "Cache {}: {} files, {} bytes",
            store.root().display(),
            store.entry_count(),
            store.size().await
        );

        let metadata = Arc::new(MetadataCache::new(current.metadata_capacity));
        let upstream = Arc::new(UpstreamClient::new());
        let titles: Arc<dyn TitleResolver> = Arc::new(ThumbInfoTitleResolver::new(
            config.clone(),
            Arc::clone(&upstream),
            Arc::clone(&metadata),
        ));

        Ok(NicoCacheProxy {
            config,
            store,
            metadata,
            upstream,
            titles,
            metrics: Arc::new(ProxyMetrics::new()),
        })
    }

    /// Replace the title resolver used for new downloads
    pub fn set_title_resolver(&mut self, titles: Arc<dyn TitleResolver>) {
        self.titles = titles;
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn metadata(&self) -> &Arc<MetadataCache> {
        &self.metadata
    }

    pub fn metrics(&self) -> &Arc<ProxyMetrics> {
        &self.metrics
    }

    /// Route table in priority order
    pub fn router(&self) -> Router {
        let mut router = Router::new();
        router.register(Arc::new(CachingProcessor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.metadata),
            Arc::clone(&self.titles),
            Arc::clone(&self.upstream),
            Arc::clone(&self.metrics),
        )));
        router.register(Arc::new(RecordingUrlProcessor::new(
            Arc::clone(&self.metadata),
            Arc::clone(&self.upstream),
        )));
        router.register(Arc::new(RecordingWatchProcessor::new(
            Arc::clone(&self.metadata),
            Arc::clone(&self.upstream),
        )));
        router.register(Arc::new(GetPostProcessor::new(Arc::clone(&self.upstream))));
        router.register(Arc::new(ConnectProcessor::new()));
        router
    }

    /// Bind the listening socket
    pub async fn bind(&self) -> Result<Server> {
        let context = Arc::new(ConnectionContext {
            config: self.config.clone(),
            router: self.router(),
            metrics: Arc::clone(&self.metrics),
        });
        Server::bind(context).await
    }
}
