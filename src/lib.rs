//! NicoCache
//!
//! A caching HTTP forward proxy for a video site. Browsers point their HTTP
//! proxy at it; video downloads are recorded to disk while they stream and
//! served from disk the next time. Everything else, HTTPS tunnels included,
//! is relayed unchanged.
//!
//! # Features
//!
//! - **Transparent relay**: GET/POST/HEAD pass-through and CONNECT tunnels,
//!   optionally through a secondary proxy
//! - **Record while streaming**: a cache miss is mirrored into a temp file
//!   and committed when the download completes
//! - **Resumable downloads**: interrupted downloads are kept and continued
//!   with a `Range` request, invisible to the browser
//! - **Duplicate connections**: a second connection for a video in flight
//!   reuses the downloaded prefix and never writes the cache
//! - **Readable file names**: titles are looked up and used in cache names
//! - **Hot reload**: configuration edits apply on the next request
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use nicocache::{NicoCacheProxy, SharedConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SharedConfig::load_or_create("nicocache.yaml")?;
//! let proxy = NicoCacheProxy::new(config).await?;
//! let server = proxy.bind().await?;
//!
//! let shutdown = CancellationToken::new();
//! server.run(shutdown).await?;
//!
//! let stats = proxy.metrics().get_stats();
//! println!("Cache hit rate: {:.1}%", stats.cache_hit_rate());
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`Server`]: accept loop; one [`Connection`] task per browser socket
//! - [`Router`]: picks the [`Processor`] for a request by method and URL
//! - [`Resource`]: where a response comes from (upstream, file, memory,
//!   tunnel), with [`TransferListener`] hooks on every transfer
//! - [`CacheStore`]: cache directory index, temp files and the
//!   download-in-progress flags
//! - [`nico`]: the video site processors and the cache filling listener
//!
//! # Configuration
//!
//! ```yaml
//! listen_port: 8080
//! proxy_host: null          # secondary proxy, e.g. "proxy.example.com"
//! proxy_port: 8081
//! proxy_ssl: false          # tunnel CONNECT through the secondary proxy
//! title: true               # use video titles in cache file names
//! touch_cache: true
//! resume_download: false
//! read_timeout_ms: 600000   # 0 = unlimited
//! file_name_charset: null   # e.g. "Shift_JIS"
//! cache_dir: cache
//! metadata_capacity: 10000
//! debug: false
//! ```
//!
//! See [`ProxyConfig`] for details.
//!
//! # Error Handling
//!
//! Errors are reported as [`ProxyError`]. Transport errors such as a
//! browser closing its socket are expected and logged at debug level:
//!
//! ```rust,no_run
//! use nicocache::{ProxyConfig, ProxyError};
//!
//! # fn main() {
//! match ProxyConfig::from_file("nicocache.yaml") {
//!     Ok(config) => println!("listening on {}", config.listen_port),
//!     Err(ProxyError::ConfigError(msg)) => eprintln!("Config error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod http;
pub mod metrics;
pub mod nico;
pub mod processor;
pub mod proxy;
pub mod resource;
pub mod router;
pub mod server;
pub mod upstream;

pub use cache::{CacheEntry, CacheStore};
pub use config::{ConfigChanges, ProxyConfig, SharedConfig};
pub use connection::{Connection, ConnectionContext, WorkerHandle};
pub use error::{ProxyError, Result};
pub use crate::http::{HeaderFields, HttpMessage, RequestHeader, ResponseHeader};
pub use metrics::{MetricsSnapshot, ProxyMetrics};
pub use processor::Processor;
pub use proxy::NicoCacheProxy;
pub use resource::{Resource, StopHandle, TransferListener};
pub use router::Router;
pub use server::Server;
pub use upstream::UpstreamClient;
