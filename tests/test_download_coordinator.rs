//! Cache miss, resume and duplicate downloads end to end against a mock
//! video server

use async_trait::async_trait;
use nicocache::cache::CacheStore;
use nicocache::config::ProxyConfig;
use nicocache::http::RequestHeader;
use nicocache::metrics::ProxyMetrics;
use nicocache::nico::{CachingProcessor, MetadataCache, MovieRequest, TitleResolver};
use nicocache::resource::{client_stream, Resource};
use nicocache::upstream::UpstreamClient;
use nicocache::ProxyError;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use wiremock::matchers::{header, header_exists, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MOVIE_URL: &str = "http://smile-clb51.nicovideo.jp/smile?v=9.1234";

struct FixedTitle(Option<&'static str>);

#[async_trait]
impl TitleResolver for FixedTitle {
    async fn resolve(&self, _kind: &str, _id: &str) -> Option<String> {
        self.0.map(str::to_string)
    }
}

struct Fixture {
    dir: TempDir,
    store: Arc<CacheStore>,
    metrics: Arc<ProxyMetrics>,
    processor: CachingProcessor,
}

impl Fixture {
    async fn new(title: Option<&'static str>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self::in_dir(dir, title).await
    }

    async fn in_dir(dir: TempDir, title: Option<&'static str>) -> Self {
        let store = Arc::new(CacheStore::new(dir.path()));
        store.init().await.unwrap();
        let metrics = Arc::new(ProxyMetrics::new());
        let processor = CachingProcessor::new(
            Arc::clone(&store),
            Arc::new(MetadataCache::new(100)),
            Arc::new(FixedTitle(title)),
            Arc::new(UpstreamClient::new()),
            Arc::clone(&metrics),
        );
        Fixture {
            dir,
            store,
            metrics,
            processor,
        }
    }

    fn path(&self, name: &str) -> std::path::PathBuf {
        self.dir.path().join(name)
    }

    /// Build the resource for one browser request
    async fn resource(
        &self,
        server: &MockServer,
        config: &ProxyConfig,
    ) -> (Box<dyn Resource>, RequestHeader) {
        let movie = MovieRequest::parse(MOVIE_URL).unwrap();
        let url = format!("{}/smile?v=9.1234", server.uri());
        let mut request = RequestHeader::new("GET", &url, "HTTP/1.1");
        let resource = self
            .processor
            .resource_for(&movie, &mut request, config)
            .await
            .unwrap();
        (resource, request)
    }

    /// Run one browser request through the processor
    async fn fetch(
        &self,
        server: &MockServer,
        config: &ProxyConfig,
        extra: &[(&str, &str)],
    ) -> (Vec<u8>, Vec<u8>) {
        let movie = MovieRequest::parse(MOVIE_URL).unwrap();
        let url = format!("{}/smile?v=9.1234", server.uri());
        let mut request = RequestHeader::new("GET", &url, "HTTP/1.1");
        for (name, value) in extra {
            request.headers_mut().set(name, *value);
        }

        let mut resource = self
            .processor
            .resource_for(&movie, &mut request, config)
            .await
            .unwrap();
        exchange(resource.as_mut(), &request, config).await
    }
}

async fn exchange(
    resource: &mut dyn Resource,
    request: &RequestHeader,
    config: &ProxyConfig,
) -> (Vec<u8>, Vec<u8>) {
    let (proxy_side, mut browser) = tokio::io::duplex(1024 * 1024);
    let mut client = client_stream(proxy_side);
    resource.transfer_to(&mut client, request, config).await.unwrap();
    drop(client);

    let mut received = Vec::new();
    browser.read_to_end(&mut received).await.unwrap();
    let split = received
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response head")
        + 4;
    let body = received.split_off(split);
    (received, body)
}

fn video() -> Vec<u8> {
    (0..100u8).collect()
}

fn config(resume: bool, title: bool) -> ProxyConfig {
    ProxyConfig {
        resume_download: resume,
        title,
        ..ProxyConfig::default()
    }
}

fn write(path: &Path, bytes: &[u8]) {
    std::fs::write(path, bytes).unwrap();
}

#[tokio::test]
async fn test_miss_fills_cache_then_hits() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(video()))
        .expect(1)
        .mount(&server)
        .await;

    let fixture = Fixture::new(None).await;
    let config = config(false, false);

    let (head, body) = fixture.fetch(&server, &config, &[]).await;
    assert!(head.starts_with(b"HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, video());

    assert_eq!(std::fs::read(fixture.path("sm9.flv")).unwrap(), video());
    assert!(!fixture.path("nltmp_sm9.flv").exists());
    assert!(!fixture.store.is_in_progress("sm9"));
    assert!(fixture.store.known_temp("sm9").is_none());

    // the second request never reaches the origin
    let (head, body) = fixture.fetch(&server, &config, &[]).await;
    assert!(head.starts_with(b"HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, video());

    let stats = fixture.metrics.get_stats();
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.downloads_completed, 1);
    assert_eq!(stats.bytes_from_cache, 100);
}

#[tokio::test]
async fn test_title_names_the_cache_file() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(video()))
        .mount(&server)
        .await;

    let fixture = Fixture::new(Some("Opening <1>")).await;
    fixture.fetch(&server, &config(false, true), &[]).await;

    assert_eq!(
        std::fs::read(fixture.path("sm9_Opening -1-.flv")).unwrap(),
        video()
    );
    assert!(!fixture.path("nltmp_sm9.flv").exists());
}

#[tokio::test]
async fn test_error_status_discards_temp() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404).set_body_string("not here"))
        .mount(&server)
        .await;

    let fixture = Fixture::new(None).await;
    let (head, body) = fixture.fetch(&server, &config(true, false), &[]).await;
    assert!(head.starts_with(b"HTTP/1.1 404 Not Found\r\n"));
    assert_eq!(body, b"not here");

    assert!(!fixture.path("sm9.flv").exists());
    assert!(!fixture.path("nltmp_sm9.flv").exists());
    assert!(!fixture.store.is_in_progress("sm9"));
    assert_eq!(fixture.metrics.get_stats().downloads_discarded, 1);
}

#[tokio::test]
async fn test_browser_range_is_not_forwarded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header_exists("Range"))
        .respond_with(ResponseTemplate::new(416))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(video()))
        .expect(1)
        .mount(&server)
        .await;

    let fixture = Fixture::new(None).await;
    let (_, body) = fixture
        .fetch(&server, &config(false, false), &[("Range", "bytes=10-")])
        .await;
    assert_eq!(body, video());
    assert!(fixture.path("sm9.flv").exists());
}

#[tokio::test]
async fn test_resume_continues_partial_download() {
    let dir = tempfile::tempdir().unwrap();
    let content = video();
    write(&dir.path().join("nltmp_sm9.flv"), &content[..50]);

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("Range", "bytes=50-"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 50-99/100")
                .insert_header("Accept-Ranges", "bytes")
                .set_body_bytes(content[50..].to_vec()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let fixture = Fixture::in_dir(dir, None).await;
    let (head, body) = fixture.fetch(&server, &config(true, false), &[]).await;

    let head = String::from_utf8(head).unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Content-Length: 100\r\n"));
    assert!(!head.contains("Content-Range"));
    assert!(!head.contains("Accept-Ranges"));
    assert_eq!(body, content);

    assert_eq!(std::fs::read(fixture.path("sm9.flv")).unwrap(), content);
    assert!(!fixture.path("nltmp_sm9.flv").exists());
    assert!(!fixture.store.is_in_progress("sm9"));
}

#[tokio::test]
async fn test_partial_download_restarts_without_resume() {
    let dir = tempfile::tempdir().unwrap();
    write(&dir.path().join("nltmp_sm9.flv"), b"stale bytes");

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header_exists("Range"))
        .respond_with(ResponseTemplate::new(416))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(video()))
        .mount(&server)
        .await;

    let fixture = Fixture::in_dir(dir, None).await;
    let (_, body) = fixture.fetch(&server, &config(false, false), &[]).await;
    assert_eq!(body, video());
    // the stale prefix was truncated, not appended to
    assert_eq!(std::fs::read(fixture.path("sm9.flv")).unwrap(), video());
}

#[tokio::test]
async fn test_duplicate_download_leaves_cache_alone() {
    let dir = tempfile::tempdir().unwrap();
    let content = video();
    write(&dir.path().join("nltmp_sm9.flv"), &content[..50]);

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("Range", "bytes=50-"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 50-99/100")
                .set_body_bytes(content[50..].to_vec()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let fixture = Fixture::in_dir(dir, None).await;
    // another connection owns the download
    fixture.store.set_in_progress("sm9", 1000);

    let (head, body) = fixture.fetch(&server, &config(false, false), &[]).await;
    assert!(head.starts_with(b"HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, content);

    assert_eq!(
        std::fs::read(fixture.path("nltmp_sm9.flv")).unwrap(),
        &content[..50]
    );
    assert!(!fixture.path("sm9.flv").exists());
    assert!(fixture.store.is_in_progress("sm9"));

    let stats = fixture.metrics.get_stats();
    assert_eq!(stats.duplicate_downloads, 1);
    assert_eq!(stats.downloads_completed, 0);
}

#[tokio::test]
async fn test_misaligned_range_is_relayed_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let content = video();
    write(&dir.path().join("nltmp_sm9.flv"), &content[..50]);

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 20-99/100")
                .set_body_bytes(content[20..].to_vec()),
        )
        .mount(&server)
        .await;

    let fixture = Fixture::in_dir(dir, None).await;
    let (head, body) = fixture.fetch(&server, &config(true, false), &[]).await;
    assert!(head.starts_with(b"HTTP/1.1 206 Partial Content\r\n"));
    assert_eq!(body, &content[20..]);

    // the cached prefix is kept for a later attempt
    assert_eq!(
        std::fs::read(fixture.path("nltmp_sm9.flv")).unwrap(),
        &content[..50]
    );
    assert!(!fixture.path("sm9.flv").exists());
    assert!(!fixture.store.is_in_progress("sm9"));
}

#[tokio::test]
async fn test_second_connection_mid_download_leaves_first_intact() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(video())
                .set_delay(Duration::from_millis(300)),
        )
        .expect(2)
        .mount(&server)
        .await;

    let fixture = Fixture::new(None).await;
    let config = config(false, false);

    let primary = async {
        let (mut resource, request) = fixture.resource(&server, &config).await;
        exchange(resource.as_mut(), &request, &config).await
    };
    let duplicate = async {
        // arrives while the first download is still waiting on the origin
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fixture.store.is_in_progress("sm9"));
        let (mut resource, request) = fixture.resource(&server, &config).await;
        exchange(resource.as_mut(), &request, &config).await
    };
    let ((_, first), (_, second)) = tokio::join!(primary, duplicate);

    assert_eq!(first, video());
    assert_eq!(second, video());
    assert_eq!(std::fs::read(fixture.path("sm9.flv")).unwrap(), video());
    assert!(!fixture.path("nltmp_sm9.flv").exists());
    assert!(!fixture.store.is_in_progress("sm9"));

    let stats = fixture.metrics.get_stats();
    assert_eq!(stats.cache_misses, 2);
    assert_eq!(stats.duplicate_downloads, 1);
    assert_eq!(stats.downloads_completed, 1);
}

#[tokio::test]
async fn test_short_cached_prefix_fails_the_transfer() {
    let dir = tempfile::tempdir().unwrap();
    let content = video();
    write(&dir.path().join("nltmp_sm9.flv"), &content[..50]);

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("Range", "bytes=50-"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 50-99/100")
                .set_body_bytes(content[50..].to_vec()),
        )
        .mount(&server)
        .await;

    let fixture = Fixture::in_dir(dir, None).await;
    let config = config(true, false);
    let (mut resource, request) = fixture.resource(&server, &config).await;
    // the temp file loses bytes after the resume offset was taken
    write(&fixture.path("nltmp_sm9.flv"), &content[..20]);

    let (proxy_side, mut browser) = tokio::io::duplex(1024 * 1024);
    let mut client = client_stream(proxy_side);
    let result = resource.transfer_to(&mut client, &request, &config).await;
    drop(client);

    assert!(matches!(
        result,
        Err(ProxyError::InconsistentLength { expected: 50, actual: 20 })
    ));
    let mut received = Vec::new();
    browser.read_to_end(&mut received).await.unwrap();
    let text = String::from_utf8_lossy(&received);
    assert!(text.contains("Content-Length: 100\r\n"));
    // no live bytes follow the broken prefix
    assert!(received.len() < text.find("\r\n\r\n").unwrap() + 4 + 100);

    assert!(!fixture.path("sm9.flv").exists());
    assert!(!fixture.store.is_in_progress("sm9"));
}
