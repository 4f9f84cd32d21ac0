//! Per-connection request loop
//!
//! A [`Connection`] reads requests from one browser socket, routes each to a
//! processor and relays the resulting resource, for as long as the
//! connection stays reusable. It reports its id on a channel when it ends.

use crate::config::SharedConfig;
use crate::error::{ProxyError, Result};
use crate::http::RequestHeader;
use crate::metrics::ProxyMetrics;
use crate::resource::{client_stream, ClientIo, ClientStream, Resource, StaticResource, StopHandle};
use crate::router::Router;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long unread browser input is drained before closing
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// What every connection worker needs
pub struct ConnectionContext {
    pub config: SharedConfig,
    pub router: Router,
    pub metrics: Arc<ProxyMetrics>,
}

type Processing = Arc<Mutex<Option<StopHandle>>>;

fn lock(processing: &Processing) -> MutexGuard<'_, Option<StopHandle>> {
    processing.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Stops a running [`Connection`] from another task
#[derive(Clone)]
pub struct WorkerHandle {
    id: u64,
    stop: CancellationToken,
    processing: Processing,
}

impl WorkerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Interrupt the worker, including a transfer in flight
    pub fn stop(&self) {
        self.stop.cancel();
        if let Some(resource) = lock(&self.processing).as_ref() {
            resource.stop();
        }
    }
}

/// One browser connection
pub struct Connection {
    id: u64,
    client: ClientStream,
    context: Arc<ConnectionContext>,
    stop: CancellationToken,
    processing: Processing,
    uri: Option<String>,
}

impl Connection {
    pub fn new<T: ClientIo + 'static>(
        id: u64,
        io: T,
        context: Arc<ConnectionContext>,
    ) -> (Self, WorkerHandle) {
        let stop = CancellationToken::new();
        let processing: Processing = Arc::new(Mutex::new(None));
        let handle = WorkerHandle {
            id,
            stop: stop.clone(),
            processing: Arc::clone(&processing),
        };
        let connection = Connection {
            id,
            client: client_stream(io),
            context,
            stop,
            processing,
            uri: None,
        };
        (connection, handle)
    }

    /// Serve requests until the connection ends, then report `id` on `done`
    pub async fn run(mut self, done: mpsc::UnboundedSender<u64>) {
        loop {
            match self.process_one().await {
                Ok(true) => self.uri = None,
                Ok(false) => break,
                Err(e) => {
                    self.log_failure(&e);
                    break;
                }
            }
        }
        debug!("connection {} loop end", self.id);

        self.drain().await;
        let _ = done.send(self.id);
    }

    fn log_failure(&self, error: &ProxyError) {
        let uri = self.uri.as_deref().unwrap_or("-");
        if error.is_transport_error() {
            debug!("connection {}: {}: {}", self.id, uri, error);
        } else {
            warn!("failed to process: {}: {}", uri, error);
        }
    }

    async fn read_request(&mut self) -> Result<Option<RequestHeader>> {
        // a clean close between requests is not an error
        if self.client.fill_buf().await?.is_empty() {
            return Ok(None);
        }
        Ok(Some(RequestHeader::read_from(&mut self.client).await?))
    }

    /// Handle one request
    ///
    /// # Returns
    /// * `Ok(true)` if the connection can carry another request
    async fn process_one(&mut self) -> Result<bool> {
        let limit = self.context.config.current().read_timeout();
        let stop = self.stop.clone();
        let read = async {
            match limit {
                Some(limit) => match tokio::time::timeout(limit, self.read_request()).await {
                    Ok(request) => request,
                    Err(_) => Err(ProxyError::Timeout),
                },
                None => self.read_request().await,
            }
        };
        let request = tokio::select! {
            request = read => request?,
            _ = stop.cancelled() => return Err(ProxyError::Stopped),
        };
        let Some(mut request) = request else {
            return Ok(false);
        };
        self.uri = Some(request.uri().to_string());
        debug!("{} {}", request.method(), request.uri());

        self.context.config.reload();
        let config = self.context.config.current();
        self.context.metrics.record_request();

        let processor = self.context.router.find(&request)?;
        let mut resource = match processor.on_request(&mut request, &config).await {
            Ok(resource) => resource,
            Err(e) if e.is_transport_error() => return Err(e),
            Err(e) => {
                warn!("failed to process: {}: {}", request.uri(), e);
                request.headers_mut().set("Connection", "close");
                let mut page = StaticResource::error_page(&e);
                page.transfer_to(&mut self.client, &request, &config).await?;
                return Ok(false);
            }
        };

        *lock(&self.processing) = Some(resource.stop_handle());
        if self.stop.is_cancelled() {
            resource.core().fire_transfer_end(false).await;
            lock(&self.processing).take();
            return Err(ProxyError::Stopped);
        }

        request.strip_hop_by_hop();
        let result = resource
            .transfer_to(&mut self.client, &request, &config)
            .await;
        lock(&self.processing).take();
        result
    }

    /// Half-close and swallow whatever the browser still sends
    ///
    /// Some browsers send a stray CRLF after a POST body and report an error
    /// if the socket is closed before they finished writing.
    async fn drain(&mut self) {
        let client = &mut self.client;
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            client.get_mut().shutdown().await?;
            let mut sink = [0u8; 1024];
            while client.read(&mut sink).await? > 0 {}
            Ok::<(), std::io::Error>(())
        })
        .await;
        match drained {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("{} (consuming)", e),
            Err(_) => debug!("connection {} drain timed out", self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::processor::Processor;
    use async_trait::async_trait;

    struct Hello;

    #[async_trait]
    impl Processor for Hello {
        fn supported_methods(&self) -> &[&'static str] {
            &["GET"]
        }

        async fn on_request(
            &self,
            _request: &mut RequestHeader,
            _config: &ProxyConfig,
        ) -> Result<Box<dyn Resource>> {
            Ok(Box::new(StaticResource::new("hello")))
        }
    }

    struct Broken;

    #[async_trait]
    impl Processor for Broken {
        fn supported_methods(&self) -> &[&'static str] {
            &["PUT"]
        }

        async fn on_request(
            &self,
            _request: &mut RequestHeader,
            _config: &ProxyConfig,
        ) -> Result<Box<dyn Resource>> {
            Err(ProxyError::CacheError("disk full".to_string()))
        }
    }

    fn context() -> Arc<ConnectionContext> {
        let mut router = Router::new();
        router.register(Arc::new(Hello));
        router.register(Arc::new(Broken));
        Arc::new(ConnectionContext {
            config: SharedConfig::fixed(ProxyConfig::default()),
            router,
            metrics: Arc::new(ProxyMetrics::new()),
        })
    }

    #[tokio::test]
    async fn test_keep_alive_serves_two_requests() {
        let (proxy_side, mut browser) = tokio::io::duplex(64 * 1024);
        let (connection, _handle) = Connection::new(1, proxy_side, context());
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        tokio::spawn(connection.run(done_tx));

        browser
            .write_all(b"GET http://a/ HTTP/1.1\r\n\r\nGET http://a/ HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut received = Vec::new();
        browser.read_to_end(&mut received).await.unwrap();
        let text = String::from_utf8_lossy(&received);
        assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 2);
        assert!(text.ends_with("hello"));

        drop(browser);
        assert_eq!(done_rx.recv().await, Some(1));
    }

    #[tokio::test]
    async fn test_no_route_closes_connection() {
        let context = context();
        let (proxy_side, mut browser) = tokio::io::duplex(64 * 1024);
        let (connection, _handle) = Connection::new(7, proxy_side, context.clone());
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        tokio::spawn(connection.run(done_tx));

        browser
            .write_all(b"DELETE http://a/ HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let mut received = Vec::new();
        browser.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());

        drop(browser);
        assert_eq!(done_rx.recv().await, Some(7));
        assert_eq!(context.metrics.get_stats().total_requests, 1);
    }

    #[tokio::test]
    async fn test_processing_failure_sends_error_page() {
        let (proxy_side, mut browser) = tokio::io::duplex(64 * 1024);
        let (connection, _handle) = Connection::new(5, proxy_side, context());
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        tokio::spawn(connection.run(done_tx));

        browser
            .write_all(b"PUT http://a/ HTTP/1.1\r\n\r\nGET http://a/ HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let mut received = Vec::new();
        browser.read_to_end(&mut received).await.unwrap();
        let text = String::from_utf8_lossy(&received);
        assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.contains("disk full"));
        assert!(!text.contains("hello"));

        drop(browser);
        assert_eq!(done_rx.recv().await, Some(5));
    }

    #[tokio::test]
    async fn test_stopped_connection_still_drains() {
        let (proxy_side, mut browser) = tokio::io::duplex(1024);
        let (connection, handle) = Connection::new(4, proxy_side, context());
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        tokio::spawn(connection.run(done_tx));

        handle.stop();
        // the proxy half-closes first, then waits for the browser to finish
        let mut received = Vec::new();
        browser.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(done_rx.try_recv().is_err());

        browser.write_all(b"\r\n").await.unwrap();
        drop(browser);
        assert_eq!(done_rx.recv().await, Some(4));
    }

    #[tokio::test]
    async fn test_stop_interrupts_idle_read() {
        let (proxy_side, _browser) = tokio::io::duplex(1024);
        let (connection, handle) = Connection::new(3, proxy_side, context());
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        tokio::spawn(connection.run(done_tx));

        handle.stop();
        assert_eq!(done_rx.recv().await, Some(3));
    }
}
