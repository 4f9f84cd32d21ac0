//! Response sources
//!
//! A [`Resource`] knows where a response comes from: an upstream server
//! ([`RemoteResource`]), memory ([`StaticResource`]), a cache file
//! ([`FileResource`]) or a raw socket ([`TunnelResource`]). The shared
//! [`TransferCore`] drives the header and body sequence and the listener
//! callbacks, so every variant reports progress the same way.

pub mod file;
pub mod listener;
pub mod remote;
pub mod static_resource;
pub mod tunnel;

pub use file::FileResource;
pub use listener::TransferListener;
pub use remote::RemoteResource;
pub use static_resource::StaticResource;
pub use tunnel::TunnelResource;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::http::{HeaderFields, RequestHeader, ResponseHeader};
use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

/// Relay buffer size
pub const BUFFER_SIZE: usize = 32 * 1024;

/// Anything a browser connection can be carried over
pub trait ClientIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ClientIo for T {}

/// Buffered browser connection
///
/// Reads go through the buffer so bytes following a request head are never
/// lost; writes pass straight to the socket.
pub type ClientStream = BufReader<Box<dyn ClientIo>>;

/// Wrap a socket as a [`ClientStream`]
pub fn client_stream<T: ClientIo + 'static>(io: T) -> ClientStream {
    BufReader::new(Box::new(io))
}

/// Where a response is obtained from
#[async_trait]
pub trait Resource: Send {
    fn core(&mut self) -> &mut TransferCore;

    /// Handle for stopping the transfer from another task
    fn stop_handle(&self) -> StopHandle;

    /// Send the response head and body to `client`
    ///
    /// Implementations return whether the client connection may carry
    /// another request.
    async fn serve(
        &mut self,
        client: &mut ClientStream,
        request: &RequestHeader,
        config: &ProxyConfig,
    ) -> Result<bool>;

    /// Relay this resource to the client
    ///
    /// Listeners see `on_transfer_end` exactly once, even when `serve` fails
    /// before the body starts.
    ///
    /// # Returns
    /// * `Ok(true)` if the client connection can be reused
    async fn transfer_to(
        &mut self,
        client: &mut ClientStream,
        request: &RequestHeader,
        config: &ProxyConfig,
    ) -> Result<bool> {
        let result = self.serve(client, request, config).await;
        self.core().fire_transfer_end(false).await;
        result
    }

    fn add_transfer_listener(&mut self, listener: Box<dyn TransferListener>) {
        self.core().listeners.push(listener);
    }

    /// Override a response field; applied after the source's own fields
    fn set_response_header(&mut self, name: &str, value: &str) {
        self.core().overrides.set(name, value);
    }

    fn add_response_header(&mut self, name: &str, value: &str) {
        self.core().overrides.add(name, value);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct StopState {
    stopped: AtomicBool,
    active: Mutex<Option<CancellationToken>>,
}

/// Cross-task stop switch for a resource
///
/// `stop` marks the resource stopped and cancels the source it is currently
/// reading, if any. The transferring task releases that source when it
/// finishes, so `stop` may find nothing to cancel; that is fine.
#[derive(Clone, Default)]
pub struct StopHandle {
    state: Arc<StopState>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.state.stopped.store(true, Ordering::SeqCst);
        if let Some(token) = lock(&self.state.active).take() {
            token.cancel();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.state.stopped.load(Ordering::SeqCst)
    }

    /// Register the source about to be read
    ///
    /// # Returns
    /// * `Err(ProxyError::Stopped)` if `stop` already ran
    pub fn open_source(&self) -> Result<SourceGuard> {
        let mut active = lock(&self.state.active);
        if self.is_stopped() {
            return Err(ProxyError::Stopped);
        }
        let token = CancellationToken::new();
        *active = Some(token.clone());
        Ok(SourceGuard {
            handle: self.clone(),
            token,
        })
    }
}

/// Active source registration; released on drop
pub struct SourceGuard {
    handle: StopHandle,
    token: CancellationToken,
}

impl SourceGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for SourceGuard {
    fn drop(&mut self) {
        lock(&self.handle.state.active).take();
    }
}

/// Response body source
pub enum Body {
    Empty,
    Reader(Box<dyn AsyncRead + Send + Unpin>),
    Remote {
        response: reqwest::Response,
        pending: Bytes,
    },
}

impl Body {
    pub fn remote(response: reqwest::Response) -> Self {
        Body::Remote {
            response,
            pending: Bytes::new(),
        }
    }

    /// Read into `buf`; `Ok(0)` means end of body
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Body::Empty => Ok(0),
            Body::Reader(reader) => reader.read(buf).await,
            Body::Remote { response, pending } => {
                while pending.is_empty() {
                    match response.chunk().await.map_err(io::Error::other)? {
                        Some(chunk) => *pending = chunk,
                        None => return Ok(0),
                    }
                }
                let n = pending.len().min(buf.len());
                buf[..n].copy_from_slice(&pending.split_to(n));
                Ok(n)
            }
        }
    }
}

/// State shared by every resource variant
#[derive(Default)]
pub struct TransferCore {
    overrides: HeaderFields,
    listeners: Vec<Box<dyn TransferListener>>,
    end_fired: bool,
    stop: StopHandle,
}

impl TransferCore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn has_listeners(&self) -> bool {
        !self.listeners.is_empty()
    }

    /// Finish the head and write it
    ///
    /// Overrides are applied first, then `mandatory` sets fields the
    /// variant cannot give up (framing), then listeners may rewrite it.
    pub async fn send_header<W>(
        &mut self,
        client: &mut W,
        response: &mut ResponseHeader,
        mandatory: impl FnOnce(&mut HeaderFields) + Send,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        response.headers_mut().apply_overrides(&self.overrides);
        mandatory(response.headers_mut());
        for listener in &mut self.listeners {
            listener.on_response_header(response).await;
        }
        client.write_all(&response.to_bytes()).await?;
        client.flush().await?;
        Ok(())
    }

    /// Relay `body` to the client
    ///
    /// # Arguments
    /// * `content_length` - Declared body length, `None` when close-delimited
    /// * `cancel` - Token of the active source; cancelling aborts the copy
    ///
    /// # Returns
    /// * `Err(ProxyError::InconsistentLength)` if the source ended early or
    ///   ran long; listeners see `on_transfer_end(false)` first
    /// * The first `on_transfer_begin` error, after `on_transfer_end(false)`
    pub async fn send_body<W>(
        &mut self,
        client: &mut W,
        body: &mut Body,
        content_length: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        for i in 0..self.listeners.len() {
            if let Err(e) = self.listeners[i].on_transfer_begin(&mut *client).await {
                self.fire_transfer_end(false).await;
                return Err(e);
            }
        }

        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut transferred: u64 = 0;
        loop {
            let n = tokio::select! {
                read = body.read(&mut buf) => read?,
                _ = cancel.cancelled() => return Err(ProxyError::Stopped),
            };
            if n == 0 {
                break;
            }

            for listener in &mut self.listeners {
                listener.on_transferring(&buf[..n]).await;
            }
            tokio::select! {
                written = client.write_all(&buf[..n]) => written?,
                _ = cancel.cancelled() => return Err(ProxyError::Stopped),
            }
            transferred += n as u64;
        }
        client.flush().await?;

        match content_length {
            Some(expected) if expected != transferred => {
                self.fire_transfer_end(false).await;
                Err(ProxyError::InconsistentLength {
                    expected,
                    actual: transferred,
                })
            }
            _ => {
                self.fire_transfer_end(true).await;
                Ok(())
            }
        }
    }

    /// Deliver `on_transfer_end` unless it already went out
    pub async fn fire_transfer_end(&mut self, completed: bool) {
        if self.end_fired {
            return;
        }
        self.end_fired = true;
        for listener in &mut self.listeners {
            listener.on_transfer_end(completed).await;
        }
    }
}

/// Await an IO future, bounded by the configured read timeout
pub(crate) async fn with_read_timeout<T, F>(limit: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ProxyError::Timeout),
        },
        None => Ok(fut.await?),
    }
}

/// Framing fields every generated response carries
pub(crate) fn set_framing(fields: &mut HeaderFields, length: u64, keep_alive: bool) {
    fields.set_content_length(length);
    fields.set("Connection", if keep_alive { "keep-alive" } else { "close" });
}
