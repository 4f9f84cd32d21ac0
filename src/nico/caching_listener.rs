//! Mirrors a video download into the cache while it is relayed
//!
//! A [`CachingListener`] is attached to the upstream fetch of a cache miss.
//! It normalizes a resumed `206` into a `200` for the browser, replays the
//! already cached prefix, copies every relayed chunk into the temp file and,
//! at the end, commits, suspends or discards the temp file.

use crate::cache::CacheEntry;
use crate::error::{ProxyError, Result};
use crate::http::ResponseHeader;
use crate::metrics::ProxyMetrics;
use crate::resource::{TransferListener, BUFFER_SIZE};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

static CONTENT_RANGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"bytes (\d+)-(\d+)/(\d+)").expect("content range regex"));

/// Pending title lookup
pub type TitleTask = JoinHandle<Option<String>>;

/// Parsed `Content-Range: bytes start-end/total`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

impl ContentRange {
    pub fn parse(value: &str) -> Option<Self> {
        let caps = CONTENT_RANGE_RE.captures(value)?;
        Some(ContentRange {
            start: caps[1].parse().ok()?,
            end: caps[2].parse().ok()?,
            total: caps[3].parse().ok()?,
        })
    }
}

/// How a download is finished off
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wrapup {
    /// Discard the temp file
    Cleanup,
    /// Keep the temp file for a later resume
    Suspend,
    /// Commit the temp file as the cache file
    Complete,
}

/// Choose the wrap-up for a finished transfer
pub fn select_wrapup(error: bool, completed: bool, resume_enabled: bool) -> Wrapup {
    if error {
        Wrapup::Cleanup
    } else if !completed {
        if resume_enabled {
            Wrapup::Suspend
        } else {
            Wrapup::Cleanup
        }
    } else {
        Wrapup::Complete
    }
}

/// Transfer listener filling the cache for one video
///
/// A duplicate listener belongs to a second connection for a video that is
/// already being downloaded. It replays the cached prefix but never writes
/// the cache or touches the in-progress flag.
pub struct CachingListener {
    entry: CacheEntry,
    title_task: Option<TitleTask>,
    cached_prefix: Option<File>,
    resume_from: u64,
    duplicate: bool,
    resume_enabled: bool,
    metrics: Arc<ProxyMetrics>,

    out: Option<File>,
    partial: bool,
    prefix_len: u64,
    error: bool,
    keep_cache_on_error: bool,
}

impl CachingListener {
    /// # Arguments
    /// * `cached_prefix` - Temp file reader when the request was sent with a
    ///   `Range` starting at `resume_from`
    /// * `duplicate` - Whether another connection owns this download
    /// * `resume_enabled` - Whether an unfinished download is kept
    pub fn new(
        entry: CacheEntry,
        title_task: Option<TitleTask>,
        cached_prefix: Option<File>,
        resume_from: u64,
        duplicate: bool,
        resume_enabled: bool,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        CachingListener {
            entry,
            title_task,
            cached_prefix,
            resume_from,
            duplicate,
            resume_enabled,
            metrics,
            out: None,
            partial: false,
            prefix_len: 0,
            error: false,
            keep_cache_on_error: false,
        }
    }

    fn name(&self) -> String {
        self.entry.file_name()
    }

    /// Rewrite a `206` into the `200` the browser asked for
    ///
    /// # Returns
    /// * `false` if the range does not continue the cached prefix
    fn normalize_partial(&mut self, response: &mut ResponseHeader) -> bool {
        let range = response
            .headers()
            .get("Content-Range")
            .and_then(ContentRange::parse);

        let mut content_length = response.headers().content_length();
        if let Some(range) = range {
            if range.start != self.resume_from {
                warn!(
                    "{}: range starts at {} but {} bytes are cached",
                    self.name(),
                    range.start,
                    self.resume_from
                );
                return false;
            }
            if range.end + 1 == range.total {
                info!("partial download from {} byte", range.start);
            } else {
                info!("maybe bad response: bytes {}-{}/{}", range.start, range.end, range.total);
            }
            content_length = Some(range.total);
            if !self.duplicate {
                self.entry
                    .store_handle()
                    .set_in_progress(self.entry.id(), range.total);
            }
            self.prefix_len = range.start;
            self.partial = true;
        }

        response.set_status(200, "OK");
        let fields = response.headers_mut();
        fields.remove("Content-Range");
        fields.remove("Accept-Range");
        fields.remove("Accept-Ranges");
        if let Some(length) = content_length {
            fields.set_content_length(length);
        }
        true
    }

    /// Write the cached prefix ahead of the live body
    ///
    /// A prefix that cannot be replayed in full fails the transfer, since the
    /// browser was promised the total length.
    async fn replay_prefix(
        &mut self,
        client: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<()> {
        let Some(mut cached) = self.cached_prefix.take() else {
            return Ok(());
        };
        if !self.partial {
            return Ok(());
        }

        let mut rest = self.prefix_len;
        let mut buf = vec![0u8; BUFFER_SIZE];
        while rest > 0 {
            let want = rest.min(buf.len() as u64) as usize;
            let n = match cached.read(&mut buf[..want]).await {
                Ok(0) => {
                    warn!("{}: cached prefix ended {} bytes short", self.name(), rest);
                    self.error = true;
                    return Err(ProxyError::InconsistentLength {
                        expected: self.prefix_len,
                        actual: self.prefix_len - rest,
                    });
                }
                Ok(n) => n,
                Err(e) => {
                    warn!("{}: {}", self.name(), e);
                    self.error = true;
                    return Err(e.into());
                }
            };
            if let Err(e) = client.write_all(&buf[..n]).await {
                // the browser went away; the temp file is still good
                debug!("{}: {}", self.name(), e);
                self.keep_cache_on_error = true;
                self.error = true;
                return Err(e.into());
            }
            rest -= n as u64;
        }
        Ok(())
    }

    async fn title(&mut self) -> Option<String> {
        let task = self.title_task.take()?;
        match task.await {
            Ok(title) => title,
            Err(e) => {
                warn!("title retrieving failed: {}", e);
                None
            }
        }
    }

    async fn cleanup(&mut self) {
        if let Some(task) = self.title_task.take() {
            task.abort();
        }
        if !self.keep_cache_on_error {
            match self.entry.delete_temp().await {
                Ok(()) => debug!("{} deleted", self.name()),
                Err(e) => warn!("{}: {}", self.name(), e),
            }
        }
        self.metrics.record_download_discarded();
    }

    async fn suspend(&mut self) {
        if let Some(title) = self.title().await {
            self.entry.describe(&title);
            if let Err(e) = self.entry.describe_temp(&title).await {
                warn!("{}: {}", self.name(), e);
            }
        }
        info!("cache suspended: {}", self.name());
        self.metrics.record_download_suspended();
    }

    async fn complete(&mut self) {
        if let Some(title) = self.title().await {
            self.entry.describe(&title);
        }
        match self.entry.store().await {
            Ok(()) => {
                info!("cache completed: {}", self.name());
                self.metrics.record_download_completed();
            }
            Err(e) => warn!("{}", e),
        }
    }
}

#[async_trait]
impl TransferListener for CachingListener {
    async fn on_response_header(&mut self, response: &mut ResponseHeader) {
        if response.headers().content_length().unwrap_or(0) == 0 {
            self.error = true;
        }

        match response.status() {
            206 => {
                if !self.normalize_partial(response) {
                    // relay the range as is and leave the cache alone
                    self.cached_prefix = None;
                    self.error = true;
                    self.keep_cache_on_error = true;
                    return;
                }
            }
            200 => {}
            _ => self.error = true,
        }

        if self.error || self.duplicate {
            return;
        }
        match self.entry.open_temp_writer(self.partial).await {
            Ok(file) => self.out = Some(file),
            Err(e) => {
                warn!("{}: {}", self.name(), e);
                self.error = true;
            }
        }
    }

    async fn on_transfer_begin(
        &mut self,
        client: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<()> {
        self.replay_prefix(client).await
    }

    async fn on_transferring(&mut self, chunk: &[u8]) {
        if self.error {
            return;
        }
        let Some(out) = self.out.as_mut() else {
            return;
        };
        if let Err(e) = out.write_all(chunk).await {
            warn!("{}: {}", self.name(), e);
            self.error = true;
        }
    }

    async fn on_transfer_end(&mut self, completed: bool) {
        self.cached_prefix = None;
        if self.duplicate {
            if let Some(task) = self.title_task.take() {
                task.abort();
            }
            return;
        }

        self.entry.store_handle().clear_in_progress(self.entry.id());

        if let Some(mut out) = self.out.take() {
            if let Err(e) = out.flush().await {
                warn!("{}: {}", self.name(), e);
                self.error = true;
            }
        }

        match select_wrapup(self.error, completed, self.resume_enabled) {
            Wrapup::Cleanup => self.cleanup().await,
            Wrapup::Suspend => self.suspend().await,
            Wrapup::Complete => self.complete().await,
        }
    }
}

impl Drop for CachingListener {
    fn drop(&mut self) {
        if let Some(task) = self.title_task.take() {
            task.abort();
        }
    }
}
