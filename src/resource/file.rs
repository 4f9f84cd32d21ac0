//! Responses served from a local file

use super::{set_framing, Body, ClientStream, Resource, StopHandle, TransferCore};
use crate::config::ProxyConfig;
use crate::error::Result;
use crate::http::{RequestHeader, ResponseHeader};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// A `200 OK` whose body is a file on disk
pub struct FileResource {
    core: TransferCore,
    path: PathBuf,
}

impl FileResource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileResource {
            core: TransferCore::new(),
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Content type for a cache file extension
pub fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("flv") => "video/flv",
        Some("mp4") => "video/mp4",
        Some("swf") => "application/x-shockwave-flash",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl Resource for FileResource {
    fn core(&mut self) -> &mut TransferCore {
        &mut self.core
    }

    fn stop_handle(&self) -> StopHandle {
        self.core.stop_handle()
    }

    async fn serve(
        &mut self,
        client: &mut ClientStream,
        request: &RequestHeader,
        _config: &ProxyConfig,
    ) -> Result<bool> {
        let keep_alive = request.client_can_keep_alive();
        let guard = self.core.stop_handle().open_source()?;

        let file = tokio::fs::File::open(&self.path).await?;
        let metadata = file.metadata().await?;
        let length = metadata.len();

        let mut response = ResponseHeader::new(200, "OK");
        response
            .headers_mut()
            .set("Content-Type", content_type_for(&self.path));
        if let Ok(modified) = metadata.modified() {
            response.headers_mut().set_date("Last-Modified", modified);
        }
        self.core
            .send_header(client, &mut response, |fields| {
                set_framing(fields, length, keep_alive)
            })
            .await?;

        let (mut body, length) = if request.method() == "HEAD" {
            (Body::Empty, 0)
        } else {
            (Body::Reader(Box::new(file)), length)
        };
        self.core
            .send_body(client, &mut body, Some(length), guard.token())
            .await?;

        Ok(keep_alive)
    }
}
