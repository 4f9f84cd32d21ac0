//! Responses generated in memory

use super::{set_framing, Body, ClientStream, Resource, StopHandle, TransferCore};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::http::{RequestHeader, ResponseHeader};
use async_trait::async_trait;
use bytes::Bytes;

/// A fixed status line and payload
pub struct StaticResource {
    core: TransferCore,
    response: ResponseHeader,
    content: Bytes,
}

impl StaticResource {
    /// A `200 OK` carrying `content`
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self::with_status(200, "OK", content)
    }

    pub fn with_status(status: u16, reason: &str, content: impl Into<Bytes>) -> Self {
        StaticResource {
            core: TransferCore::new(),
            response: ResponseHeader::new(status, reason),
            content: content.into(),
        }
    }

    /// `302 Found` pointing at `location`
    pub fn redirect(location: &str) -> Self {
        let mut resource = Self::with_status(302, "Found", Bytes::new());
        resource.response.headers_mut().set("Location", location);
        resource
    }

    pub fn not_found() -> Self {
        Self::with_status(404, "Not Found", Bytes::new())
    }

    pub fn not_modified() -> Self {
        Self::with_status(304, "Not Modified", Bytes::new())
    }

    /// `500` page describing `error`
    pub fn internal_error(error: &dyn std::error::Error) -> Self {
        let mut page = String::from("<html><body><h1>Proxy error</h1><pre>");
        let mut cause: Option<&dyn std::error::Error> = Some(error);
        while let Some(e) = cause {
            page.push_str(&escape_html(&e.to_string()));
            page.push('\n');
            cause = e.source();
        }
        page.push_str("</pre></body></html>\n");

        let mut resource = Self::with_status(500, "Internal Server Error", page);
        resource
            .response
            .headers_mut()
            .set("Content-Type", "text/html; charset=utf-8");
        resource
    }

    /// Error page for a request that could not be processed, with the
    /// status [`ProxyError::to_http_status`] picks
    pub fn error_page(error: &ProxyError) -> Self {
        let mut resource = Self::internal_error(error);
        let status = error.to_http_status();
        resource.response.set_status(status, reason_phrase(status));
        resource
    }

    /// Replay an already received head and body
    pub fn raw(response: ResponseHeader, content: impl Into<Bytes>) -> Self {
        StaticResource {
            core: TransferCore::new(),
            response,
            content: content.into(),
        }
    }

    /// Ask the browser not to cache this response
    pub fn add_no_cache_headers(&mut self) {
        self.set_response_header("Expires", "Thu, 01 Dec 1994 16:00:00 GMT");
        self.set_response_header("Cache-Control", "no-store");
        self.set_response_header("Pragma", "no-cache");
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        405 => "Method Not Allowed",
        431 => "Request Header Fields Too Large",
        502 => "Bad Gateway",
        504 => "Gateway Timeout",
        _ => "Internal Server Error",
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[async_trait]
impl Resource for StaticResource {
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
        let length = self.content.len() as u64;
        let guard = self.core.stop_handle().open_source()?;

        let mut response = self.response.clone();
        self.core
            .send_header(client, &mut response, |fields| {
                set_framing(fields, length, keep_alive)
            })
            .await?;

        let (mut body, length) = if request.method() == "HEAD" {
            (Body::Empty, 0)
        } else {
            let content = self.content.clone();
            (Body::Reader(Box::new(std::io::Cursor::new(content))), length)
        };
        self.core
            .send_body(client, &mut body, Some(length), guard.token())
            .await?;

        Ok(keep_alive)
    }
}
