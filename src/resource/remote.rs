//! Responses fetched from an upstream server

use super::{
    with_read_timeout, Body, ClientStream, Resource, StopHandle, TransferCore, BUFFER_SIZE,
};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::http::{decode_latin1, encode_latin1, RequestHeader, ResponseHeader};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Fields the client derives itself
const CLIENT_MANAGED: &[&str] = &["Content-Length", "Host"];

/// Relays the request to `url` and streams the answer back
pub struct RemoteResource {
    core: TransferCore,
    client: reqwest::Client,
    url: String,
}

impl RemoteResource {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        RemoteResource {
            core: TransferCore::new(),
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Turn a request-line URI into a `reqwest::Url`, keeping raw bytes
///
/// Bytes above 0x7f are percent-encoded as-is rather than re-encoded as
/// UTF-8, so the origin sees exactly what the browser sent.
pub fn request_url(uri: &str) -> Result<reqwest::Url> {
    let mut escaped = String::with_capacity(uri.len());
    for byte in encode_latin1(uri) {
        if byte.is_ascii() && !byte.is_ascii_control() && byte != b' ' {
            escaped.push(byte as char);
        } else {
            escaped.push_str(&format!("%{:02X}", byte));
        }
    }
    reqwest::Url::parse(&escaped)
        .map_err(|e| ProxyError::HttpError(format!("invalid url {}: {}", uri, e)))
}

/// `content-type` -> `Content-Type`
pub fn title_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        upper = c == '-';
    }
    out
}

fn version_str(version: reqwest::Version) -> &'static str {
    match version {
        reqwest::Version::HTTP_09 => "HTTP/0.9",
        reqwest::Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}

/// Whether a response to `method` with `status` can carry a body
fn has_body(method: &str, status: u16) -> bool {
    !(method == "HEAD" || (100..200).contains(&status) || status == 204 || status == 304)
}

/// Copy `length` request body bytes from the browser into `pipe`
async fn upload_body<R, W>(
    client: &mut R,
    pipe: &mut W,
    length: u64,
    limit: Option<Duration>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut body = client.take(length);
    let copied = with_read_timeout(limit, tokio::io::copy(&mut body, pipe)).await?;
    if copied != length {
        return Err(ProxyError::IoError(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("request body ended after {} of {} bytes", copied, length),
        )));
    }
    pipe.shutdown().await?;
    Ok(())
}

#[async_trait]
impl Resource for RemoteResource {
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
        config: &ProxyConfig,
    ) -> Result<bool> {
        let client_keep_alive = request.client_can_keep_alive();
        let guard = self.core.stop_handle().open_source()?;

        let method = reqwest::Method::from_bytes(request.method().as_bytes())
            .map_err(|e| ProxyError::HttpError(format!("invalid method: {}", e)))?;
        let mut headers = HeaderMap::new();
        for (name, value) in request.headers().iter() {
            if CLIENT_MANAGED.iter().any(|m| m.eq_ignore_ascii_case(name)) {
                continue;
            }
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(&encode_latin1(value)),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => debug!("dropping unsendable request field {}", name),
            }
        }

        let mut builder = self
            .client
            .request(method, request_url(&self.url)?)
            .headers(headers);

        let upload_length = request.headers().content_length().filter(|&l| l > 0);
        let response = match upload_length {
            Some(length) => {
                // the body is piped through a bounded buffer, never held whole
                let (mut pipe, outgoing) = tokio::io::duplex(BUFFER_SIZE);
                builder = builder
                    .header(CONTENT_LENGTH, length)
                    .body(reqwest::Body::wrap_stream(ReaderStream::new(outgoing)));
                let send = async { builder.send().await.map_err(ProxyError::from) };
                let upload = upload_body(client, &mut pipe, length, config.read_timeout());
                tokio::select! {
                    sent = async { tokio::try_join!(send, upload) } => sent?.0,
                    _ = guard.token().cancelled() => return Err(ProxyError::Stopped),
                }
            }
            None => tokio::select! {
                sent = builder.send() => sent?,
                _ = guard.token().cancelled() => return Err(ProxyError::Stopped),
            },
        };

        let status = response.status();
        let mut header = ResponseHeader::new(
            status.as_u16(),
            status.canonical_reason().unwrap_or_default(),
        );
        header.set_version(version_str(response.version()));
        for (name, value) in response.headers() {
            header
                .headers_mut()
                .add(&title_case(name.as_str()), decode_latin1(value.as_bytes()));
        }
        header.headers_mut().remove_hop_by_hop();

        // the length the upstream body is checked against; listeners may
        // rewrite the announced one
        let body_length = if has_body(request.method(), status.as_u16()) {
            header.headers().content_length()
        } else {
            Some(0)
        };
        let keep_alive = client_keep_alive && body_length.is_some();

        self.core
            .send_header(client, &mut header, |fields| {
                fields.set("Connection", if keep_alive { "keep-alive" } else { "close" });
            })
            .await?;

        let mut body = if body_length == Some(0) {
            Body::Empty
        } else {
            Body::remote(response)
        };
        self.core
            .send_body(client, &mut body, body_length, guard.token())
            .await?;

        Ok(keep_alive)
    }
}
