//! CONNECT tunnels

use super::{ClientStream, Resource, StopHandle, TransferCore, BUFFER_SIZE};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::http::{RequestHeader, ResponseHeader};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Raw byte relay between the browser and `host:port`
///
/// The client connection is consumed by the tunnel, so `transfer_to` always
/// reports it as not reusable. Listeners are never notified.
pub struct TunnelResource {
    core: TransferCore,
    host: String,
    port: u16,
}

impl TunnelResource {
    /// Parse a CONNECT target of the form `host:port`
    pub fn new(hostport: &str) -> Result<Self> {
        let (host, port) = hostport
            .rsplit_once(':')
            .filter(|(host, _)| !host.is_empty() && !host.contains(':'))
            .ok_or_else(|| ProxyError::InvalidHostport(hostport.to_string()))?;
        let port = port
            .parse::<u16>()
            .ok()
            .filter(|_| port.bytes().all(|b| b.is_ascii_digit()))
            .ok_or_else(|| ProxyError::InvalidHostport(hostport.to_string()))?;

        Ok(TunnelResource {
            core: TransferCore::new(),
            host: host.to_string(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Open the upstream side of a tunnel to `host:port`
///
/// With `proxy_ssl` set and a secondary proxy configured, the tunnel is
/// nested in a CONNECT through that proxy.
async fn connect_upstream(
    host: &str,
    port: u16,
    config: &ProxyConfig,
) -> Result<BufReader<TcpStream>> {
    match config.secondary_proxy().filter(|_| config.proxy_ssl) {
        Some((proxy_host, proxy_port)) => {
            let stream = TcpStream::connect((proxy_host, proxy_port)).await?;
            let mut upstream = BufReader::new(stream);
            let target = format!("{}:{}", host, port);

            let mut connect = RequestHeader::new("CONNECT", &target, "HTTP/1.1");
            connect.headers_mut().set("Host", target.as_str());
            connect.headers_mut().set("Connection", "close");
            upstream.write_all(&connect.to_bytes()).await?;
            upstream.flush().await?;

            let response = ResponseHeader::read_from(&mut upstream).await?;
            if response.status() != 200 {
                return Err(ProxyError::ProxyHandshake(response.start_line()));
            }
            Ok(upstream)
        }
        None => Ok(BufReader::new(TcpStream::connect((host, port)).await?)),
    }
}

#[async_trait]
impl Resource for TunnelResource {
    fn core(&mut self) -> &mut TransferCore {
        &mut self.core
    }

    fn stop_handle(&self) -> StopHandle {
        self.core.stop_handle()
    }

    async fn serve(
        &mut self,
        client: &mut ClientStream,
        _request: &RequestHeader,
        config: &ProxyConfig,
    ) -> Result<bool> {
        let guard = self.core.stop_handle().open_source()?;

        let mut upstream = tokio::select! {
            connected = connect_upstream(&self.host, self.port, config) => connected?,
            _ = guard.token().cancelled() => return Err(ProxyError::Stopped),
        };

        let mut response = ResponseHeader::new(200, "Connection established");
        self.core
            .send_header(client, &mut response, |fields| {
                fields.set("Connection", "close");
            })
            .await?;

        relay(client, &mut upstream, guard.token()).await?;
        Ok(false)
    }
}

/// Copy bytes both ways until both sides have closed
///
/// EOF or a read error on one side half-closes the other side's write
/// direction. Buffered bytes already read from either side are relayed
/// first, since both are read through their buffers.
pub async fn relay<A, B>(a: &mut A, b: &mut B, cancel: &CancellationToken) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin + Send,
    B: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let mut a_buf = vec![0u8; BUFFER_SIZE];
    let mut b_buf = vec![0u8; BUFFER_SIZE];
    let mut a_open = true;
    let mut b_open = true;

    while a_open || b_open {
        tokio::select! {
            read = a_read.read(&mut a_buf), if a_open => {
                match read {
                    Ok(n) if n > 0 => b_write.write_all(&a_buf[..n]).await?,
                    other => {
                        if let Err(e) = other {
                            debug!("tunnel read ended: {}", e);
                        }
                        a_open = false;
                        let _ = b_write.shutdown().await;
                    }
                }
            }
            read = b_read.read(&mut b_buf), if b_open => {
                match read {
                    Ok(n) if n > 0 => a_write.write_all(&b_buf[..n]).await?,
                    other => {
                        if let Err(e) = other {
                            debug!("tunnel read ended: {}", e);
                        }
                        b_open = false;
                        let _ = a_write.shutdown().await;
                    }
                }
            }
            _ = cancel.cancelled() => return Err(ProxyError::Stopped),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hostport() {
        let tunnel = TunnelResource::new("www.example.com:443").unwrap();
        assert_eq!(tunnel.host(), "www.example.com");
        assert_eq!(tunnel.port(), 443);
    }

    #[test]
    fn test_invalid_hostport() {
        for target in ["www.example.com", ":443", "host:", "host:port", "a:b:443", "host:+443"] {
            assert!(
                matches!(TunnelResource::new(target), Err(ProxyError::InvalidHostport(_))),
                "accepted {}",
                target
            );
        }
    }

    #[tokio::test]
    async fn test_relay_half_close() {
        let (mut a_outer, mut a_inner) = tokio::io::duplex(1024);
        let (mut b_outer, mut b_inner) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();

        let relay_task = tokio::spawn(async move {
            relay(&mut a_inner, &mut b_inner, &cancel).await
        });

        a_outer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b_outer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        b_outer.write_all(b"pong").await.unwrap();
        a_outer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // closing one side propagates as EOF to the other
        a_outer.shutdown().await.unwrap();
        let mut rest = Vec::new();
        b_outer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        drop(b_outer);
        relay_task.await.unwrap().unwrap();
    }

    struct Quiet;

    impl crate::resource::TransferListener for Quiet {}

    #[tokio::test]
    async fn test_tunnel_runs_on_spawned_task() {
        let origin = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = origin.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = origin.accept().await {
                let (mut read, mut write) = socket.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            }
        });

        let (proxy_side, mut browser) = tokio::io::duplex(1024);
        let target = format!("127.0.0.1:{}", port);
        let mut tunnel = TunnelResource::new(&target).unwrap();
        tunnel.add_transfer_listener(Box::new(Quiet));
        let request = RequestHeader::new("CONNECT", &target, "HTTP/1.1");

        // serving from a spawned task needs the whole resource to be Send
        let task = tokio::spawn(async move {
            let mut client = crate::resource::client_stream(proxy_side);
            tunnel
                .transfer_to(&mut client, &request, &ProxyConfig::default())
                .await
        });

        let mut head = vec![0u8; b"HTTP/1.1 200 Connection established\r\n".len()];
        browser.read_exact(&mut head).await.unwrap();
        assert_eq!(head, b"HTTP/1.1 200 Connection established\r\n");
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        while !line.ends_with(b"\r\n\r\n") {
            browser.read_exact(&mut byte).await.unwrap();
            line.push(byte[0]);
        }

        browser.write_all(b"echo").await.unwrap();
        let mut buf = [0u8; 4];
        browser.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"echo");

        browser.shutdown().await.unwrap();
        let mut rest = Vec::new();
        browser.read_to_end(&mut rest).await.unwrap();
        assert!(!task.await.unwrap().unwrap());
    }
}
