//! Outbound HTTP client
//!
//! One `reqwest::Client` is shared by every connection and rebuilt only when
//! the secondary proxy settings change on reload.

use crate::config::ProxyConfig;
use crate::error::Result;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::info;

type ProxyKey = Option<(String, u16)>;

/// Lazily built client keyed by the secondary proxy in effect
#[derive(Default)]
pub struct UpstreamClient {
    current: Mutex<Option<(ProxyKey, reqwest::Client)>>,
}

impl UpstreamClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client matching the proxy settings of `config`
    pub fn client(&self, config: &ProxyConfig) -> Result<reqwest::Client> {
        let key: ProxyKey = config
            .secondary_proxy()
            .map(|(host, port)| (host.to_string(), port));

        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((built_for, client)) = current.as_ref() {
            if *built_for == key {
                return Ok(client.clone());
            }
        }

        let client = build_client(&key)?;
        match &key {
            Some((host, port)) => info!("Upstream requests go through {}:{}", host, port),
            None => info!("Upstream requests go direct"),
        }
        *current = Some((key, client.clone()));
        Ok(client)
    }
}

fn build_client(proxy: &ProxyKey) -> Result<reqwest::Client> {
    let builder = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .http1_title_case_headers()
        .connect_timeout(Duration::from_secs(30))
        .pool_idle_timeout(Duration::from_secs(60));

    let builder = match proxy {
        Some((host, port)) => {
            builder.proxy(reqwest::Proxy::http(format!("http://{}:{}", host, port))?)
        }
        None => builder.no_proxy(),
    };
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_is_reused_until_proxy_changes() {
        let upstream = UpstreamClient::new();
        let mut config = ProxyConfig::default();
        upstream.client(&config).unwrap();
        upstream.client(&config).unwrap();

        config.proxy_host = Some("127.0.0.1".to_string());
        upstream.client(&config).unwrap();

        let current = upstream.current.lock().unwrap();
        let (key, _) = current.as_ref().unwrap();
        assert_eq!(key, &Some(("127.0.0.1".to_string(), 8081)));
    }
}
