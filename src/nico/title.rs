//! Video title lookup

use super::metadata::MetadataCache;
use crate::config::SharedConfig;
use crate::upstream::UpstreamClient;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, warn};

/// Thumb info API endpoint; `<type><id>` is appended
pub const THUMB_INFO_URL: &str = "http://ext.nicovideo.jp/api/getthumbinfo/";

static STATUS_OK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<nicovideo_thumb_response[^>]*\sstatus="ok""#).expect("thumb status regex")
});
static TITLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<title>(.*?)</title>").expect("thumb title regex"));

/// Resolves the title of a video
#[async_trait]
pub trait TitleResolver: Send + Sync {
    /// Title of `<kind><id>`, or `None` when it cannot be found
    async fn resolve(&self, kind: &str, id: &str) -> Option<String>;
}

/// Extract the title from a thumb info XML document
///
/// # Returns
/// * `None` unless the response status is `ok` and a title is present
pub fn thumb_title(document: &str) -> Option<String> {
    if !STATUS_OK_RE.is_match(document) {
        return None;
    }
    TITLE_RE
        .captures(document)
        .map(|caps| unescape_xml(caps[1].trim()))
}

fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Looks titles up through the thumb info API
///
/// Found titles are stored in the metadata cache as well.
pub struct ThumbInfoTitleResolver {
    config: SharedConfig,
    upstream: Arc<UpstreamClient>,
    metadata: Arc<MetadataCache>,
    base_url: String,
}

impl ThumbInfoTitleResolver {
    pub fn new(
        config: SharedConfig,
        upstream: Arc<UpstreamClient>,
        metadata: Arc<MetadataCache>,
    ) -> Self {
        Self::with_base_url(config, upstream, metadata, THUMB_INFO_URL)
    }

    /// Create a resolver querying `base_url` instead of the public API
    pub fn with_base_url(
        config: SharedConfig,
        upstream: Arc<UpstreamClient>,
        metadata: Arc<MetadataCache>,
        base_url: impl Into<String>,
    ) -> Self {
        ThumbInfoTitleResolver {
            config,
            upstream,
            metadata,
            base_url: base_url.into(),
        }
    }

    async fn fetch(&self, kind: &str, id: &str) -> crate::error::Result<Option<String>> {
        let client = self.upstream.client(&self.config.current())?;
        let url = format!("{}{}{}", self.base_url, kind, id);
        let response = client.get(&url).send().await?;
        if !response.status().is_success() {
            debug!("thumb info {} returned {}", url, response.status());
            return Ok(None);
        }
        let document = response.text().await?;
        Ok(thumb_title(&document))
    }
}

#[async_trait]
impl TitleResolver for ThumbInfoTitleResolver {
    async fn resolve(&self, kind: &str, id: &str) -> Option<String> {
        debug!("title retrieving start: {}{}", kind, id);
        let title = match self.fetch(kind, id).await {
            Ok(title) => title,
            Err(e) => {
                warn!("title retrieving failed: {}", e);
                None
            }
        };
        debug!("title retrieving end ({:?})", title);

        if let Some(title) = &title {
            self.metadata.put(kind, id, title);
        }
        title
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OK_RESPONSE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<nicovideo_thumb_response status="ok">
<thumb>
<video_id>sm9</video_id>
<title>Tom &amp; Jerry &lt;3</title>
<description>desc</description>
</thumb>
</nicovideo_thumb_response>"#;

    const FAIL_RESPONSE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<nicovideo_thumb_response status="fail">
<error>
<code>DELETED</code>
<description>deleted</description>
</error>
</nicovideo_thumb_response>"#;

    #[test]
    fn test_thumb_title() {
        assert_eq!(thumb_title(OK_RESPONSE).as_deref(), Some("Tom & Jerry <3"));
    }

    #[test]
    fn test_thumb_title_requires_ok_status() {
        assert_eq!(thumb_title(FAIL_RESPONSE), None);
        assert_eq!(thumb_title("<title>orphan</title>"), None);
    }
}
