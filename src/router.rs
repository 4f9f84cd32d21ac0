//! Maps requests to processors
//!
//! Routes are tried in registration order; the first whose method and URL
//! pattern both match wins.

use crate::error::{ProxyError, Result};
use crate::http::RequestHeader;
use crate::processor::Processor;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

struct Route {
    method: Option<String>,
    url: Option<Regex>,
    processor: Arc<dyn Processor>,
}

impl Route {
    fn matches(&self, method: &str, uri: &str) -> bool {
        let method_ok = self.method.as_deref().map_or(true, |m| m == method);
        let url_ok = self
            .url
            .as_ref()
            .map_or(true, |re| re.find(uri).is_some_and(|m| m.start() == 0));
        method_ok && url_ok
    }
}

/// Ordered route table
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route for every method `processor` supports
    pub fn register(&mut self, processor: Arc<dyn Processor>) {
        let url = processor.supported_url().cloned();
        let methods: Vec<String> = processor
            .supported_methods()
            .iter()
            .map(|m| m.to_string())
            .collect();

        if methods.is_empty() {
            self.routes.push(Route {
                method: None,
                url,
                processor,
            });
            return;
        }
        for method in methods {
            debug!("route registered: {} {:?}", method, url.as_ref().map(Regex::as_str));
            self.routes.push(Route {
                method: Some(method),
                url: url.clone(),
                processor: Arc::clone(&processor),
            });
        }
    }

    /// First processor matching `request`
    ///
    /// # Returns
    /// * `Err(ProxyError::NoRoute)` if nothing matches
    pub fn find(&self, request: &RequestHeader) -> Result<Arc<dyn Processor>> {
        self.routes
            .iter()
            .find(|route| route.matches(request.method(), request.uri()))
            .map(|route| Arc::clone(&route.processor))
            .ok_or_else(|| ProxyError::NoRoute(request.start_line()))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
