use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use url::Url;

use super::http::HttpPlugin;
use super::request::{Request, RequestContext, RequestType, Response};
use crate::error::StreamingError;

/// Fetches resources for one or more URI schemes.
///
/// Implementations report headers and body chunks through `context` so the
/// networking engine can track progress and enforce timeouts.
#[async_trait]
pub trait SchemePlugin: Send + Sync {
    async fn fetch(
        &self,
        uri: &Url,
        request: &Request,
        request_type: RequestType,
        context: &RequestContext,
    ) -> Result<Response, StreamingError>;
}

/// Scheme name to plugin mapping owned by one networking engine.
#[derive(Default)]
pub struct SchemeRegistry {
    plugins: RwLock<HashMap<String, Arc<dyn SchemePlugin>>>,
}

impl SchemeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the reqwest plugin serving `http` and `https`.
    pub fn with_http() -> Result<Self, StreamingError> {
        let registry = Self::new();
        let http: Arc<dyn SchemePlugin> = Arc::new(HttpPlugin::new()?);
        registry.register("http", Arc::clone(&http));
        registry.register("https", http);
        Ok(registry)
    }

    pub fn register(&self, scheme: &str, plugin: Arc<dyn SchemePlugin>) {
        self.plugins.write().insert(scheme.to_ascii_lowercase(), plugin);
    }

    pub fn unregister(&self, scheme: &str) -> bool {
        self.plugins.write().remove(&scheme.to_ascii_lowercase()).is_some()
    }

    pub fn get(&self, scheme: &str) -> Option<Arc<dyn SchemePlugin>> {
        self.plugins.read().get(&scheme.to_ascii_lowercase()).cloned()
    }

    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.plugins.read().keys().cloned().collect();
        schemes.sort();
        schemes
    }
}
