use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, trace, warn};
use url::Url;

use super::registry::SchemeRegistry;
use super::request::{PendingRequest, Request, RequestContext, RequestProgress, RequestType, Response};
use crate::backoff::Backoff;
use crate::config::RetryParameters;
use crate::error::StreamingError;
use crate::metrics::EngineMetrics;

/// Dispatches requests to scheme plugins with retry, URI rotation and
/// timeouts.
#[derive(Clone)]
pub struct NetworkingEngine {
    registry: Arc<SchemeRegistry>,
    metrics: Arc<EngineMetrics>,
}

impl NetworkingEngine {
    pub fn new(registry: Arc<SchemeRegistry>) -> Self {
        Self::with_metrics(registry, Arc::new(EngineMetrics::new()))
    }

    pub fn with_metrics(registry: Arc<SchemeRegistry>, metrics: Arc<EngineMetrics>) -> Self {
        Self { registry, metrics }
    }

    pub fn registry(&self) -> &Arc<SchemeRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    /// Start `request` in the background.
    pub fn request(&self, request_type: RequestType, request: Request) -> PendingRequest {
        let progress = Arc::new(RequestProgress::default());
        let engine = self.clone();
        let task_progress = Arc::clone(&progress);
        PendingRequest::spawn(
            async move {
                engine
                    .send_with_retries(request_type, &request, task_progress)
                    .await
            },
            progress,
        )
    }

    async fn send_with_retries(
        &self,
        request_type: RequestType,
        request: &Request,
        progress: Arc<RequestProgress>,
    ) -> Result<Response, StreamingError> {
        if request.uris.is_empty() {
            return Err(StreamingError::malformed_uri("", "request has no URIs"));
        }

        let mut backoff = Backoff::new(&request.retry_parameters, false);
        let mut last_error: Option<StreamingError> = None;
        let mut index = 0usize;

        loop {
            if let Err(exhausted) = backoff.attempt().await {
                return Err(last_error.unwrap_or(exhausted));
            }
            if index > 0 {
                self.metrics.record_network_retry();
            }

            let uri = &request.uris[index % request.uris.len()];
            index += 1;
            progress.restart();

            match self.send_once(uri, request_type, request, &progress).await {
                Ok(response) => {
                    trace!(uri = %uri, bytes = response.data.len(), "Request succeeded");
                    return Ok(response);
                }
                Err(error) if error.is_recoverable() => {
                    warn!(
                        uri = %uri,
                        attempt = backoff.attempts(),
                        error = %error,
                        "Request failed, retrying"
                    );
                    last_error = Some(error);
                }
                Err(error) => {
                    debug!(uri = %uri, error = %error, "Request failed permanently");
                    return Err(error);
                }
            }
        }
    }

    async fn send_once(
        &self,
        uri: &str,
        request_type: RequestType,
        request: &Request,
        progress: &Arc<RequestProgress>,
    ) -> Result<Response, StreamingError> {
        let parsed = Url::parse(uri).map_err(|e| StreamingError::malformed_uri(uri, e.to_string()))?;
        let plugin = self
            .registry
            .get(parsed.scheme())
            .ok_or_else(|| StreamingError::UnsupportedScheme {
                scheme: parsed.scheme().to_string(),
            })?;

        let context = RequestContext::new(Arc::clone(progress), request);
        tokio::select! {
            result = plugin.fetch(&parsed, request, request_type, &context) => result,
            _ = watchdog(progress, &request.retry_parameters) => {
                warn!(uri = %uri, "Request timed out");
                Err(StreamingError::timeout(uri))
            }
        }
    }
}

/// Resolves once the connection, stall or overall timeout has expired.
async fn watchdog(progress: &RequestProgress, params: &RetryParameters) {
    let started = Instant::now();
    let mut headers = progress.subscribe_headers();

    loop {
        let phase_deadline = if *headers.borrow_and_update() {
            params.stall_timeout().map(|t| progress.last_activity() + t)
        } else {
            params.connection_timeout().map(|t| started + t)
        };
        let overall_deadline = params.timeout().map(|t| started + t);
        let deadline = match (phase_deadline, overall_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        match deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        // Body data may have pushed the stall deadline back.
                        let expired = overall_deadline.is_some_and(|d| Instant::now() >= d)
                            || if progress.has_headers() {
                                params
                                    .stall_timeout()
                                    .is_some_and(|t| Instant::now() >= progress.last_activity() + t)
                            } else {
                                params
                                    .connection_timeout()
                                    .is_some_and(|t| Instant::now() >= started + t)
                            };
                        if expired {
                            return;
                        }
                    }
                    changed = headers.changed() => {
                        if changed.is_err() {
                            return std::future::pending().await;
                        }
                    }
                }
            }
            None => {
                if headers.changed().await.is_err() {
                    return std::future::pending().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MemoryPlugin, MemoryResponse};
    use bytes::Bytes;
    use std::time::Duration;

    fn params(max_attempts: u32) -> RetryParameters {
        RetryParameters {
            max_attempts,
            base_delay_ms: 100,
            fuzz_factor: 0.0,
            ..Default::default()
        }
    }

    fn engine(plugin: Arc<MemoryPlugin>) -> NetworkingEngine {
        let registry = SchemeRegistry::new();
        registry.register("mem", plugin);
        NetworkingEngine::new(Arc::new(registry))
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotates_uris_between_attempts() {
        let plugin = Arc::new(MemoryPlugin::new());
        plugin.insert("mem://a/seg", MemoryResponse::Status(503));
        plugin.insert("mem://b/seg", MemoryResponse::data(b"payload"));
        let engine = engine(plugin.clone());

        let request = Request::new(vec!["mem://a/seg".into(), "mem://b/seg".into()], params(2));
        let response = engine
            .request(RequestType::MediaSegment, request)
            .result()
            .await
            .unwrap();
        assert_eq!(response.data, Bytes::from_static(b"payload"));
        assert_eq!(plugin.requests(), vec!["mem://a/seg", "mem://b/seg"]);
        assert_eq!(engine.metrics().snapshot().network_retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_surfaces_last_real_error_when_exhausted() {
        let plugin = Arc::new(MemoryPlugin::new());
        plugin.insert("mem://a/seg", MemoryResponse::Status(500));
        let engine = engine(plugin.clone());

        let request = Request::new(vec!["mem://a/seg".into()], params(3));
        let error = engine
            .request(RequestType::MediaSegment, request)
            .result()
            .await
            .unwrap_err();
        assert_eq!(
            error,
            StreamingError::BadHttpStatus {
                uri: "mem://a/seg".into(),
                status: 500
            }
        );
        assert_eq!(plugin.requests().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forbidden_is_not_retried() {
        let plugin = Arc::new(MemoryPlugin::new());
        plugin.insert("mem://a/seg", MemoryResponse::Status(403));
        let engine = engine(plugin.clone());

        let request = Request::new(vec!["mem://a/seg".into()], params(5));
        let result = engine.request(RequestType::MediaSegment, request).result().await;
        assert!(matches!(result, Err(StreamingError::BadHttpStatus { status: 403, .. })));
        assert_eq!(plugin.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_timeout_is_reported_as_timeout() {
        let plugin = Arc::new(MemoryPlugin::new());
        plugin.insert("mem://a/seg", MemoryResponse::Hang);
        let engine = engine(plugin.clone());

        let request = Request::new(
            vec!["mem://a/seg".into()],
            RetryParameters {
                max_attempts: 1,
                connection_timeout_ms: 2_000,
                ..params(1)
            },
        );
        let started = Instant::now();
        let error = engine
            .request(RequestType::MediaSegment, request)
            .result()
            .await
            .unwrap_err();
        assert_eq!(error, StreamingError::timeout("mem://a/seg"));
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_unsupported_scheme() {
        let engine = engine(Arc::new(MemoryPlugin::new()));
        let request = Request::new(vec!["ftp://host/seg".into()], params(1));
        let error = engine
            .request(RequestType::MediaSegment, request)
            .result()
            .await
            .unwrap_err();
        assert_eq!(
            error,
            StreamingError::UnsupportedScheme {
                scheme: "ftp".into()
            }
        );
    }
}
