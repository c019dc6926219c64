use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RetryParameters;
use crate::error::StreamingError;

/// What a request fetches. Plugins and filters may treat kinds differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    InitSegment,
    MediaSegment,
    Other,
}

/// Receives body chunks as they arrive. Returning an error fails the request.
pub type StreamDataCallback =
    Arc<dyn Fn(Bytes) -> BoxFuture<'static, Result<(), StreamingError>> + Send + Sync>;

/// A request for one resource, with candidate URIs tried in rotation.
#[derive(Clone)]
pub struct Request {
    pub uris: Vec<String>,
    pub start_byte: u64,
    pub end_byte: Option<u64>,
    pub headers: Vec<(String, String)>,
    pub retry_parameters: RetryParameters,
    pub stream_data_callback: Option<StreamDataCallback>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("uris", &self.uris)
            .field("start_byte", &self.start_byte)
            .field("end_byte", &self.end_byte)
            .field("streaming", &self.stream_data_callback.is_some())
            .finish()
    }
}

impl Request {
    pub fn new(uris: Vec<String>, retry_parameters: RetryParameters) -> Self {
        Self {
            uris,
            start_byte: 0,
            end_byte: None,
            headers: Vec::new(),
            retry_parameters,
            stream_data_callback: None,
        }
    }

    pub fn with_byte_range(mut self, start_byte: u64, end_byte: Option<u64>) -> Self {
        self.start_byte = start_byte;
        self.end_byte = end_byte;
        self
    }

    pub fn with_stream_data_callback(mut self, callback: StreamDataCallback) -> Self {
        self.stream_data_callback = Some(callback);
        self
    }

    /// `Range` header value, when only part of the resource is wanted.
    pub fn range_header(&self) -> Option<String> {
        match (self.start_byte, self.end_byte) {
            (0, None) => None,
            (start, Some(end)) => Some(format!("bytes={start}-{end}")),
            (start, None) => Some(format!("bytes={start}-")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    /// The URI that finally answered.
    pub uri: String,
    pub data: Bytes,
    pub status: Option<u16>,
    pub headers: HashMap<String, String>,
}

/// Progress of an in-flight request, shared between the transport and
/// whoever holds the [`PendingRequest`].
#[derive(Debug)]
pub struct RequestProgress {
    total: AtomicU64,
    received: AtomicU64,
    headers: watch::Sender<bool>,
    last_activity: Mutex<Instant>,
}

const UNKNOWN_LENGTH: u64 = u64::MAX;

impl Default for RequestProgress {
    fn default() -> Self {
        Self {
            total: AtomicU64::new(UNKNOWN_LENGTH),
            received: AtomicU64::new(0),
            headers: watch::Sender::new(false),
            last_activity: Mutex::new(Instant::now()),
        }
    }
}

impl RequestProgress {
    /// Forget the previous attempt.
    pub(crate) fn restart(&self) {
        self.total.store(UNKNOWN_LENGTH, Ordering::Relaxed);
        self.received.store(0, Ordering::Relaxed);
        self.headers.send_replace(false);
        *self.last_activity.lock() = Instant::now();
    }

    pub fn headers_received(&self, content_length: Option<u64>) {
        self.total
            .store(content_length.unwrap_or(UNKNOWN_LENGTH), Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();
        self.headers.send_replace(true);
    }

    pub fn bytes_received(&self, count: u64) {
        self.received.fetch_add(count, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();
    }

    pub fn bytes_remaining(&self) -> Option<u64> {
        match self.total.load(Ordering::Relaxed) {
            UNKNOWN_LENGTH => None,
            total => Some(total.saturating_sub(self.received.load(Ordering::Relaxed))),
        }
    }

    pub fn has_headers(&self) -> bool {
        *self.headers.borrow()
    }

    pub(crate) fn subscribe_headers(&self) -> watch::Receiver<bool> {
        self.headers.subscribe()
    }

    pub(crate) fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }
}

/// What a scheme plugin reports progress and body chunks through.
pub struct RequestContext {
    progress: Arc<RequestProgress>,
    stream_data_callback: Option<StreamDataCallback>,
}

impl RequestContext {
    pub(crate) fn new(progress: Arc<RequestProgress>, request: &Request) -> Self {
        Self {
            progress,
            stream_data_callback: request.stream_data_callback.clone(),
        }
    }

    pub fn headers_received(&self, content_length: Option<u64>) {
        self.progress.headers_received(content_length);
    }

    /// Report a body chunk, forwarding it to the stream-data callback.
    pub async fn chunk(&self, chunk: Bytes) -> Result<(), StreamingError> {
        self.progress.bytes_received(chunk.len() as u64);
        match &self.stream_data_callback {
            Some(callback) => callback(chunk).await,
            None => Ok(()),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.stream_data_callback.is_some()
    }
}

type SharedResult = Shared<BoxFuture<'static, Result<Response, StreamingError>>>;

/// Handle to a request running in the background.
///
/// Clones observe the same outcome. Dropping every handle does not cancel
/// the request; call [`PendingRequest::abort`].
#[derive(Clone)]
pub struct PendingRequest {
    result: SharedResult,
    cancel: CancellationToken,
    progress: Arc<RequestProgress>,
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("aborted", &self.cancel.is_cancelled())
            .field("bytes_remaining", &self.bytes_remaining())
            .finish()
    }
}

impl PendingRequest {
    /// Run `operation` on the runtime, resolving to `OperationAborted` when
    /// cancelled first.
    pub fn spawn<F>(operation: F, progress: Arc<RequestProgress>) -> Self
    where
        F: Future<Output = Result<Response, StreamingError>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(StreamingError::OperationAborted),
                result = operation => result,
            }
        });
        let result = handle
            .map(|joined| joined.unwrap_or(Err(StreamingError::OperationAborted)))
            .boxed()
            .shared();
        Self {
            result,
            cancel,
            progress,
        }
    }

    /// An already completed request.
    pub fn ready(result: Result<Response, StreamingError>) -> Self {
        Self {
            result: futures::future::ready(result).boxed().shared(),
            cancel: CancellationToken::new(),
            progress: Arc::new(RequestProgress::default()),
        }
    }

    pub async fn result(&self) -> Result<Response, StreamingError> {
        self.result.clone().await
    }

    /// Completed result, if the request already finished.
    pub fn peek(&self) -> Option<Result<Response, StreamingError>> {
        self.result.peek().cloned()
    }

    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Abort and wait for the transport to stop. Never fails.
    pub async fn abort_and_wait(&self) {
        self.cancel.cancel();
        let _ = self.result.clone().await;
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn bytes_remaining(&self) -> Option<u64> {
        self.progress.bytes_remaining()
    }

    pub fn progress(&self) -> &Arc<RequestProgress> {
        &self.progress
    }
}
