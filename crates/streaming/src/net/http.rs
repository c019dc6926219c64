// reqwest-backed plugin for http and https.

use std::collections::HashMap;
use std::sync::OnceLock;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use reqwest::Client;
use tracing::{debug, trace};
use url::Url;

use super::registry::SchemePlugin;
use super::request::{Request, RequestContext, RequestType, Response};
use crate::error::StreamingError;

pub(crate) fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Fetches over HTTP(S) and streams the body through the request context.
///
/// Timeouts are enforced by the networking engine, not by the client.
pub struct HttpPlugin {
    client: Client,
}

impl HttpPlugin {
    pub fn new() -> Result<Self, StreamingError> {
        install_rustls_provider();
        let client = Client::builder()
            .pool_max_idle_per_host(8)
            .build()
            .map_err(|e| StreamingError::http("", e.to_string()))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn map_reqwest_error(uri: &Url, error: reqwest::Error) -> StreamingError {
    if error.is_timeout() {
        StreamingError::timeout(uri.as_str())
    } else {
        StreamingError::http(uri.as_str(), error.to_string())
    }
}

#[async_trait]
impl SchemePlugin for HttpPlugin {
    async fn fetch(
        &self,
        uri: &Url,
        request: &Request,
        request_type: RequestType,
        context: &RequestContext,
    ) -> Result<Response, StreamingError> {
        let mut builder = self.client.get(uri.clone());
        if let Some(range) = request.range_header() {
            builder = builder.header(reqwest::header::RANGE, range);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_reqwest_error(uri, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(StreamingError::BadHttpStatus {
                uri: uri.to_string(),
                status: status.as_u16(),
            });
        }

        let content_length = response.content_length();
        context.headers_received(content_length);
        trace!(
            url = %uri,
            ?request_type,
            http_version = ?response.version(),
            content_length = ?content_length,
            "Response headers received"
        );

        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let final_uri = response.url().to_string();

        let mut buffer = BytesMut::with_capacity(content_length.unwrap_or(0) as usize);
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| map_reqwest_error(uri, e))?;
            buffer.extend_from_slice(&chunk);
            context.chunk(chunk).await?;
        }

        Ok(Response {
            uri: final_uri,
            data: buffer.freeze(),
            status: Some(status.as_u16()),
            headers,
        })
    }
}
