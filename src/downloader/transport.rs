use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::{header, redirect, Client};

use crate::envconfig::WorkerConfig;
use crate::error::{Result, WorkerError};

pub type BodyStream = BoxStream<'static, Result<Bytes>>;

pub struct TransportResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: BodyStream,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Network side of the downloader. Errors returned here are connection
/// level; HTTP statuses are reported in the response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<TransportResponse>;
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: &WorkerConfig) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::CACHE_CONTROL, header::HeaderValue::from_static("no-cache"));
        headers.insert(header::PRAGMA, header::HeaderValue::from_static("no-cache"));

        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .redirect(redirect::Policy::limited(config.max_redirects))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| WorkerError::transport("<client>", e))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, url: &str) -> Result<TransportResponse> {
        let res = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| WorkerError::transport(url, e))?;

        let status = res.status().as_u16();
        let content_length = res
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let owned_url = url.to_string();
        let body = res
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| WorkerError::transport(owned_url.clone(), e)))
            .boxed();

        Ok(TransportResponse {
            status,
            content_length,
            body,
        })
    }
}
