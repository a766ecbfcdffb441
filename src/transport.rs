//! Request/response capability used by retrieval. Implementations decide
//! how bytes are obtained; timeouts and retries are theirs too.

use crate::error::ErrorKind;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Request for {url} failed with status {status}")]
    Status { url: String, status: u16 },

    #[error("Range {start}-{end} not satisfiable for {url}")]
    RangeNotSatisfiable { url: String, start: u64, end: u64 },

    #[error("IO error reading {url}: {message}")]
    Io { url: String, message: String },

    #[error("Network error: {0}")]
    Network(String),
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Transport
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    /// Byte range, end exclusive. `u64::MAX` as end asks for the rest.
    pub range: Option<Range<u64>>,
    pub accept: Option<String>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_range(mut self, range: Range<u64>) -> Self {
        self.range = Some(range);
        self
    }

    pub fn with_accept(mut self, accept: impl Into<String>) -> Self {
        self.accept = Some(accept.into());
        self
    }
}

/// `Content-Range: bytes <start>-<end>/<total>`, end inclusive as on the
/// wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: Option<u64>,
}

impl ContentRange {
    pub fn parse(value: &str) -> Option<Self> {
        let spec = value.trim().strip_prefix("bytes")?.trim_start();
        let (range, total) = spec.split_once('/')?;
        let (start, end) = range.split_once('-')?;
        let total = match total.trim() {
            "*" => None,
            total => Some(total.parse().ok()?),
        };
        Some(Self {
            start: start.trim().parse().ok()?,
            end: end.trim().parse().ok()?,
            total,
        })
    }
}

impl fmt::Display for ContentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.total {
            Some(total) => write!(f, "bytes {}-{}/{total}", self.start, self.end),
            None => write!(f, "bytes {}-{}/*", self.start, self.end),
        }
    }
}

/// Header names are stored lower-case.
pub type Headers = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        header(&self.headers, name)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn content_range(&self) -> Option<ContentRange> {
        self.header("content-range").and_then(ContentRange::parse)
    }

    /// Whether the body is the whole resource rather than a slice of it.
    pub fn is_whole_resource(&self) -> bool {
        match self.content_range() {
            Some(range) => range.start == 0 && range.total == Some(range.end + 1),
            None => self.status != 206,
        }
    }

    /// Full resource length, from `Content-Range` or, for a whole-resource
    /// response, from the body itself.
    pub fn total_length(&self) -> Option<u64> {
        match self.content_range() {
            Some(range) => range.total,
            None if self.status != 206 => Some(self.body.len() as u64),
            None => None,
        }
    }
}

pub struct StreamResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: BoxStream<'static, Result<Vec<u8>, TransportError>>,
}

impl StreamResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        header(&self.headers, name)
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")
            .and_then(|value| value.trim().parse().ok())
    }
}

impl fmt::Debug for StreamResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

fn header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .get(&name.to_ascii_lowercase())
        .map(String::as_str)
}

#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, TransportError>;

    /// Read the response incrementally. Defaults to a single chunk.
    async fn stream(&self, request: &FetchRequest) -> Result<StreamResponse, TransportError> {
        let response = self.fetch(request).await?;
        Ok(StreamResponse {
            status: response.status,
            headers: response.headers,
            body: stream::once(async move { Ok(response.body) }).boxed(),
        })
    }
}

/// Serves a resource body as either the whole thing or a range of it.
fn respond(
    url: &str,
    body: &[u8],
    content_type: &str,
    range: Option<&Range<u64>>,
    supports_ranges: bool,
) -> Result<FetchResponse, TransportError> {
    let total = body.len() as u64;
    let mut headers = Headers::new();
    headers.insert("content-type".into(), content_type.to_string());

    match range.filter(|_| supports_ranges) {
        Some(range) => {
            if range.start >= total || range.start >= range.end {
                return Err(TransportError::RangeNotSatisfiable {
                    url: url.to_string(),
                    start: range.start,
                    end: range.end,
                });
            }
            let end = range.end.min(total);
            let slice = body[range.start as usize..end as usize].to_vec();
            let content_range = ContentRange {
                start: range.start,
                end: end - 1,
                total: Some(total),
            };
            headers.insert("content-range".into(), content_range.to_string());
            headers.insert("content-length".into(), slice.len().to_string());
            Ok(FetchResponse {
                status: 206,
                headers,
                body: slice,
            })
        }
        None => {
            headers.insert("content-length".into(), total.to_string());
            Ok(FetchResponse {
                status: 200,
                headers,
                body: body.to_vec(),
            })
        }
    }
}

/// Whole body as a chunked stream with a known length.
fn chunked(body: Vec<u8>, content_type: &str, chunk_size: usize) -> StreamResponse {
    let mut headers = Headers::new();
    headers.insert("content-type".into(), content_type.to_string());
    headers.insert("content-length".into(), body.len().to_string());
    let chunks: Vec<_> = body
        .chunks(chunk_size.max(1))
        .map(|chunk| Ok(chunk.to_vec()))
        .collect();
    StreamResponse {
        status: 200,
        headers,
        body: stream::iter(chunks).boxed(),
    }
}

#[derive(Debug, Clone)]
struct Resource {
    body: Vec<u8>,
    content_type: String,
    supports_ranges: bool,
}

/// In-memory resources. Records every request it serves.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    resources: Arc<Mutex<HashMap<String, Resource>>>,
    requests: Arc<Mutex<Vec<FetchRequest>>>,
    chunk_size: usize,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self {
            resources: Arc::default(),
            requests: Arc::default(),
            chunk_size: 16 * 1024,
        }
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size of the chunks `stream` yields.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn insert(&self, url: impl Into<String>, content_type: impl Into<String>, body: Vec<u8>) {
        self.insert_resource(url.into(), content_type.into(), body, true);
    }

    /// A resource that ignores range headers and always answers whole.
    pub fn insert_without_ranges(
        &self,
        url: impl Into<String>,
        content_type: impl Into<String>,
        body: Vec<u8>,
    ) {
        self.insert_resource(url.into(), content_type.into(), body, false);
    }

    fn insert_resource(&self, url: String, content_type: String, body: Vec<u8>, supports_ranges: bool) {
        self.resources.lock().insert(
            url,
            Resource {
                body,
                content_type,
                supports_ranges,
            },
        );
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    fn lookup(&self, request: &FetchRequest) -> Result<Resource, TransportError> {
        self.requests.lock().push(request.clone());
        self.resources
            .lock()
            .get(&request.url)
            .cloned()
            .ok_or_else(|| TransportError::NotFound(request.url.clone()))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, TransportError> {
        let resource = self.lookup(request)?;
        respond(
            &request.url,
            &resource.body,
            &resource.content_type,
            request.range.as_ref(),
            resource.supports_ranges,
        )
    }

    async fn stream(&self, request: &FetchRequest) -> Result<StreamResponse, TransportError> {
        let resource = self.lookup(request)?;
        Ok(chunked(resource.body, &resource.content_type, self.chunk_size))
    }
}

/// Local files addressed as `file://<path>` or a bare path. Ranges are
/// served from the file read whole.
#[derive(Debug, Clone)]
pub struct FileTransport {
    content_type: String,
    chunk_size: usize,
}

impl Default for FileTransport {
    fn default() -> Self {
        Self {
            content_type: "application/dicom".to_string(),
            chunk_size: 64 * 1024,
        }
    }
}

impl FileTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path_of(url: &str) -> PathBuf {
        PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
    }

    async fn read(url: &str) -> Result<Vec<u8>, TransportError> {
        let io_error = |message: String| TransportError::Io {
            url: url.to_string(),
            message,
        };
        let path = Self::path_of(url);
        tokio::task::spawn_blocking(move || std::fs::read(path))
            .await
            .map_err(|error| io_error(error.to_string()))?
            .map_err(|error| match error.kind() {
                std::io::ErrorKind::NotFound => TransportError::NotFound(url.to_string()),
                _ => io_error(error.to_string()),
            })
    }
}

#[async_trait]
impl Transport for FileTransport {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, TransportError> {
        let body = Self::read(&request.url).await?;
        debug!(url = %request.url, bytes = body.len(), "file read");
        respond(&request.url, &body, &self.content_type, request.range.as_ref(), true)
    }

    async fn stream(&self, request: &FetchRequest) -> Result<StreamResponse, TransportError> {
        let body = Self::read(&request.url).await?;
        Ok(chunked(body, &self.content_type, self.chunk_size))
    }
}

#[cfg(feature = "http")]
pub use http::ReqwestTransport;

#[cfg(feature = "http")]
mod http {
    use super::*;

    /// HTTP transport backed by `reqwest`.
    #[derive(Debug, Clone, Default)]
    pub struct ReqwestTransport {
        client: reqwest::Client,
    }

    impl ReqwestTransport {
        pub fn new(client: reqwest::Client) -> Self {
            Self { client }
        }

        async fn send(&self, request: &FetchRequest) -> Result<reqwest::Response, TransportError> {
            let mut builder = self.client.get(&request.url);
            if let Some(range) = &request.range {
                let value = match range.end {
                    u64::MAX => format!("bytes={}-", range.start),
                    end => format!("bytes={}-{}", range.start, end.saturating_sub(1)),
                };
                builder = builder.header(reqwest::header::RANGE, value);
            }
            if let Some(accept) = &request.accept {
                builder = builder.header(reqwest::header::ACCEPT, accept);
            }
            let response = builder
                .send()
                .await
                .map_err(|error| TransportError::Network(error.to_string()))?;
            let status = response.status();
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(TransportError::NotFound(request.url.clone()));
            }
            if !status.is_success() {
                return Err(TransportError::Status {
                    url: request.url.clone(),
                    status: status.as_u16(),
                });
            }
            Ok(response)
        }

        fn headers_of(response: &reqwest::Response) -> Headers {
            response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
                })
                .collect()
        }
    }

    #[async_trait]
    impl Transport for ReqwestTransport {
        async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, TransportError> {
            let response = self.send(request).await?;
            let status = response.status().as_u16();
            let headers = Self::headers_of(&response);
            let body = response
                .bytes()
                .await
                .map_err(|error| TransportError::Network(error.to_string()))?;
            Ok(FetchResponse {
                status,
                headers,
                body: body.to_vec(),
            })
        }

        async fn stream(&self, request: &FetchRequest) -> Result<StreamResponse, TransportError> {
            let response = self.send(request).await?;
            let status = response.status().as_u16();
            let headers = Self::headers_of(&response);
            let body = response
                .bytes_stream()
                .map(|chunk| {
                    chunk
                        .map(|bytes| bytes.to_vec())
                        .map_err(|error| TransportError::Network(error.to_string()))
                })
                .boxed();
            Ok(StreamResponse {
                status,
                headers,
                body,
            })
        }
    }
}
