//! Retrieval of the compressed bytes of one frame.
//!
//! Three strategies produce a stream of [`CompressedPayload`]s ordered by
//! increasing completeness, the last one final:
//!
//!  - single shot: one request, one final payload
//!  - byte range: an initial range, then the remainder split over the
//!    configured number of ranges
//!  - streaming: one request read incrementally, re-extracted whenever
//!    enough new bytes arrived and the decode level would improve

use crate::config::RetrieveConfig;
use crate::enums::{DecodeStatus, RetrievalStrategy};
use crate::error::ErrorKind;
use crate::frame::CompressedPayload;
use crate::locator::ImageLocator;
use crate::multipart::{self, MultipartError};
use crate::streaming::{DecodeLevelStaircase, StoreLease, StreamingStore};
use crate::transport::{FetchRequest, FetchResponse, Transport, TransportError};

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_ACCEPT: &str =
    r#"multipart/related; type="application/octet-stream"; transfer-syntax=*"#;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RetrieveError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Multipart(#[from] MultipartError),

    #[error("No transfer syntax known for {0}")]
    MissingTransferSyntax(String),

    #[error("Response for {url} ended after {received} of {expected} bytes")]
    Truncated {
        url: String,
        received: u64,
        expected: u64,
    },

    #[error("Empty range response for {0}")]
    EmptyRange(String),
}

impl RetrieveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RetrieveError::Transport(_)
            | RetrieveError::Truncated { .. }
            | RetrieveError::EmptyRange(_) => ErrorKind::Transport,
            RetrieveError::Multipart(error) => error.kind(),
            RetrieveError::MissingTransferSyntax(_) => ErrorKind::Configuration,
        }
    }
}

/// Size of the first range request.
#[derive(Clone)]
pub enum InitialBytes {
    Fixed(u64),
    Computed(Arc<dyn Fn(&ImageLocator) -> u64 + Send + Sync>),
}

impl InitialBytes {
    pub fn resolve(&self, locator: &ImageLocator) -> u64 {
        match self {
            InitialBytes::Fixed(bytes) => *bytes,
            InitialBytes::Computed(compute) => compute(locator),
        }
        .max(1)
    }
}

impl fmt::Debug for InitialBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitialBytes::Fixed(bytes) => f.debug_tuple("Fixed").field(bytes).finish(),
            InitialBytes::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// Told about every rejected delivery. Does not change propagation.
pub trait RetrieveInterceptor: Send + Sync + fmt::Debug {
    fn on_error(&self, locator: &ImageLocator, error: &RetrieveError);
}

#[derive(Debug, Clone, Default)]
pub struct RetrieveOptions {
    /// Overrides the strategy chosen from configuration.
    pub strategy: Option<RetrievalStrategy>,
    /// Overrides `initial_bytes` from configuration.
    pub initial_bytes: Option<InitialBytes>,
    /// Used when the response does not name its transfer syntax.
    pub transfer_syntax: Option<String>,
    pub accept: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Retriever {
    transport: Arc<dyn Transport>,
    store: StreamingStore,
    config: RetrieveConfig,
    interceptor: Option<Arc<dyn RetrieveInterceptor>>,
}

impl Retriever {
    pub fn new(transport: Arc<dyn Transport>, config: RetrieveConfig) -> Self {
        Self {
            transport,
            store: StreamingStore::new(),
            config,
            interceptor: None,
        }
    }

    pub fn with_store(mut self, store: StreamingStore) -> Self {
        self.store = store;
        self
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn RetrieveInterceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    pub fn store(&self) -> &StreamingStore {
        &self.store
    }

    pub fn config(&self) -> &RetrieveConfig {
        &self.config
    }

    pub fn strategy_for(&self, options: &RetrieveOptions) -> RetrievalStrategy {
        options.strategy.unwrap_or(if self.config.streaming {
            RetrievalStrategy::Streaming
        } else if self.config.range_requests {
            RetrievalStrategy::ByteRange
        } else {
            RetrievalStrategy::SingleShot
        })
    }

    /// Retrieve the compressed bytes for `locator`. The stream ends after
    /// the final payload or the first error.
    pub fn retrieve(
        &self,
        locator: &ImageLocator,
        options: RetrieveOptions,
    ) -> BoxStream<'static, Result<CompressedPayload, RetrieveError>> {
        let strategy = self.strategy_for(&options);
        let initial_bytes = options
            .initial_bytes
            .clone()
            .unwrap_or(InitialBytes::Fixed(self.config.initial_bytes))
            .resolve(locator);
        debug!(url = %locator.url, ?strategy, "retrieving frame");

        let session = Session {
            locator: locator.clone(),
            transport: Arc::clone(&self.transport),
            store: self.store.clone(),
            staircase: DecodeLevelStaircase::new(self.config.decode_levels.clone()),
            fallback_syntax: options.transfer_syntax,
            accept: options.accept.unwrap_or_else(|| DEFAULT_ACCEPT.to_string()),
            content_type: None,
        };
        let payloads = match strategy {
            RetrievalStrategy::SingleShot => single_shot(session),
            RetrievalStrategy::ByteRange => {
                byte_ranges(session, initial_bytes, self.config.total_ranges.max(1))
            }
            RetrievalStrategy::Streaming => streamed(session, self.config.min_chunk_size),
        };

        match self.interceptor.clone() {
            Some(interceptor) => {
                let locator = locator.clone();
                payloads
                    .inspect_err(move |error| interceptor.on_error(&locator, error))
                    .boxed()
            }
            None => payloads,
        }
    }
}

/// State shared by all strategies for one retrieval.
struct Session {
    locator: ImageLocator,
    transport: Arc<dyn Transport>,
    store: StreamingStore,
    staircase: DecodeLevelStaircase,
    fallback_syntax: Option<String>,
    accept: String,
    content_type: Option<String>,
}

impl Session {
    fn request(&self) -> FetchRequest {
        FetchRequest::new(&self.locator.url).with_accept(&self.accept)
    }

    /// Extract the payload from the accumulated `body`.
    ///
    /// `body_complete` means no more bytes will arrive. Intermediate
    /// payloads are tagged `Subresolution` or `Lossy` by decode level.
    fn payload(
        &self,
        body: &[u8],
        body_complete: bool,
        fraction: Option<f64>,
    ) -> Result<Option<CompressedPayload>, RetrieveError> {
        let Some(part) = multipart::extract(self.content_type.as_deref(), body, body_complete)?
        else {
            return Ok(None);
        };
        let transfer_syntax = part
            .transfer_syntax
            .or_else(|| self.fallback_syntax.clone())
            .ok_or_else(|| RetrieveError::MissingTransferSyntax(self.locator.url.clone()))?;

        let is_final = body_complete || part.terminated;
        let (status, decode_level, percent_complete) = if is_final {
            (DecodeStatus::Complete, 0, 100.0)
        } else {
            let level = fraction.map_or(self.staircase.coarsest(), |f| self.staircase.level_for(f));
            let status = if level > 0 {
                DecodeStatus::Subresolution
            } else {
                DecodeStatus::Lossy
            };
            (status, level, fraction.unwrap_or(0.0) * 100.0)
        };

        Ok(Some(CompressedPayload {
            transfer_syntax,
            content_type: part.content_type,
            bytes: body[part.range.clone()].to_vec(),
            pixel_range: part.range,
            is_final,
            status,
            percent_complete,
            decode_level,
        }))
    }
}

fn single_shot(session: Session) -> BoxStream<'static, Result<CompressedPayload, RetrieveError>> {
    stream::once(fetch_whole(session)).boxed()
}

async fn fetch_whole(mut session: Session) -> Result<CompressedPayload, RetrieveError> {
    let response = session.transport.fetch(&session.request()).await?;
    session.content_type = response.content_type().map(str::to_string);
    session
        .payload(&response.body, true, Some(1.0))?
        .ok_or_else(|| RetrieveError::EmptyRange(session.locator.url.clone()))
}

struct RangeState {
    session: Session,
    handle: StoreLease,
    initial_bytes: u64,
    total_ranges: u32,
    done: bool,
}

impl RangeState {
    fn next_request(&self) -> FetchRequest {
        let state = self.handle.lock();
        let start = state.bytes_fetched();
        let end = match state.total_bytes() {
            None if state.ranges_fetched() == 0 => self.initial_bytes,
            None => u64::MAX,
            Some(total) => {
                let remaining = total.saturating_sub(start);
                let ranges_left = self
                    .total_ranges
                    .saturating_sub(state.ranges_fetched())
                    .max(1) as u64;
                start + remaining.div_ceil(ranges_left)
            }
        };
        self.session.request().with_range(start..end)
    }

    fn absorb(&mut self, response: FetchResponse) -> Result<Option<CompressedPayload>, RetrieveError> {
        if self.session.content_type.is_none() {
            self.session.content_type = response.content_type().map(str::to_string);
        }
        let mut state = self.handle.lock();
        let fetched = state.bytes_fetched() as usize;
        let whole = response.is_whole_resource();
        let fresh = if whole {
            response.body.get(fetched..).unwrap_or_default()
        } else {
            &response.body[..]
        };
        if fresh.is_empty() && !whole {
            return Err(RetrieveError::EmptyRange(self.session.locator.url.clone()));
        }
        state.append_range(fresh);
        if let Some(total) = response.total_length() {
            state.learn_total(total);
        }
        let open_ended = state.total_bytes().is_none() && state.ranges_fetched() > 1;
        let body_complete = whole || open_ended || state.is_complete();
        debug!(
            url = %self.session.locator.url,
            range = state.ranges_fetched(),
            fetched = state.bytes_fetched(),
            total = ?state.total_bytes(),
            "range received"
        );

        let payload = self
            .session
            .payload(state.buffer(), body_complete, state.fraction())?;
        if body_complete || payload.as_ref().is_some_and(|p| p.is_final) {
            self.done = true;
        }
        Ok(payload)
    }
}

fn byte_ranges(
    session: Session,
    initial_bytes: u64,
    total_ranges: u32,
) -> BoxStream<'static, Result<CompressedPayload, RetrieveError>> {
    let handle = session.store.lease(&session.locator.url);
    let state = RangeState {
        session,
        handle,
        initial_bytes,
        total_ranges,
        done: false,
    };
    stream::try_unfold(state, next_range).boxed()
}

async fn next_range(
    mut state: RangeState,
) -> Result<Option<(CompressedPayload, RangeState)>, RetrieveError> {
    while !state.done {
        let request = state.next_request();
        debug!(url = %request.url, range = ?request.range, "requesting range");
        let response = state.session.transport.fetch(&request).await?;
        if let Some(payload) = state.absorb(response)? {
            if state.done {
                info!(url = %state.session.locator.url, "range retrieval complete");
            }
            return Ok(Some((payload, state)));
        }
    }
    Ok(None)
}

struct StreamState {
    session: Session,
    handle: StoreLease,
    body: Option<BoxStream<'static, Result<Vec<u8>, TransportError>>>,
    min_chunk_size: usize,
    pending: usize,
    last_level: Option<u8>,
    done: bool,
}

impl StreamState {
    /// Re-extract after new bytes arrived, unless the last delivery was
    /// already at least as fine.
    fn attempt(&mut self) -> Result<Option<CompressedPayload>, RetrieveError> {
        let state = self.handle.lock();
        let level = state
            .fraction()
            .map_or(self.session.staircase.coarsest(), |f| self.session.staircase.level_for(f));
        if self.last_level.is_some_and(|last| last <= level) {
            return Ok(None);
        }
        let payload = self.session.payload(state.buffer(), false, state.fraction())?;
        drop(state);
        if let Some(payload) = &payload {
            self.last_level = Some(payload.decode_level);
            self.done = payload.is_final;
        }
        Ok(payload)
    }

    fn conclude(&mut self) -> Result<Option<CompressedPayload>, RetrieveError> {
        self.done = true;
        let state = self.handle.lock();
        if let Some(expected) = state.total_bytes().filter(|&total| state.bytes_fetched() < total) {
            return Err(RetrieveError::Truncated {
                url: self.session.locator.url.clone(),
                received: state.bytes_fetched(),
                expected,
            });
        }
        self.session.payload(state.buffer(), true, Some(1.0))
    }
}

fn streamed(
    session: Session,
    min_chunk_size: usize,
) -> BoxStream<'static, Result<CompressedPayload, RetrieveError>> {
    let handle = session.store.lease(&session.locator.url);
    let state = StreamState {
        session,
        handle,
        body: None,
        min_chunk_size,
        pending: 0,
        last_level: None,
        done: false,
    };
    stream::try_unfold(state, next_chunk).boxed()
}

async fn next_chunk(
    mut state: StreamState,
) -> Result<Option<(CompressedPayload, StreamState)>, RetrieveError> {
    if state.done {
        return Ok(None);
    }
    if state.body.is_none() {
        let response = state.session.transport.stream(&state.session.request()).await?;
        if let Some(total) = response.content_length() {
            state.handle.lock().learn_total(total);
        }
        state.session.content_type = response.header("content-type").map(str::to_string);
        state.body = Some(response.body);
    }

    loop {
        let next = match state.body.as_mut() {
            Some(body) => body.next().await,
            None => None,
        };
        let Some(chunk) = next else {
            let payload = state.conclude()?;
            info!(url = %state.session.locator.url, "stream retrieval complete");
            return Ok(payload.map(|payload| (payload, state)));
        };
        let chunk = chunk?;
        state.handle.lock().append(&chunk);
        state.pending += chunk.len();
        if state.pending < state.min_chunk_size {
            continue;
        }
        state.pending = 0;
        if let Some(payload) = state.attempt()? {
            return Ok(Some((payload, state)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use parking_lot::Mutex;

    const URL: &str = "https://pacs/studies/1/series/2/instances/3/frames/1";
    const TYPE: &str = r#"multipart/related; type="application/octet-stream"; boundary=b0"#;

    fn multipart_body(data: &[u8]) -> Vec<u8> {
        let mut body =
            b"--b0\r\nContent-Type: application/octet-stream; transfer-syntax=1.2.840.10008.1.2.1\r\n\r\n"
                .to_vec();
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n--b0--");
        body
    }

    fn locator() -> ImageLocator {
        ImageLocator::parse(&format!("wadors:{URL}")).unwrap()
    }

    async fn collect(
        retriever: &Retriever,
        options: RetrieveOptions,
    ) -> Vec<Result<CompressedPayload, RetrieveError>> {
        retriever.retrieve(&locator(), options).collect().await
    }

    #[tokio::test]
    async fn single_shot_yields_one_final_payload() {
        let transport = MemoryTransport::new();
        transport.insert(URL, TYPE, multipart_body(&[1, 2, 3]));
        let retriever = Retriever::new(Arc::new(transport.clone()), RetrieveConfig::default());

        let payloads = collect(&retriever, RetrieveOptions::default()).await;
        assert_eq!(payloads.len(), 1);
        let payload = payloads[0].as_ref().unwrap();
        assert_eq!(payload.bytes, vec![1, 2, 3]);
        assert!(payload.is_final);
        assert_eq!(payload.status, DecodeStatus::Complete);
        assert_eq!(payload.transfer_syntax, "1.2.840.10008.1.2.1");
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn byte_ranges_cover_the_resource() {
        let data: Vec<u8> = (0..200).map(|v| v as u8).collect();
        let body = multipart_body(&data);
        let transport = MemoryTransport::new();
        transport.insert(URL, TYPE, body.clone());
        let config = RetrieveConfig {
            range_requests: true,
            initial_bytes: 100,
            total_ranges: 3,
            ..RetrieveConfig::default()
        };
        let retriever = Retriever::new(Arc::new(transport.clone()), config);

        let payloads: Vec<_> = collect(&retriever, RetrieveOptions::default())
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(payloads.len(), 3);
        assert!(payloads[..2].iter().all(|p| !p.is_final && p.status != DecodeStatus::Complete));
        assert!(payloads.windows(2).all(|w| w[0].bytes.len() < w[1].bytes.len()));
        let last = payloads.last().unwrap();
        assert!(last.is_final);
        assert_eq!(last.bytes, data);

        let ranges: Vec<_> = transport.requests().into_iter().filter_map(|r| r.range).collect();
        assert_eq!(ranges[0], 0..100);
        assert_eq!(ranges[1].start, 100);
        assert_eq!(ranges.last().map(|r| r.end), Some(body.len() as u64));
        assert!(retriever.store().is_empty());
    }

    #[tokio::test]
    async fn whole_response_ends_range_retrieval() {
        let transport = MemoryTransport::new();
        transport.insert_without_ranges(URL, TYPE, multipart_body(&[4; 50]));
        let config = RetrieveConfig {
            range_requests: true,
            initial_bytes: 10,
            ..RetrieveConfig::default()
        };
        let retriever = Retriever::new(Arc::new(transport.clone()), config);

        let payloads = collect(&retriever, RetrieveOptions::default()).await;
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].as_ref().unwrap().is_final);
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn computed_initial_bytes() {
        let transport = MemoryTransport::new();
        transport.insert(URL, TYPE, multipart_body(&[4; 50]));
        let retriever = Retriever::new(Arc::new(transport.clone()), RetrieveConfig::default());
        let options = RetrieveOptions {
            strategy: Some(RetrievalStrategy::ByteRange),
            initial_bytes: Some(InitialBytes::Computed(Arc::new(|locator| {
                20 + locator.frame as u64
            }))),
            ..RetrieveOptions::default()
        };

        let payloads = collect(&retriever, options).await;
        assert!(payloads.iter().all(Result::is_ok));
        assert_eq!(transport.requests()[0].range, Some(0..21));
    }

    #[derive(Debug, Default)]
    struct Errors(Mutex<Vec<String>>);

    impl RetrieveInterceptor for Errors {
        fn on_error(&self, locator: &ImageLocator, error: &RetrieveError) {
            self.0.lock().push(format!("{}: {error}", locator.frame));
        }
    }

    #[tokio::test]
    async fn missing_terminator_on_final_is_rejected_and_intercepted() {
        let mut body = multipart_body(&[1, 2]);
        body.truncate(body.len() - 8);
        let transport = MemoryTransport::new();
        transport.insert(URL, TYPE, body);
        let errors = Arc::new(Errors::default());
        let retriever = Retriever::new(Arc::new(transport), RetrieveConfig::default())
            .with_interceptor(errors.clone());

        let payloads = collect(&retriever, RetrieveOptions::default()).await;
        let error = payloads[0].as_ref().unwrap_err();
        assert!(matches!(error, RetrieveError::Multipart(MultipartError::MissingTerminator(_))));
        assert_eq!(error.kind(), ErrorKind::Data);
        assert_eq!(errors.0.lock().len(), 1);
    }

    #[tokio::test]
    async fn missing_resource_is_transport_error() {
        let retriever = Retriever::new(Arc::new(MemoryTransport::new()), RetrieveConfig::default());
        let payloads = collect(&retriever, RetrieveOptions::default()).await;
        assert_eq!(payloads[0].as_ref().unwrap_err().kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn failed_range_retrieval_leaves_no_buffer() {
        let mut body = multipart_body(&[7; 80]);
        body.truncate(body.len() - 8);
        let transport = MemoryTransport::new();
        transport.insert(URL, TYPE, body);
        let config = RetrieveConfig {
            range_requests: true,
            initial_bytes: 40,
            total_ranges: 2,
            ..RetrieveConfig::default()
        };
        let retriever = Retriever::new(Arc::new(transport), config);

        let payloads = collect(&retriever, RetrieveOptions::default()).await;
        assert!(payloads.last().unwrap().is_err());
        assert!(retriever.store().is_empty());
    }
}
