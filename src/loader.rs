//! End-to-end frame loading: retrieval, caching and decoding combined into
//! one stream of increasingly complete frames.

use crate::cache::DatasetCache;
use crate::config::LoaderConfig;
use crate::dataset::{DatasetFetcher, ParsedDataset, TransportFetcher};
use crate::dispatcher::{DECODE_TASK, DecodeHandler, DecodeJob, DecodeOptions, Dispatcher};
use crate::enums::{DecodeStatus, Scheme};
use crate::error::{ErrorKind, LoadError};
use crate::frame::{CompressedPayload, DecodedFrame, FrameDescriptor, PixelBuffer, ScalingParameters};
use crate::locator::ImageLocator;
use crate::metadata::{MetadataError, MetadataProvider, scaling_from_dataset};
use crate::multiframe::MultiframeIndex;
use crate::retrieve::{RetrieveOptions, Retriever};
use crate::transport::Transport;
use crate::worker_pool::{TaskError, WorkerPool};

use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Decode priority, higher runs sooner.
    pub priority: i32,
    /// Buffer every decoded frame is placed into.
    pub target: Option<PixelBuffer>,
    /// Overrides the rescale parameters found in metadata.
    pub scaling: Option<ScalingParameters>,
    pub retrieve: RetrieveOptions,
}

/// Loads frames named by `wadouri:` and `wadors:` image ids.
///
/// `wadors:` frames are retrieved on their own; `wadouri:` frames are cut
/// from a cached container that is fetched further while incomplete.
/// Either way decoding runs on the worker pool.
#[derive(Debug, Clone)]
pub struct FrameLoader {
    config: LoaderConfig,
    pool: WorkerPool<DecodeHandler>,
    retriever: Retriever,
    cache: DatasetCache,
    multiframe: MultiframeIndex,
    fetcher: Arc<dyn DatasetFetcher>,
    metadata: Option<Arc<dyn MetadataProvider>>,
}

impl FrameLoader {
    pub fn new(config: LoaderConfig, transport: Arc<dyn Transport>) -> Self {
        Self::with_dispatcher(config, transport, Dispatcher::default())
    }

    pub fn with_dispatcher(config: LoaderConfig, transport: Arc<dyn Transport>, dispatcher: Dispatcher) -> Self {
        let mut fetcher = TransportFetcher::new(Arc::clone(&transport));
        if config.retrieve.range_requests {
            fetcher = fetcher.with_initial_bytes(config.retrieve.initial_bytes);
        }
        Self {
            pool: WorkerPool::new(config.pool.clone(), DecodeHandler::new(dispatcher)),
            retriever: Retriever::new(transport, config.retrieve.clone()),
            cache: DatasetCache::new(),
            multiframe: MultiframeIndex::new(),
            fetcher: Arc::new(fetcher),
            metadata: None,
            config,
        }
    }

    pub fn with_metadata(mut self, metadata: Arc<dyn MetadataProvider>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn DatasetFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_retriever(mut self, retriever: Retriever) -> Self {
        self.retriever = retriever;
        self
    }

    pub fn pool(&self) -> &WorkerPool<DecodeHandler> {
        &self.pool
    }

    pub fn cache(&self) -> &DatasetCache {
        &self.cache
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub fn multiframe(&self) -> &MultiframeIndex {
        &self.multiframe
    }

    /// Stream the frame named by `image_id`, ending with a `Complete` frame
    /// (or a `Lossy` one when lossy results are terminal) or an error.
    pub fn load_frame(
        &self,
        image_id: &str,
        options: LoadOptions,
    ) -> BoxStream<'static, Result<DecodedFrame, LoadError>> {
        let locator = match ImageLocator::parse(image_id) {
            Ok(locator) => locator,
            Err(error) => return stream::once(async move { Err(error.into()) }).boxed(),
        };
        let frames = match locator.scheme {
            Scheme::WadoRs => self.load_wadors(image_id, locator, options),
            Scheme::WadoUri => {
                let progress = UriProgress {
                    loader: self.clone(),
                    locator,
                    options,
                    dataset: None,
                    frame: None,
                    needs_more: false,
                    done: false,
                };
                stream::try_unfold(progress, next_uri_frame).boxed()
            }
        };
        terminate_after_final(frames, self.config.retrieve.lossy_is_terminal)
    }

    /// Drop the cache reference taken by loading a `wadouri:` frame.
    pub fn release(&self, image_id: &str) -> bool {
        match ImageLocator::parse(image_id) {
            Ok(locator) if locator.scheme == Scheme::WadoUri => {
                let released = self.cache.unload(locator.source_uri());
                if released && self.cache.get(locator.source_uri()).is_none() {
                    self.multiframe.forget(locator.source_uri());
                }
                released
            }
            _ => false,
        }
    }

    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    fn load_wadors(
        &self,
        image_id: &str,
        locator: ImageLocator,
        mut options: LoadOptions,
    ) -> BoxStream<'static, Result<DecodedFrame, LoadError>> {
        let metadata = self.metadata.as_deref();
        let Some(descriptor) = metadata.and_then(|m| m.pixel_module(image_id)) else {
            let error = MetadataError::Missing {
                module: "pixel",
                image_id: image_id.to_string(),
            };
            return stream::once(async move { Err(error.into()) }).boxed();
        };
        let scaling = options
            .scaling
            .take()
            .or_else(|| metadata.and_then(|m| m.scaling(image_id)));
        if options.retrieve.transfer_syntax.is_none() {
            options.retrieve.transfer_syntax = metadata.and_then(|m| m.transfer_syntax(image_id));
        }

        let loader = self.clone();
        let target = options.target.take();
        let priority = options.priority;
        self.retriever
            .retrieve(&locator, options.retrieve)
            .then(move |payload| {
                let loader = loader.clone();
                let descriptor = descriptor.clone();
                let scaling = scaling.clone();
                let target = target.clone();
                async move {
                    loader
                        .decode(descriptor, payload?, scaling, target, priority)
                        .await
                }
            })
            .filter_map(|decoded| async move { decoded.transpose() })
            .boxed()
    }

    /// Decode one payload on the pool. A data error on a payload that is
    /// not final is logged and skipped, since a later payload may succeed.
    async fn decode(
        &self,
        descriptor: FrameDescriptor,
        payload: CompressedPayload,
        scaling: Option<ScalingParameters>,
        target: Option<PixelBuffer>,
        priority: i32,
    ) -> Result<Option<DecodedFrame>, LoadError> {
        let is_final = payload.is_final;
        let percent_complete = payload.percent_complete;
        let job = DecodeJob {
            descriptor,
            payload,
            options: DecodeOptions {
                target,
                scaling,
                pre_scale: self.config.decode.pre_scale.enabled,
                allow_float_rendering: self.config.decode.allow_float_rendering,
            },
        };
        let (task, result) = self.pool.submit(DECODE_TASK, job, priority);
        match result.await {
            Ok(frame) => Ok(Some(frame)),
            Err(TaskError::Failed(error)) if !is_final && error.kind() == ErrorKind::Data => {
                warn!(%task, percent_complete, %error, "intermediate decode failed");
                Ok(None)
            }
            Err(error) => Err(LoadError::from(error)),
        }
    }
}

struct UriProgress {
    loader: FrameLoader,
    locator: ImageLocator,
    options: LoadOptions,
    dataset: Option<Arc<ParsedDataset>>,
    frame: Option<(FrameDescriptor, Option<ScalingParameters>)>,
    needs_more: bool,
    done: bool,
}

impl UriProgress {
    async fn dataset(&mut self) -> Result<Arc<ParsedDataset>, LoadError> {
        if let Some(dataset) = &self.dataset {
            return Ok(Arc::clone(dataset));
        }
        let uri = self.locator.source_uri();
        let dataset = self
            .loader
            .cache
            .load(uri, Arc::clone(&self.loader.fetcher))
            .await?;
        self.dataset = Some(Arc::clone(&dataset));
        Ok(dataset)
    }

    /// Continue the container through the cache, so frames of one uri
    /// share the fetch.
    async fn fetch_more(&mut self) -> Result<(), LoadError> {
        let dataset = self.dataset().await?;
        let more = self
            .loader
            .cache
            .fetch_more(self.locator.source_uri(), dataset, Arc::clone(&self.loader.fetcher))
            .await?;
        self.dataset = Some(more);
        self.needs_more = false;
        Ok(())
    }

    fn frame_attributes(
        &mut self,
        dataset: &ParsedDataset,
    ) -> Result<(FrameDescriptor, Option<ScalingParameters>), LoadError> {
        if let Some(frame) = &self.frame {
            return Ok(frame.clone());
        }
        let combined = self.loader.multiframe.resolve(
            self.locator.source_uri(),
            dataset.header(),
            self.locator.frame,
        )?;
        let descriptor = FrameDescriptor::from_dataset(&combined)?;
        let scaling = self
            .options
            .scaling
            .clone()
            .or_else(|| {
                let image_id = self.locator.to_string();
                self.loader.metadata.as_ref().and_then(|m| m.scaling(&image_id))
            })
            .unwrap_or_else(|| scaling_from_dataset(&combined));
        let frame = (descriptor, Some(scaling));
        self.frame = Some(frame.clone());
        Ok(frame)
    }
}

async fn next_uri_frame(mut progress: UriProgress) -> Result<Option<(DecodedFrame, UriProgress)>, LoadError> {
    while !progress.done {
        if progress.needs_more {
            progress.fetch_more().await?;
        }
        let dataset = progress.dataset().await?;
        let (descriptor, scaling) = progress.frame_attributes(&dataset)?;
        let frame = dataset.frame_bytes(progress.locator.frame_index(), &descriptor)?;
        let is_final = frame.complete || dataset.is_complete();
        progress.done = is_final;
        progress.needs_more = !is_final;

        if frame.bytes.is_empty() && !is_final {
            continue;
        }
        let percent_complete = match dataset.total_length() {
            _ if is_final => 100.0,
            Some(total) if total > 0 => dataset.byte_len() as f64 / total as f64 * 100.0,
            _ => 0.0,
        };
        let len = frame.bytes.len();
        let payload = CompressedPayload {
            transfer_syntax: dataset.transfer_syntax().to_string(),
            content_type: "application/dicom".to_string(),
            bytes: frame.bytes,
            pixel_range: 0..len,
            is_final,
            status: if is_final {
                DecodeStatus::Complete
            } else {
                DecodeStatus::Lossy
            },
            percent_complete,
            decode_level: 0,
        };
        let decoded = progress
            .loader
            .decode(
                descriptor,
                payload,
                scaling,
                progress.options.target.clone(),
                progress.options.priority,
            )
            .await?;
        if let Some(frame) = decoded {
            return Ok(Some((frame, progress)));
        }
    }
    Ok(None)
}

/// End the stream after the first terminal frame or error.
fn terminate_after_final(
    frames: BoxStream<'static, Result<DecodedFrame, LoadError>>,
    lossy_is_terminal: bool,
) -> BoxStream<'static, Result<DecodedFrame, LoadError>> {
    stream::unfold(Some(frames), move |frames| async move {
        let mut frames = frames?;
        let item = frames.next().await?;
        let terminal = match &item {
            Ok(frame) => {
                frame.status.is_complete() || (lossy_is_terminal && frame.status == DecodeStatus::Lossy)
            }
            Err(_) => true,
        };
        Some((item, (!terminal).then_some(frames)))
    })
    .boxed()
}
