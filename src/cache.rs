//! Reference-counted cache of parsed containers keyed by source uri.
//!
//! Concurrent loads of one uri share a single in-flight future, so at most
//! one fetch is outstanding per uri. The dataset is stored with one
//! reference per loader that joined before it resolved.

use crate::dataset::{self, DatasetError, DatasetFetcher, FetchMoreOptions, ParsedDataset};
use crate::error::ErrorKind;

use futures::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

impl CacheError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheError::Dataset(error) => error.kind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Loaded { uri: String, bytes: usize },
    Updated { uri: String, bytes: usize },
    Evicted { uri: String },
    Purged { count: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheInfo {
    pub count: usize,
    pub bytes: usize,
}

pub type LoadResult = Result<Arc<ParsedDataset>, CacheError>;

/// Resolves with the dataset once loaded. Clones resolve together.
pub type LoadFuture = Shared<BoxFuture<'static, LoadResult>>;

struct Resident {
    dataset: Arc<ParsedDataset>,
    ref_count: usize,
}

struct InFlight {
    future: LoadFuture,
    joined: usize,
}

#[derive(Default)]
struct Inner {
    resident: HashMap<String, Resident>,
    in_flight: HashMap<String, InFlight>,
    /// Running `fetch_more` continuations of partial datasets.
    continuing: HashMap<String, LoadFuture>,
    bytes: usize,
    /// Bumped by purge so loads started before it are not stored.
    generation: u64,
}

#[derive(Clone)]
pub struct DatasetCache {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<CacheEvent>,
}

impl Default for DatasetCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DatasetCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetCache")
            .field("info", &self.info())
            .finish_non_exhaustive()
    }
}

impl DatasetCache {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::default(),
            events,
        }
    }

    /// Load `uri` through `fetcher`, or join the load already running, or
    /// take the resident dataset. Each call holds one reference.
    pub fn load(&self, uri: &str, fetcher: Arc<dyn DatasetFetcher>) -> LoadFuture {
        let mut inner = self.inner.lock();
        if let Some(resident) = inner.resident.get_mut(uri) {
            resident.ref_count += 1;
            debug!(uri, ref_count = resident.ref_count, "dataset cache hit");
            let dataset = Arc::clone(&resident.dataset);
            return future::ready(Ok(dataset)).boxed().shared();
        }
        if let Some(in_flight) = inner.in_flight.get_mut(uri) {
            in_flight.joined += 1;
            debug!(uri, joined = in_flight.joined, "joined in-flight load");
            return in_flight.future.clone();
        }

        let weak = Arc::downgrade(&self.inner);
        let events = self.events.clone();
        let generation = inner.generation;
        let owned_uri = uri.to_string();
        let future = async move {
            let result = dataset::load(fetcher.as_ref(), &owned_uri)
                .await
                .map(Arc::new)
                .map_err(CacheError::from);
            settle(&weak, &events, &owned_uri, generation, &result);
            result
        }
        .boxed()
        .shared();

        inner.in_flight.insert(
            uri.to_string(),
            InFlight {
                future: future.clone(),
                joined: 1,
            },
        );
        future
    }

    pub fn get(&self, uri: &str) -> Option<Arc<ParsedDataset>> {
        self.inner
            .lock()
            .resident
            .get(uri)
            .map(|resident| Arc::clone(&resident.dataset))
    }

    pub fn ref_count(&self, uri: &str) -> Option<usize> {
        self.inner
            .lock()
            .resident
            .get(uri)
            .map(|resident| resident.ref_count)
    }

    pub fn is_loading(&self, uri: &str) -> bool {
        self.inner.lock().in_flight.contains_key(uri)
    }

    /// Drop one reference; the dataset is evicted when none remain.
    pub fn unload(&self, uri: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(resident) = inner.resident.get_mut(uri) else {
            return false;
        };
        resident.ref_count = resident.ref_count.saturating_sub(1);
        if resident.ref_count > 0 {
            return true;
        }
        if let Some(resident) = inner.resident.remove(uri) {
            inner.bytes = inner.bytes.saturating_sub(resident.dataset.byte_len());
            info!(uri, "dataset evicted");
            self.emit(CacheEvent::Evicted {
                uri: uri.to_string(),
            });
        }
        true
    }

    /// Replace a resident dataset, e.g. after it fetched more bytes. The
    /// reference count is kept. Returns false when `uri` is not resident.
    pub fn update(&self, uri: &str, dataset: Arc<ParsedDataset>) -> bool {
        replace(&mut self.inner.lock(), &self.events, uri, dataset)
    }

    /// Fetch the rest of `current`, the partial dataset of `uri`, and
    /// publish the result. Callers continuing the same uri share one fetch,
    /// and a resident dataset already longer than `current` is returned
    /// without fetching.
    pub fn fetch_more(
        &self,
        uri: &str,
        current: Arc<ParsedDataset>,
        fetcher: Arc<dyn DatasetFetcher>,
    ) -> LoadFuture {
        let mut inner = self.inner.lock();
        if let Some(resident) = inner
            .resident
            .get(uri)
            .filter(|resident| resident.dataset.byte_len() > current.byte_len())
        {
            debug!(uri, bytes = resident.dataset.byte_len(), "dataset already extended");
            return future::ready(Ok(Arc::clone(&resident.dataset))).boxed().shared();
        }
        if let Some(running) = inner.continuing.get(uri) {
            debug!(uri, "joined running continuation");
            return running.clone();
        }

        let weak = Arc::downgrade(&self.inner);
        let events = self.events.clone();
        let generation = inner.generation;
        let owned_uri = uri.to_string();
        let future = async move {
            let result = current
                .fetch_more(fetcher.as_ref(), FetchMoreOptions::default())
                .await
                .map(Arc::new)
                .map_err(CacheError::from);
            if let Some(inner) = weak.upgrade() {
                let mut inner = inner.lock();
                if inner.generation == generation {
                    inner.continuing.remove(&owned_uri);
                    if let Ok(dataset) = &result {
                        if !replace(&mut inner, &events, &owned_uri, Arc::clone(dataset)) {
                            debug!(uri = %owned_uri, "dataset no longer cached, continuing with local copy");
                        }
                    }
                }
            }
            result
        }
        .boxed()
        .shared();

        inner.continuing.insert(uri.to_string(), future.clone());
        future
    }

    /// Drop every dataset regardless of references. Loads still running are
    /// not stored when they finish.
    pub fn purge(&self) {
        let mut inner = self.inner.lock();
        let count = inner.resident.len();
        inner.resident.clear();
        inner.in_flight.clear();
        inner.continuing.clear();
        inner.bytes = 0;
        inner.generation += 1;
        info!(count, "dataset cache purged");
        self.emit(CacheEvent::Purged { count });
    }

    pub fn info(&self) -> CacheInfo {
        let inner = self.inner.lock();
        CacheInfo {
            count: inner.resident.len(),
            bytes: inner.bytes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: CacheEvent) {
        let _ = self.events.send(event);
    }
}

fn replace(
    inner: &mut Inner,
    events: &broadcast::Sender<CacheEvent>,
    uri: &str,
    dataset: Arc<ParsedDataset>,
) -> bool {
    let Some(resident) = inner.resident.get_mut(uri) else {
        return false;
    };
    let bytes = dataset.byte_len();
    let previous = std::mem::replace(&mut resident.dataset, dataset);
    inner.bytes = inner.bytes.saturating_sub(previous.byte_len()) + bytes;
    debug!(uri, bytes, "dataset updated");
    let _ = events.send(CacheEvent::Updated {
        uri: uri.to_string(),
        bytes,
    });
    true
}

/// Store the outcome of a finished load with one reference per joined
/// loader. Failures are not cached.
fn settle(
    inner: &Weak<Mutex<Inner>>,
    events: &broadcast::Sender<CacheEvent>,
    uri: &str,
    generation: u64,
    result: &LoadResult,
) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let mut inner = inner.lock();
    if inner.generation != generation {
        return;
    }
    let Some(in_flight) = inner.in_flight.remove(uri) else {
        return;
    };
    match result {
        Ok(dataset) => {
            inner.bytes += dataset.byte_len();
            inner.resident.insert(
                uri.to_string(),
                Resident {
                    dataset: Arc::clone(dataset),
                    ref_count: in_flight.joined,
                },
            );
            info!(uri, ref_count = in_flight.joined, bytes = dataset.byte_len(), "dataset loaded");
            let _ = events.send(CacheEvent::Loaded {
                uri: uri.to_string(),
                bytes: dataset.byte_len(),
            });
        }
        Err(error) => debug!(uri, %error, "dataset load failed"),
    }
}
