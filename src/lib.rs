//! # DICOM progressive loading library
//!
//! This crate retrieves and decodes single DICOM image frames, yielding
//! increasingly complete versions of a frame while its bytes are still
//! arriving. It builds on the dicom-rs ecosystem for attribute parsing and
//! codec support.
//!
//! Frames are named by image ids of two schemes:
//!  - `wadouri:` a whole Part-10 container, cached and shared between
//!    frames, fetched further while incomplete
//!  - `wadors:` a single frame retrieved by one request, by byte ranges or
//!    by streaming the response
//!
//! Decoding runs on a priority worker pool and dispatches on the transfer
//! syntax of the payload. Native and RLE payloads are decoded in-crate,
//! compressed families go through the dicom-rs pixel data adapters. After
//! decoding, frames carry their value range, are optionally rescaled and
//! are placed into a caller supplied buffer when one is given.
//!
//! # Examples
//!
//! ## Loading a frame from a local file
//!
//! ```no_run
//! # use dicom_progressive::{FrameLoader, LoadOptions, LoaderConfig, transport::FileTransport};
//! # use futures::StreamExt;
//! # use std::sync::Arc;
//! # async fn run() {
//! let loader = FrameLoader::new(LoaderConfig::default(), Arc::new(FileTransport::new()));
//! let mut frames = loader.load_frame("wadouri:file:///data/ct.dcm?frame=1", LoadOptions::default());
//! while let Some(frame) = frames.next().await {
//!     let frame = frame.expect("frame should decode");
//!     println!("{:?} {}..{}", frame.status, frame.min_value, frame.max_value);
//! }
//! # }
//! ```

pub mod cache;
pub mod codec;
pub mod color;
pub mod config;
pub mod dataset;
pub mod dispatcher;
pub mod enums;
pub mod error;
pub mod frame;
pub mod loader;
pub mod locator;
pub mod logging;
pub mod metadata;
pub mod multiframe;
pub mod multipart;
pub mod retrieve;
pub mod streaming;
pub mod task_queue;
pub mod transfer_syntax;
pub mod transport;
pub mod worker_pool;

pub use config::LoaderConfig;
pub use dispatcher::Dispatcher;
pub use enums::{DecodeStatus, RetrievalStrategy, Scheme};
pub use error::{ErrorKind, LoadError};
pub use frame::{CompressedPayload, DecodedFrame, FrameDescriptor, PixelBuffer};
pub use loader::{FrameLoader, LoadOptions};
pub use locator::ImageLocator;
