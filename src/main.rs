use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dicom_progressive::{
    FrameLoader, LoadOptions, LoaderConfig, logging::init_logging, transport::FileTransport,
};
use futures::StreamExt;
use tracing::info;

/// Load one frame of a local Part-10 file progressively and report every
/// intermediate result.
#[derive(Debug, Parser)]
#[command(name = "dicom-progressive", version)]
struct Args {
    /// Part-10 file to read
    file: PathBuf,

    /// 1-based frame number
    #[arg(long, default_value_t = 1)]
    frame: u32,

    /// Bytes read before the first decode attempt; reads the whole file when absent
    #[arg(long)]
    initial_bytes: Option<u64>,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => LoaderConfig::from_path(path)?,
        None => LoaderConfig::default(),
    };
    if let Some(initial_bytes) = args.initial_bytes {
        config.retrieve.range_requests = true;
        config.retrieve.initial_bytes = initial_bytes;
    }
    config.validate()?;
    init_logging(&config.logging);

    let absolute = std::path::absolute(&args.file)?;
    let image_id = format!("wadouri:file://{}?frame={}", absolute.display(), args.frame);
    let loader = FrameLoader::new(config, Arc::new(FileTransport::new()));

    let mut frames = loader.load_frame(&image_id, LoadOptions::default());
    while let Some(frame) = frames.next().await {
        let frame = frame?;
        info!(
            status = ?frame.status,
            percent = frame.percent_complete,
            rows = frame.descriptor.rows,
            columns = frame.descriptor.columns,
            min = frame.min_value,
            max = frame.max_value,
            elapsed = ?frame.decode_duration,
            "frame decoded"
        );
        println!(
            "{:?} {:.0}% {}x{} [{}, {}]",
            frame.status,
            frame.percent_complete,
            frame.descriptor.columns,
            frame.descriptor.rows,
            frame.min_value,
            frame.max_value
        );
    }
    loader.release(&image_id);
    loader.shutdown();
    Ok(())
}
