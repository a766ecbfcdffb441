mod support;

use dicom_progressive::config::{LoaderConfig, PoolConfig};
use dicom_progressive::frame::{FrameDescriptor, PixelBuffer, ScalingParameters};
use dicom_progressive::metadata::{ImageMetadata, ImagePlane, StaticMetadataProvider};
use dicom_progressive::transport::{FileTransport, MemoryTransport};
use dicom_progressive::{DecodeStatus, DecodedFrame, ErrorKind, FrameLoader, LoadError, LoadOptions};
use futures::StreamExt;
use std::io::Write;
use std::sync::Arc;

const WADOURI: &str = "https://pacs/wado?requestType=WADO&objectUID=1";
const WADORS: &str = "https://pacs/studies/1/series/2/instances/3";

fn config() -> LoaderConfig {
    LoaderConfig {
        pool: PoolConfig {
            max_workers: 2,
            start_workers_on_demand: true,
        },
        ..LoaderConfig::default()
    }
}

async fn frames(loader: &FrameLoader, image_id: &str) -> Vec<Result<DecodedFrame, LoadError>> {
    loader.load_frame(image_id, LoadOptions::default()).collect().await
}

#[tokio::test]
async fn wadouri_frame_refines_until_complete() {
    let pixels: Vec<u8> = (1..=16).collect();
    let file = support::native_file(4, 4, 1, pixels.clone());
    let transport = MemoryTransport::new();
    transport.insert(WADOURI, "application/dicom", file.clone());

    let mut config = config();
    config.retrieve.range_requests = true;
    config.retrieve.initial_bytes = (file.len() - 8) as u64;
    let loader = FrameLoader::new(config, Arc::new(transport.clone()));

    let image_id = format!("wadouri:{WADOURI}&frame=1");
    let frames: Vec<_> = frames(&loader, &image_id)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].status, DecodeStatus::Lossy);
    assert!(frames[0].percent_complete < 100.0);
    let mut partial = pixels[..8].to_vec();
    partial.extend([0; 8]);
    assert_eq!(frames[0].pixels, PixelBuffer::U8(partial));

    assert_eq!(frames[1].status, DecodeStatus::Complete);
    assert_eq!(frames[1].pixels, PixelBuffer::U8(pixels));
    assert_eq!((frames[1].min_value, frames[1].max_value), (1.0, 16.0));
    assert_eq!(transport.request_count(), 2);

    let uri = WADOURI;
    assert_eq!(loader.cache().ref_count(uri), Some(1));
    assert!(loader.cache().get(uri).unwrap().is_complete());
    assert!(loader.release(&image_id));
    assert!(loader.cache().get(uri).is_none());
    loader.shutdown();
}

#[tokio::test]
async fn wadouri_frames_share_the_cached_container() {
    let pixels: Vec<u8> = (0..8).collect();
    let file = support::native_file(2, 2, 2, pixels);
    let transport = MemoryTransport::new();
    transport.insert(WADOURI, "application/dicom", file);
    let loader = FrameLoader::new(config(), Arc::new(transport.clone()));

    let first = frames(&loader, &format!("wadouri:{WADOURI}&frame=1")).await;
    let second = frames(&loader, &format!("wadouri:{WADOURI}&frame=2")).await;

    let second = second.into_iter().next().unwrap().unwrap();
    assert_eq!(second.status, DecodeStatus::Complete);
    assert_eq!(second.pixels, PixelBuffer::U8(vec![4, 5, 6, 7]));
    assert!(first[0].is_ok());
    assert_eq!(transport.request_count(), 1);
    assert_eq!(loader.cache().ref_count(WADOURI), Some(2));

    let missing = frames(&loader, &format!("wadouri:{WADOURI}&frame=3")).await;
    let error = missing[0].as_ref().unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Configuration);
    loader.shutdown();
}

#[tokio::test]
async fn concurrent_frames_share_one_continuation() {
    let pixels: Vec<u8> = (1..=32).collect();
    let file = support::native_file(4, 4, 2, pixels.clone());
    let transport = MemoryTransport::new();
    transport.insert(WADOURI, "application/dicom", file.clone());

    let mut config = config();
    config.retrieve.range_requests = true;
    // Frame 1 is cut short and frame 2 is missing entirely.
    config.retrieve.initial_bytes = (file.len() - 20) as u64;
    let loader = FrameLoader::new(config, Arc::new(transport.clone()));

    let uri1 = format!("wadouri:{WADOURI}&frame=1");
    let uri2 = format!("wadouri:{WADOURI}&frame=2");
    let (first, second) = futures::join!(frames(&loader, &uri1), frames(&loader, &uri2));
    let first = first.last().unwrap().as_ref().unwrap();
    let second = second.last().unwrap().as_ref().unwrap();
    assert_eq!(first.status, DecodeStatus::Complete);
    assert_eq!(first.pixels, PixelBuffer::U8(pixels[..16].to_vec()));
    assert_eq!(second.status, DecodeStatus::Complete);
    assert_eq!(second.pixels, PixelBuffer::U8(pixels[16..].to_vec()));

    assert_eq!(transport.request_count(), 2);
    assert!(loader.cache().get(WADOURI).unwrap().is_complete());
    loader.shutdown();
}

#[tokio::test]
async fn wadouri_rle_frame_decodes() {
    let first = support::rle_frame(&[10, 20, 30, 40]);
    let second = support::rle_frame(&[50, 60, 70, 80]);
    let offsets = vec![0, 8 + first.len() as u32];
    let file = support::rle_file(2, 2, 2, offsets, vec![first, second]);
    let transport = MemoryTransport::new();
    transport.insert(WADOURI, "application/dicom", file);
    let loader = FrameLoader::new(config(), Arc::new(transport));

    let frames = frames(&loader, &format!("wadouri:{WADOURI}&frame=2")).await;
    assert_eq!(frames.len(), 1);
    let frame = frames[0].as_ref().unwrap();
    assert_eq!(frame.pixels, PixelBuffer::U8(vec![50, 60, 70, 80]));
    assert_eq!(frame.transfer_syntax, support::RLE);
    loader.shutdown();
}

fn rs_metadata(image_id: &str) -> Arc<StaticMetadataProvider> {
    let provider = StaticMetadataProvider::new();
    provider.insert(
        image_id,
        ImageMetadata {
            descriptor: FrameDescriptor::monochrome(2, 2, 8, 8),
            plane: ImagePlane::default(),
            scaling: ScalingParameters::linear(2.0, -1.0),
            transfer_syntax: Some(support::EXPLICIT_LE.to_string()),
        },
    );
    Arc::new(provider)
}

#[tokio::test]
async fn wadors_frame_is_decoded_and_rescaled() {
    let url = format!("{WADORS}/frames/1");
    let transport = MemoryTransport::new();
    transport.insert(
        &url,
        support::MULTIPART_TYPE,
        support::multipart(support::EXPLICIT_LE, &[1, 2, 3, 4]),
    );
    let image_id = format!("wadors:{url}");
    let mut config = config();
    config.decode.pre_scale.enabled = true;
    let loader = FrameLoader::new(config, Arc::new(transport)).with_metadata(rs_metadata(&image_id));

    let frames = frames(&loader, &image_id).await;
    assert_eq!(frames.len(), 1);
    let frame = frames[0].as_ref().unwrap();
    assert_eq!(frame.status, DecodeStatus::Complete);
    assert!(frame.scaling.applied);
    assert_eq!((frame.min_value, frame.max_value), (1.0, 4.0));
    assert_eq!((frame.scaling.min_after, frame.scaling.max_after), (1.0, 7.0));
    assert_eq!(frame.pixels, PixelBuffer::U8(vec![1, 3, 5, 7]));
    loader.shutdown();
}

#[tokio::test]
async fn wadors_byte_ranges_end_with_a_complete_frame() {
    let url = format!("{WADORS}/frames/1");
    let data: Vec<u8> = (0..=255).collect();
    let transport = MemoryTransport::new();
    transport.insert(
        &url,
        support::MULTIPART_TYPE,
        support::multipart(support::EXPLICIT_LE, &data),
    );
    let image_id = format!("wadors:{url}");
    let provider = StaticMetadataProvider::new();
    provider.insert(
        image_id.as_str(),
        ImageMetadata {
            descriptor: FrameDescriptor::monochrome(16, 16, 8, 8),
            plane: ImagePlane::default(),
            scaling: ScalingParameters::linear(1.0, 0.0),
            transfer_syntax: None,
        },
    );
    let mut config = config();
    config.retrieve.range_requests = true;
    config.retrieve.initial_bytes = 150;
    config.retrieve.total_ranges = 3;
    let loader = FrameLoader::new(config, Arc::new(transport)).with_metadata(Arc::new(provider));

    let frames: Vec<_> = frames(&loader, &image_id)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    assert!(frames.len() >= 2);
    assert!(frames.windows(2).all(|w| w[0].status <= w[1].status));
    let last = frames.last().unwrap();
    assert_eq!(last.status, DecodeStatus::Complete);
    assert_eq!(last.pixels, PixelBuffer::U8(data));
    loader.shutdown();
}

#[tokio::test]
async fn undecodable_intermediate_is_skipped() {
    let url = format!("{WADORS}/frames/1");
    let samples: Vec<u8> = (0..64).collect();
    let transport = MemoryTransport::new();
    transport.insert(
        &url,
        support::MULTIPART_TYPE,
        support::multipart(support::RLE, &support::rle_frame(&samples)),
    );
    let image_id = format!("wadors:{url}");
    let provider = StaticMetadataProvider::new();
    provider.insert(
        image_id.as_str(),
        ImageMetadata {
            descriptor: FrameDescriptor::monochrome(8, 8, 8, 8),
            plane: ImagePlane::default(),
            scaling: ScalingParameters::linear(1.0, 0.0),
            transfer_syntax: Some(support::RLE.to_string()),
        },
    );
    let mut config = config();
    config.retrieve.range_requests = true;
    // The first range ends inside the RLE header.
    config.retrieve.initial_bytes = 120;
    config.retrieve.total_ranges = 2;
    let loader = FrameLoader::new(config, Arc::new(transport)).with_metadata(Arc::new(provider));

    let frames = frames(&loader, &image_id).await;
    assert_eq!(frames.len(), 1);
    let frame = frames[0].as_ref().unwrap();
    assert_eq!(frame.status, DecodeStatus::Complete);
    assert_eq!(frame.pixels, PixelBuffer::U8(samples));
    let stats = loader.pool().stats();
    assert_eq!((stats.failed, stats.completed), (1, 1));
    loader.shutdown();
}

#[tokio::test]
async fn wadors_without_metadata_is_rejected() {
    let loader = FrameLoader::new(config(), Arc::new(MemoryTransport::new()));
    let frames = frames(&loader, &format!("wadors:{WADORS}/frames/1")).await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].as_ref().unwrap_err().kind(), ErrorKind::Configuration);
    loader.shutdown();
}

#[tokio::test]
async fn unknown_scheme_is_a_configuration_error() {
    let loader = FrameLoader::new(config(), Arc::new(MemoryTransport::new()));
    let frames = frames(&loader, "dicomfile:/tmp/x.dcm").await;
    assert_eq!(frames[0].as_ref().unwrap_err().kind(), ErrorKind::Configuration);
    assert!(!loader.release("dicomfile:/tmp/x.dcm"));
    loader.shutdown();
}

#[tokio::test]
async fn local_files_load_through_file_transport() {
    let pixels: Vec<u8> = (100..116).collect();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&support::native_file(4, 4, 1, pixels.clone())).unwrap();
    let image_id = format!("wadouri:file://{}", file.path().display());

    let mut config = config();
    config.retrieve.range_requests = true;
    config.retrieve.initial_bytes = 256;
    let loader = FrameLoader::new(config, Arc::new(FileTransport::new()));

    let frames = frames(&loader, &image_id).await;
    let last = frames.last().unwrap().as_ref().unwrap();
    assert_eq!(last.status, DecodeStatus::Complete);
    assert_eq!(last.pixels, PixelBuffer::U8(pixels));
    loader.shutdown();
}
