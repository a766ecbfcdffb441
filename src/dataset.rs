//! Part-10 containers that may be only partially downloaded.
//!
//! Parsing runs in two passes. A bounded walk over the raw elements locates
//! the pixel data and checks the header is complete; the `dicom` reader then
//! parses everything before it. The pixel data element is read by the walk
//! itself so that lengths are clamped to the bytes actually present.

use crate::error::ErrorKind;
use crate::frame::FrameDescriptor;
use crate::transfer_syntax::uids;
use crate::transport::{FetchRequest, Transport, TransportError};

use async_trait::async_trait;
use dicom::object::file::ReadPreamble;
use dicom::object::{InMemDicomObject, OpenFileOptions};
use dicom_dictionary_std::tags;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

const PREAMBLE_LEN: usize = 128;
const MAGIC: &[u8] = b"DICM";
const UNDEFINED_LENGTH: u32 = 0xFFFF_FFFF;
const PIXEL_DATA: (u16, u16) = (0x7FE0, 0x0010);
const ITEM: (u16, u16) = (0xFFFE, 0xE000);
const ITEM_DELIMITER: (u16, u16) = (0xFFFE, 0xE00D);
const SEQUENCE_DELIMITER: (u16, u16) = (0xFFFE, 0xE0DD);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DatasetError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{0} is not a DICOM Part-10 file")]
    NotDicom(String),

    #[error("Header of {0} is not complete")]
    IncompleteHeader(String),

    #[error("Failed to parse header of {uri}: {message}")]
    Header { uri: String, message: String },

    #[error("Deflated containers cannot be parsed progressively: {0}")]
    Deflated(String),

    #[error("{0} has no pixel data")]
    NoPixelData(String),

    #[error("Frame {frame} requested, container has {frames}")]
    FrameOutOfRange { frame: usize, frames: u32 },

    #[error("Cannot map {fragments} fragments to {frames} frames without an offset table")]
    AmbiguousFragments { frames: u32, fragments: usize },
}

impl DatasetError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DatasetError::Transport(error) => error.kind(),
            DatasetError::Deflated(_) | DatasetError::FrameOutOfRange { .. } => {
                ErrorKind::Configuration
            }
            _ => ErrorKind::Data,
        }
    }
}

/// One value span of the pixel data. For native pixel data the whole value
/// is a single fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    /// Start of the fragment bytes within the container.
    pub offset: usize,
    /// Bytes present, never more than what was received.
    pub length: usize,
    pub declared_length: u32,
    /// Position of the item header relative to the first fragment, as
    /// referenced by the basic offset table.
    pub item_offset: u32,
}

impl Fragment {
    pub fn is_complete(&self) -> bool {
        self.length as u64 >= self.declared_length as u64
    }

    pub fn span(&self) -> Range<usize> {
        self.offset..self.offset + self.length
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PixelEncoding {
    Native,
    Encapsulated { basic_offset_table: Vec<u32> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelDataElement {
    pub encoding: PixelEncoding,
    pub fragments: Vec<Fragment>,
    /// Every declared byte is present and, when encapsulated, the sequence
    /// delimiter was seen.
    pub complete: bool,
}

impl PixelDataElement {
    pub fn is_encapsulated(&self) -> bool {
        matches!(self.encoding, PixelEncoding::Encapsulated { .. })
    }

    pub fn available_length(&self) -> usize {
        self.fragments.iter().map(|f| f.length).sum()
    }
}

/// Bytes of one frame cut out of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBytes {
    pub bytes: Vec<u8>,
    /// All bytes of the frame are present.
    pub complete: bool,
}

#[derive(Debug, Clone)]
pub struct ParsedDataset {
    uri: String,
    header: InMemDicomObject,
    transfer_syntax: String,
    pixel_data: Option<PixelDataElement>,
    bytes: Vec<u8>,
    total_length: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Encoding {
    explicit: bool,
    big_endian: bool,
}

const EXPLICIT_LE: Encoding = Encoding {
    explicit: true,
    big_endian: false,
};

const IMPLICIT_LE: Encoding = Encoding {
    explicit: false,
    big_endian: false,
};

#[derive(Debug, Clone, Copy)]
struct ElementHeader {
    tag: (u16, u16),
    vr: Option<[u8; 2]>,
    length: u32,
    header_len: usize,
}

/// Outcome of walking a run of elements.
enum Walk<T> {
    Found(T),
    Absent,
    Truncated,
}

fn read_u16(bytes: &[u8], pos: usize, big_endian: bool) -> Option<u16> {
    let raw: [u8; 2] = bytes.get(pos..pos + 2)?.try_into().ok()?;
    Some(if big_endian {
        u16::from_be_bytes(raw)
    } else {
        u16::from_le_bytes(raw)
    })
}

fn read_u32(bytes: &[u8], pos: usize, big_endian: bool) -> Option<u32> {
    let raw: [u8; 4] = bytes.get(pos..pos + 4)?.try_into().ok()?;
    Some(if big_endian {
        u32::from_be_bytes(raw)
    } else {
        u32::from_le_bytes(raw)
    })
}

fn has_long_length(vr: [u8; 2]) -> bool {
    matches!(
        &vr,
        b"OB" | b"OD" | b"OF" | b"OL" | b"OV" | b"OW" | b"SQ" | b"SV" | b"UC" | b"UN" | b"UR"
            | b"UT" | b"UV"
    )
}

fn read_header(bytes: &[u8], pos: usize, encoding: Encoding) -> Option<ElementHeader> {
    let group = read_u16(bytes, pos, encoding.big_endian)?;
    let element = read_u16(bytes, pos + 2, encoding.big_endian)?;
    let tag = (group, element);
    if group == 0xFFFE || !encoding.explicit {
        return Some(ElementHeader {
            tag,
            vr: None,
            length: read_u32(bytes, pos + 4, encoding.big_endian)?,
            header_len: 8,
        });
    }
    let vr: [u8; 2] = bytes.get(pos + 4..pos + 6)?.try_into().ok()?;
    if has_long_length(vr) {
        Some(ElementHeader {
            tag,
            vr: Some(vr),
            length: read_u32(bytes, pos + 8, encoding.big_endian)?,
            header_len: 12,
        })
    } else {
        Some(ElementHeader {
            tag,
            vr: Some(vr),
            length: read_u16(bytes, pos + 6, encoding.big_endian)? as u32,
            header_len: 8,
        })
    }
}

/// Position after the element at `pos`, or `None` if it runs past the end.
fn skip_element(bytes: &[u8], pos: usize, encoding: Encoding) -> Option<usize> {
    let header = read_header(bytes, pos, encoding)?;
    let value_start = pos + header.header_len;
    if header.length != UNDEFINED_LENGTH {
        let end = value_start + header.length as usize;
        return (end <= bytes.len()).then_some(end);
    }
    // Undefined-length UN content is implicit little endian.
    let nested = match header.vr {
        Some(vr) if &vr == b"UN" => IMPLICIT_LE,
        _ => encoding,
    };
    skip_sequence(bytes, value_start, nested)
}

fn skip_sequence(bytes: &[u8], mut pos: usize, encoding: Encoding) -> Option<usize> {
    loop {
        let item = read_header(bytes, pos, encoding)?;
        match item.tag {
            SEQUENCE_DELIMITER => return Some(pos + 8),
            ITEM if item.length != UNDEFINED_LENGTH => {
                pos += 8 + item.length as usize;
                if pos > bytes.len() {
                    return None;
                }
            }
            ITEM => {
                pos += 8;
                loop {
                    let element = read_header(bytes, pos, encoding)?;
                    if element.tag == ITEM_DELIMITER {
                        pos += 8;
                        break;
                    }
                    pos = skip_element(bytes, pos, encoding)?;
                }
            }
            _ => return None,
        }
    }
}

/// File meta information: the transfer syntax and where the data set
/// starts.
fn read_meta(uri: &str, bytes: &[u8]) -> Result<(String, usize), DatasetError> {
    if bytes.len() < PREAMBLE_LEN + MAGIC.len() {
        return Err(DatasetError::IncompleteHeader(uri.to_string()));
    }
    if &bytes[PREAMBLE_LEN..PREAMBLE_LEN + MAGIC.len()] != MAGIC {
        return Err(DatasetError::NotDicom(uri.to_string()));
    }
    let mut pos = PREAMBLE_LEN + MAGIC.len();
    let mut transfer_syntax = None;
    loop {
        let Some(header) = read_header(bytes, pos, EXPLICIT_LE) else {
            return Err(DatasetError::IncompleteHeader(uri.to_string()));
        };
        if header.tag.0 != 0x0002 {
            break;
        }
        let value = pos + header.header_len..pos + header.header_len + header.length as usize;
        let Some(raw) = bytes.get(value.clone()) else {
            return Err(DatasetError::IncompleteHeader(uri.to_string()));
        };
        if header.tag == (0x0002, 0x0010) {
            let uid = String::from_utf8_lossy(raw);
            transfer_syntax = Some(uid.trim_end_matches(['\0', ' ']).to_string());
        }
        pos = value.end;
    }
    let transfer_syntax = transfer_syntax.ok_or_else(|| DatasetError::Header {
        uri: uri.to_string(),
        message: "missing transfer syntax".to_string(),
    })?;
    Ok((transfer_syntax, pos))
}

/// Walk top-level elements to the pixel data.
fn locate_pixel_data(bytes: &[u8], mut pos: usize, encoding: Encoding) -> Walk<(usize, ElementHeader)> {
    loop {
        if pos >= bytes.len() {
            return Walk::Absent;
        }
        let Some(header) = read_header(bytes, pos, encoding) else {
            return Walk::Truncated;
        };
        if header.tag == PIXEL_DATA {
            return Walk::Found((pos, header));
        }
        if header.tag > PIXEL_DATA {
            return Walk::Absent;
        }
        match skip_element(bytes, pos, encoding) {
            Some(next) => pos = next,
            None => return Walk::Truncated,
        }
    }
}

/// Read the pixel data element at `pos`, clamping every length to the
/// bytes present.
fn read_pixel_data(bytes: &[u8], pos: usize, header: ElementHeader, encoding: Encoding) -> PixelDataElement {
    let value_start = pos + header.header_len;
    if header.length != UNDEFINED_LENGTH {
        let length = (header.length as usize).min(bytes.len().saturating_sub(value_start));
        let fragment = Fragment {
            offset: value_start,
            length,
            declared_length: header.length,
            item_offset: 0,
        };
        return PixelDataElement {
            encoding: PixelEncoding::Native,
            complete: fragment.is_complete(),
            fragments: vec![fragment],
        };
    }

    let mut basic_offset_table = Vec::new();
    let mut fragments = Vec::new();
    let mut complete = false;
    let mut cursor = value_start;
    let mut first_fragment = None;

    while let Some(item) = read_header(bytes, cursor, encoding) {
        if item.tag == SEQUENCE_DELIMITER {
            complete = true;
            break;
        }
        if item.tag != ITEM || item.length == UNDEFINED_LENGTH {
            warn!(tag = ?item.tag, "unexpected element in pixel data sequence");
            break;
        }
        let data_start = cursor + 8;
        let length = (item.length as usize).min(bytes.len().saturating_sub(data_start));
        if cursor == value_start {
            basic_offset_table = bytes[data_start..data_start + length]
                .chunks_exact(4)
                .filter_map(|raw| read_u32(raw, 0, encoding.big_endian))
                .collect();
        } else {
            let first = *first_fragment.get_or_insert(cursor);
            fragments.push(Fragment {
                offset: data_start,
                length,
                declared_length: item.length,
                item_offset: (cursor - first) as u32,
            });
        }
        if length < item.length as usize {
            break;
        }
        cursor = data_start + length;
    }

    PixelDataElement {
        encoding: PixelEncoding::Encapsulated { basic_offset_table },
        fragments,
        complete,
    }
}

impl ParsedDataset {
    /// Parse `bytes`, the first part (or all) of a container whose full
    /// length is `total_length` when known.
    pub fn parse(uri: &str, bytes: Vec<u8>, total_length: Option<u64>) -> Result<Self, DatasetError> {
        let (transfer_syntax, dataset_start) = read_meta(uri, &bytes)?;
        let encoding = match transfer_syntax.as_str() {
            uids::IMPLICIT_VR_LITTLE_ENDIAN => IMPLICIT_LE,
            uids::EXPLICIT_VR_BIG_ENDIAN => Encoding {
                explicit: true,
                big_endian: true,
            },
            uids::DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN => {
                return Err(DatasetError::Deflated(uri.to_string()));
            }
            _ => EXPLICIT_LE,
        };

        let (header_end, pixel_data) = match locate_pixel_data(&bytes, dataset_start, encoding) {
            Walk::Found((pos, header)) => (pos, Some(read_pixel_data(&bytes, pos, header, encoding))),
            Walk::Absent if total_length.is_some_and(|total| (bytes.len() as u64) < total) => {
                return Err(DatasetError::IncompleteHeader(uri.to_string()));
            }
            Walk::Absent => (bytes.len(), None),
            Walk::Truncated => return Err(DatasetError::IncompleteHeader(uri.to_string())),
        };

        let object = OpenFileOptions::new()
            .read_until(tags::PIXEL_DATA)
            .read_preamble(ReadPreamble::Never)
            .from_reader(&bytes[PREAMBLE_LEN..header_end])
            .map_err(|error| DatasetError::Header {
                uri: uri.to_string(),
                message: error.to_string(),
            })?;

        let dataset = Self {
            uri: uri.to_string(),
            header: object.into_inner(),
            transfer_syntax,
            pixel_data,
            bytes,
            total_length,
        };
        debug!(
            uri,
            bytes = dataset.bytes.len(),
            total = ?dataset.total_length,
            pixel_bytes = dataset.pixel_data.as_ref().map(PixelDataElement::available_length),
            complete = dataset.is_complete(),
            "dataset parsed"
        );
        Ok(dataset)
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn header(&self) -> &InMemDicomObject {
        &self.header
    }

    pub fn transfer_syntax(&self) -> &str {
        &self.transfer_syntax
    }

    pub fn pixel_data(&self) -> Option<&PixelDataElement> {
        self.pixel_data.as_ref()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn total_length(&self) -> Option<u64> {
        self.total_length
    }

    /// Bytes of the container not yet received.
    pub fn remaining(&self) -> u64 {
        self.total_length
            .map_or(0, |total| total.saturating_sub(self.bytes.len() as u64))
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    pub fn number_of_frames(&self) -> u32 {
        self.header
            .element(tags::NUMBER_OF_FRAMES)
            .ok()
            .and_then(|element| element.to_int::<u32>().ok())
            .unwrap_or(1)
            .max(1)
    }

    /// Bytes of the 0-based frame `index`. A frame that has not started to
    /// arrive yields empty, incomplete bytes.
    pub fn frame_bytes(&self, index: usize, descriptor: &FrameDescriptor) -> Result<FrameBytes, DatasetError> {
        let frames = self.number_of_frames();
        if index >= frames as usize {
            return Err(DatasetError::FrameOutOfRange {
                frame: index + 1,
                frames,
            });
        }
        let pixel_data = self
            .pixel_data
            .as_ref()
            .ok_or_else(|| DatasetError::NoPixelData(self.uri.clone()))?;

        match &pixel_data.encoding {
            PixelEncoding::Native => Ok(self.native_frame(pixel_data, index, descriptor)),
            PixelEncoding::Encapsulated { basic_offset_table } => {
                self.encapsulated_frame(pixel_data, basic_offset_table, index, frames)
            }
        }
    }

    fn native_frame(&self, pixel_data: &PixelDataElement, index: usize, descriptor: &FrameDescriptor) -> FrameBytes {
        let Some(value) = pixel_data.fragments.first() else {
            return FrameBytes {
                bytes: Vec::new(),
                complete: false,
            };
        };
        let available = &self.bytes[value.span()];

        if descriptor.bits_allocated == 1 {
            let bits = descriptor.sample_count();
            let start_bit = index * bits;
            let end_byte = (start_bit + bits).div_ceil(8);
            return FrameBytes {
                bytes: extract_bits(available, start_bit, bits),
                complete: end_byte <= available.len(),
            };
        }

        let frame_size = descriptor.frame_size_bytes();
        let start = (index * frame_size).min(available.len());
        let end = ((index + 1) * frame_size).min(available.len());
        FrameBytes {
            bytes: available[start..end].to_vec(),
            complete: end - start == frame_size,
        }
    }

    fn encapsulated_frame(
        &self,
        pixel_data: &PixelDataElement,
        basic_offset_table: &[u32],
        index: usize,
        frames: u32,
    ) -> Result<FrameBytes, DatasetError> {
        let fragments = &pixel_data.fragments;
        let selected: Vec<&Fragment> = if frames == 1 {
            fragments.iter().collect()
        } else if !basic_offset_table.is_empty() {
            let start = basic_offset_table.get(index).copied().unwrap_or(u32::MAX);
            let end = basic_offset_table.get(index + 1).copied().unwrap_or(u32::MAX);
            fragments
                .iter()
                .filter(|f| f.item_offset >= start && f.item_offset < end)
                .collect()
        } else if fragments.len() == frames as usize || !pixel_data.complete {
            fragments.get(index).into_iter().collect()
        } else {
            return Err(DatasetError::AmbiguousFragments {
                frames,
                fragments: fragments.len(),
            });
        };

        // Whole once the last fragment is complete and a later item or the
        // delimiter shows nothing else belongs to it.
        let complete = selected.last().is_some_and(|last| {
            last.is_complete()
                && (pixel_data.complete || fragments.iter().any(|f| f.item_offset > last.item_offset))
        });
        let bytes = selected
            .iter()
            .flat_map(|fragment| self.bytes[fragment.span()].iter().copied())
            .collect();
        Ok(FrameBytes { bytes, complete })
    }

    /// Fetch up to `options.max_bytes` more bytes (all remaining by default)
    /// and parse again.
    pub async fn fetch_more(
        &self,
        fetcher: &dyn DatasetFetcher,
        options: FetchMoreOptions,
    ) -> Result<ParsedDataset, DatasetError> {
        let remaining = self.remaining();
        if remaining == 0 {
            return Ok(self.clone());
        }
        let consumed = self.bytes.len() as u64;
        let wanted = options.max_bytes.map_or(remaining, |max| max.clamp(1, remaining));
        let fetched = fetcher
            .fetch(&self.uri, Some(consumed..consumed + wanted))
            .await?;
        debug!(uri = %self.uri, consumed, fetched = fetched.bytes.len(), remaining, "fetched more");

        let mut bytes = self.bytes.clone();
        bytes.extend_from_slice(&fetched.bytes);
        ParsedDataset::parse(&self.uri, bytes, self.total_length.max(fetched.total_length))
    }
}

/// Copy `count` bits starting at bit `start` (least significant first) into
/// a fresh, byte-aligned buffer. Missing bits read as zero.
fn extract_bits(bytes: &[u8], start: usize, count: usize) -> Vec<u8> {
    if start % 8 == 0 {
        let from = (start / 8).min(bytes.len());
        let to = (from + count.div_ceil(8)).min(bytes.len());
        return bytes[from..to].to_vec();
    }
    let mut out = vec![0u8; count.div_ceil(8)];
    for bit in 0..count {
        let source = start + bit;
        let set = bytes
            .get(source / 8)
            .is_some_and(|byte| (byte >> (source % 8)) & 1 == 1);
        if set {
            out[bit / 8] |= 1 << (bit % 8);
        }
    }
    out
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchMoreOptions {
    /// Upper bound on the bytes to request.
    pub max_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedBytes {
    pub bytes: Vec<u8>,
    pub total_length: Option<u64>,
}

/// Source of container bytes.
#[async_trait]
pub trait DatasetFetcher: Send + Sync + fmt::Debug {
    /// Fetch `range` of `uri`, or the initial part when `range` is `None`.
    async fn fetch(&self, uri: &str, range: Option<Range<u64>>) -> Result<FetchedBytes, DatasetError>;
}

/// Fetches containers through a [`Transport`]. With `initial_bytes` set the
/// first request only asks for that many bytes.
#[derive(Debug, Clone)]
pub struct TransportFetcher {
    transport: Arc<dyn Transport>,
    initial_bytes: Option<u64>,
}

impl TransportFetcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            initial_bytes: None,
        }
    }

    pub fn with_initial_bytes(mut self, initial_bytes: u64) -> Self {
        self.initial_bytes = Some(initial_bytes.max(1));
        self
    }
}

#[async_trait]
impl DatasetFetcher for TransportFetcher {
    async fn fetch(&self, uri: &str, range: Option<Range<u64>>) -> Result<FetchedBytes, DatasetError> {
        let mut request = FetchRequest::new(uri).with_accept("application/dicom");
        if let Some(range) = range.or_else(|| self.initial_bytes.map(|bytes| 0..bytes)) {
            request = request.with_range(range);
        }
        let response = self.transport.fetch(&request).await?;
        let total_length = response.total_length();
        Ok(FetchedBytes {
            bytes: response.body,
            total_length,
        })
    }
}

/// Fetch and parse a container. When the header does not fit into the
/// first response, further ranges are fetched until it does.
pub async fn load(fetcher: &dyn DatasetFetcher, uri: &str) -> Result<ParsedDataset, DatasetError> {
    let fetched = fetcher.fetch(uri, None).await?;
    let mut bytes = fetched.bytes;
    let mut total_length = fetched.total_length;

    loop {
        match ParsedDataset::parse(uri, bytes.clone(), total_length) {
            Err(DatasetError::IncompleteHeader(_))
                if total_length.is_some_and(|total| (bytes.len() as u64) < total) =>
            {
                let consumed = bytes.len() as u64;
                let total = total_length.unwrap_or(consumed);
                let wanted = consumed.max(1).min(total - consumed);
                debug!(uri, consumed, wanted, "header incomplete, fetching more");
                let more = fetcher.fetch(uri, Some(consumed..consumed + wanted)).await?;
                if more.bytes.is_empty() {
                    return Err(DatasetError::IncompleteHeader(uri.to_string()));
                }
                bytes.extend_from_slice(&more.bytes);
                total_length = total_length.max(more.total_length);
            }
            result => return result,
        }
    }
}
