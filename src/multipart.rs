//! Locating the pixel bytes inside a `multipart/related` response body.
//!
//! A part is `--<boundary>\r\n`, header lines, a blank line, the raw bytes
//! and then `\r\n--<boundary>`. Bodies that are not multipart are taken
//! whole.

use crate::error::ErrorKind;

use std::ops::Range;
use thiserror::Error;

const HEADER_END: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MultipartError {
    #[error("Multipart body has no boundary")]
    MissingBoundary,

    #[error("Multipart part headers are not terminated")]
    UnterminatedHeaders,

    #[error("Multipart part is not terminated by boundary {0}")]
    MissingTerminator(String),
}

impl MultipartError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Data
    }
}

/// Location of the pixel bytes within an accumulated body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedPart {
    pub content_type: String,
    pub transfer_syntax: Option<String>,
    pub range: Range<usize>,
    /// The closing boundary was seen, so the part is complete regardless of
    /// how much of the resource is known to remain.
    pub terminated: bool,
}

/// Find the pixel-bearing part of `body`.
///
/// Returns `Ok(None)` while a non-final body has not yet reached the end of
/// the part headers. A final body must carry its closing boundary.
pub fn extract(
    content_type: Option<&str>,
    body: &[u8],
    is_final: bool,
) -> Result<Option<ExtractedPart>, MultipartError> {
    let declared = content_type.unwrap_or_default();
    let is_multipart = declared.to_ascii_lowercase().starts_with("multipart/")
        || (content_type.is_none() && body.starts_with(b"--"));
    if !is_multipart {
        return Ok(Some(ExtractedPart {
            content_type: media_type(declared).unwrap_or("application/octet-stream").to_string(),
            transfer_syntax: parameter(declared, "transfer-syntax"),
            range: 0..body.len(),
            terminated: false,
        }));
    }

    let boundary = match parameter(declared, "boundary").or_else(|| boundary_from_body(body)) {
        Some(boundary) => boundary,
        None if is_final => return Err(MultipartError::MissingBoundary),
        None => return Ok(None),
    };

    let Some(header_end) = find(body, HEADER_END, 0) else {
        return if is_final {
            Err(MultipartError::UnterminatedHeaders)
        } else {
            Ok(None)
        };
    };
    let headers = String::from_utf8_lossy(&body[..header_end]);
    let part_type = headers
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-type"))
        .map(|(_, value)| value.trim().to_string())
        .unwrap_or_default();

    let data_start = header_end + HEADER_END.len();
    let terminator = format!("\r\n--{boundary}");
    let (data_end, terminated) = match find(body, terminator.as_bytes(), data_start) {
        Some(end) => (end, true),
        None if is_final => return Err(MultipartError::MissingTerminator(boundary)),
        None => (body.len(), false),
    };

    Ok(Some(ExtractedPart {
        content_type: media_type(&part_type)
            .unwrap_or("application/octet-stream")
            .to_string(),
        transfer_syntax: parameter(&part_type, "transfer-syntax")
            .or_else(|| parameter(declared, "transfer-syntax")),
        range: data_start..data_end,
        terminated,
    }))
}

fn media_type(value: &str) -> Option<&str> {
    value
        .split(';')
        .next()
        .map(str::trim)
        .filter(|media| !media.is_empty())
}

/// Value of a `; name=value` parameter, unquoted.
pub fn parameter(value: &str, name: &str) -> Option<String> {
    value.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim().trim_matches('"').to_string())
    })
}

fn boundary_from_body(body: &[u8]) -> Option<String> {
    let line_end = find(body, b"\r\n", 0)?;
    let line = body[..line_end].strip_prefix(b"--")?;
    std::str::from_utf8(line)
        .ok()
        .map(str::trim)
        .filter(|boundary| !boundary.is_empty())
        .map(str::to_string)
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|position| from + position)
}
