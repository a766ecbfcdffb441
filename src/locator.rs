//! Image ids: `wadouri:<url>[?frame=N]` and `wadors:<url>/frames/N`.

use crate::enums::Scheme;
use crate::error::ErrorKind;

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LocatorError {
    #[error("Unknown image id scheme in {0}")]
    UnknownScheme(String),

    #[error("Invalid frame number in {0}")]
    InvalidFrame(String),

    #[error("Empty url in {0}")]
    EmptyUrl(String),
}

impl LocatorError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageLocator {
    pub scheme: Scheme,
    /// Url handed to the transport.
    pub url: String,
    /// 1-based frame number.
    pub frame: u32,
}

impl ImageLocator {
    pub fn parse(image_id: &str) -> Result<Self, LocatorError> {
        if let Some(rest) = image_id.strip_prefix("wadouri:") {
            Self::parse_wadouri(image_id, rest)
        } else if let Some(rest) = image_id.strip_prefix("wadors:") {
            Self::parse_wadors(image_id, rest)
        } else {
            Err(LocatorError::UnknownScheme(image_id.to_string()))
        }
    }

    fn parse_wadouri(image_id: &str, rest: &str) -> Result<Self, LocatorError> {
        let (base, query) = match rest.split_once('?') {
            Some((base, query)) => (base, Some(query)),
            None => (rest, None),
        };
        if base.is_empty() {
            return Err(LocatorError::EmptyUrl(image_id.to_string()));
        }

        let mut frame = 1;
        let mut kept = Vec::new();
        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            match pair.strip_prefix("frame=") {
                Some(value) => frame = parse_frame(image_id, value)?,
                None if !pair.is_empty() => kept.push(pair),
                None => {}
            }
        }
        let url = if kept.is_empty() {
            base.to_string()
        } else {
            format!("{base}?{}", kept.join("&"))
        };
        Ok(Self {
            scheme: Scheme::WadoUri,
            url,
            frame,
        })
    }

    fn parse_wadors(image_id: &str, rest: &str) -> Result<Self, LocatorError> {
        if rest.is_empty() {
            return Err(LocatorError::EmptyUrl(image_id.to_string()));
        }
        let frame = match rest.rsplit_once("/frames/") {
            Some((_, value)) => parse_frame(image_id, value)?,
            None => 1,
        };
        Ok(Self {
            scheme: Scheme::WadoRs,
            url: rest.to_string(),
            frame,
        })
    }

    /// Key identifying the container the frame lives in.
    pub fn source_uri(&self) -> &str {
        match self.scheme {
            Scheme::WadoUri => &self.url,
            Scheme::WadoRs => self
                .url
                .rsplit_once("/frames/")
                .map(|(instance, _)| instance)
                .unwrap_or(&self.url),
        }
    }

    /// 0-based frame index.
    pub fn frame_index(&self) -> usize {
        self.frame.saturating_sub(1) as usize
    }
}

fn parse_frame(image_id: &str, value: &str) -> Result<u32, LocatorError> {
    match value.trim_end_matches('/').parse::<u32>() {
        Ok(frame) if frame >= 1 => Ok(frame),
        _ => Err(LocatorError::InvalidFrame(image_id.to_string())),
    }
}

impl FromStr for ImageLocator {
    type Err = LocatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Scheme::WadoUri => {
                let separator = if self.url.contains('?') { '&' } else { '?' };
                write!(f, "wadouri:{}{separator}frame={}", self.url, self.frame)
            }
            Scheme::WadoRs => write!(f, "wadors:{}", self.url),
        }
    }
}
