use serde::{Deserialize, Serialize};

/// Fidelity of a decoded frame, ordered from coarsest to finest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DecodeStatus {
    Subresolution,
    Lossy,
    Complete,
}

impl DecodeStatus {
    pub fn is_complete(self) -> bool {
        matches!(self, DecodeStatus::Complete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PixelRepresentation {
    #[default]
    Unsigned,
    Signed,
}

impl PixelRepresentation {
    pub fn from_value(value: u16) -> Self {
        if value == 1 {
            PixelRepresentation::Signed
        } else {
            PixelRepresentation::Unsigned
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(self, PixelRepresentation::Signed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlanarConfiguration {
    /// R1G1B1 R2G2B2 ...
    #[default]
    Interleaved,
    /// R1R2.. G1G2.. B1B2..
    Planar,
}

impl PlanarConfiguration {
    pub fn from_value(value: u16) -> Self {
        if value == 1 {
            PlanarConfiguration::Planar
        } else {
            PlanarConfiguration::Interleaved
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStrategy {
    #[default]
    SingleShot,
    ByteRange,
    Streaming,
}

/// Transport named by the scheme of an image id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Whole Part-10 container, frames are cut out of the parsed dataset.
    WadoUri,
    /// Web retrieval of a single frame, possibly by byte ranges or streaming.
    WadoRs,
}
