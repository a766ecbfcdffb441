//! Static table from transfer syntax UID to codec adapter.

use crate::codec::CodecAdapter;
use crate::codec::dicom_rs::{self, DicomRsAdapter, Family};
use crate::codec::native::NativeAdapter;
use crate::codec::rle::RleAdapter;

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::{Arc, LazyLock};
use tracing::debug;

pub mod uids {
    pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";
    pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";
    pub const DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1.99";
    pub const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";
    pub const JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";
    pub const JPEG_EXTENDED: &str = "1.2.840.10008.1.2.4.51";
    pub const JPEG_LOSSLESS: &str = "1.2.840.10008.1.2.4.57";
    pub const JPEG_LOSSLESS_SV1: &str = "1.2.840.10008.1.2.4.70";
    pub const JPEG_LS_LOSSLESS: &str = "1.2.840.10008.1.2.4.80";
    pub const JPEG_LS_NEAR_LOSSLESS: &str = "1.2.840.10008.1.2.4.81";
    pub const JPEG_2000_LOSSLESS: &str = "1.2.840.10008.1.2.4.90";
    pub const JPEG_2000: &str = "1.2.840.10008.1.2.4.91";
    pub const HTJ2K_LOSSLESS: &str = "1.2.840.10008.1.2.4.201";
    pub const HTJ2K_LOSSLESS_RPCL: &str = "1.2.840.10008.1.2.4.202";
    pub const HTJ2K: &str = "1.2.840.10008.1.2.4.203";
    pub const RLE_LOSSLESS: &str = "1.2.840.10008.1.2.5";
}

#[derive(Clone)]
pub struct TransferSyntaxEntry {
    pub uid: &'static str,
    pub name: &'static str,
    pub adapter: Arc<dyn CodecAdapter>,
}

impl fmt::Debug for TransferSyntaxEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferSyntaxEntry")
            .field("uid", &self.uid)
            .field("name", &self.name)
            .field("adapter", &self.adapter.name())
            .finish()
    }
}

/// Transfer syntax UID to adapter table, built once and then read only.
#[derive(Clone, Default)]
pub struct TransferSyntaxRegistry {
    entries: HashMap<&'static str, TransferSyntaxEntry>,
}

impl fmt::Debug for TransferSyntaxRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries: HashMap<&str, &str> = self
            .entries
            .iter()
            .map(|(uid, entry)| (*uid, entry.adapter.name()))
            .collect();
        f.debug_struct("TransferSyntaxRegistry")
            .field("entries", &entries)
            .finish()
    }
}

static DEFAULT_REGISTRY: LazyLock<TransferSyntaxRegistry> =
    LazyLock::new(TransferSyntaxRegistry::with_defaults);

impl TransferSyntaxRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Native and RLE syntaxes, plus each delegated family whose codec is
    /// compiled into the linked `dicom-pixeldata`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        let native_le: Arc<dyn CodecAdapter> = Arc::new(NativeAdapter::little_endian());

        let builtin: [(&'static str, &'static str, Arc<dyn CodecAdapter>); 5] = [
            (uids::IMPLICIT_VR_LITTLE_ENDIAN, "Implicit VR Little Endian", native_le.clone()),
            (uids::EXPLICIT_VR_LITTLE_ENDIAN, "Explicit VR Little Endian", native_le.clone()),
            (
                uids::DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN,
                "Deflated Explicit VR Little Endian",
                native_le,
            ),
            (
                uids::EXPLICIT_VR_BIG_ENDIAN,
                "Explicit VR Big Endian",
                Arc::new(NativeAdapter::big_endian()),
            ),
            (uids::RLE_LOSSLESS, "RLE Lossless", Arc::new(RleAdapter)),
        ];
        for (uid, name, adapter) in builtin {
            registry.register(uid, name, adapter);
        }

        let delegated: [(&'static str, &'static str, Family); 11] = [
            (uids::JPEG_BASELINE, "JPEG Baseline (Process 1)", Family::JpegBaseline),
            (uids::JPEG_EXTENDED, "JPEG Extended (Process 2 & 4)", Family::JpegExtended),
            (uids::JPEG_LOSSLESS, "JPEG Lossless (Process 14)", Family::JpegLossless),
            (uids::JPEG_LOSSLESS_SV1, "JPEG Lossless SV1", Family::JpegLossless),
            (uids::JPEG_LS_LOSSLESS, "JPEG-LS Lossless", Family::JpegLs),
            (uids::JPEG_LS_NEAR_LOSSLESS, "JPEG-LS Near Lossless", Family::JpegLsNearLossless),
            (uids::JPEG_2000_LOSSLESS, "JPEG 2000 Lossless", Family::Jpeg2000),
            (uids::JPEG_2000, "JPEG 2000", Family::Jpeg2000),
            (uids::HTJ2K_LOSSLESS, "HTJ2K Lossless", Family::HighThroughputJpeg2000),
            (uids::HTJ2K_LOSSLESS_RPCL, "HTJ2K Lossless RPCL", Family::HighThroughputJpeg2000),
            (uids::HTJ2K, "HTJ2K", Family::HighThroughputJpeg2000),
        ];
        for (uid, name, family) in delegated {
            if dicom_rs::is_available(uid) {
                registry.register(uid, name, Arc::new(DicomRsAdapter::new(family)));
            } else {
                debug!(uid, name, "codec not built, transfer syntax left unregistered");
            }
        }
        registry
    }

    /// Process-wide default table.
    pub fn global() -> &'static TransferSyntaxRegistry {
        &DEFAULT_REGISTRY
    }

    /// Add or replace an adapter, returning `true` when an entry was replaced.
    pub fn register(
        &mut self,
        uid: &'static str,
        name: &'static str,
        adapter: Arc<dyn CodecAdapter>,
    ) -> bool {
        let entry = TransferSyntaxEntry { uid, name, adapter };
        match self.entries.entry(uid) {
            Entry::Occupied(mut occupied) => {
                occupied.insert(entry);
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                false
            }
        }
    }

    pub fn get(&self, uid: &str) -> Option<&TransferSyntaxEntry> {
        self.entries.get(uid.trim_end_matches(['\0', ' ']))
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.get(uid).is_some()
    }

    pub fn uids(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_built_family() {
        let registry = TransferSyntaxRegistry::global();
        assert_eq!(registry.get(uids::RLE_LOSSLESS).unwrap().adapter.name(), "rle");
        assert_eq!(
            registry.get(uids::EXPLICIT_VR_BIG_ENDIAN).unwrap().adapter.name(),
            "native-be"
        );
        assert_eq!(
            registry.get(uids::JPEG_BASELINE).unwrap().adapter.name(),
            "jpeg-baseline"
        );
        assert_eq!(
            registry.get(uids::JPEG_LOSSLESS_SV1).unwrap().adapter.name(),
            "jpeg-lossless"
        );
    }

    #[test]
    fn delegated_syntaxes_are_registered_only_when_decodable() {
        let registry = TransferSyntaxRegistry::with_defaults();
        for uid in [
            uids::JPEG_LS_LOSSLESS,
            uids::JPEG_LS_NEAR_LOSSLESS,
            uids::JPEG_2000_LOSSLESS,
            uids::JPEG_2000,
            uids::HTJ2K_LOSSLESS,
            uids::HTJ2K_LOSSLESS_RPCL,
            uids::HTJ2K,
        ] {
            assert_eq!(registry.contains(uid), dicom_rs::is_available(uid), "{uid}");
        }
        assert!(!registry.contains(uids::JPEG_LS_LOSSLESS));
        assert!(registry.len() >= 9);
    }

    #[test]
    fn padded_uids_resolve() {
        let registry = TransferSyntaxRegistry::with_defaults();
        assert!(registry.contains("1.2.840.10008.1.2.1\0"));
        assert!(!registry.contains("1.2.3.4"));
    }

    #[test]
    fn register_reports_replacement() {
        let mut registry = TransferSyntaxRegistry::empty();
        assert!(!registry.register("1.2.3", "Test", Arc::new(RleAdapter)));
        assert!(registry.register("1.2.3", "Test", Arc::new(NativeAdapter::little_endian())));
        assert_eq!(registry.get("1.2.3").unwrap().adapter.name(), "native-le");
    }
}
