use super::{
    ByteOrder, CodecAdapter, CodecError, DecodeRequest, RawFrame, pad_partial, samples_from_bytes,
};

/// Uncompressed pixel data, optionally byte swapped. Also covers 1-bit
/// packed bitmaps.
#[derive(Debug, Clone, Copy)]
pub struct NativeAdapter {
    order: ByteOrder,
}

impl NativeAdapter {
    pub const fn little_endian() -> Self {
        Self {
            order: ByteOrder::Little,
        }
    }

    pub const fn big_endian() -> Self {
        Self {
            order: ByteOrder::Big,
        }
    }
}

impl CodecAdapter for NativeAdapter {
    fn name(&self) -> &'static str {
        match self.order {
            ByteOrder::Little => "native-le",
            ByteOrder::Big => "native-be",
        }
    }

    fn decode(&self, request: &DecodeRequest<'_>) -> Result<RawFrame, CodecError> {
        let expected = request.descriptor.frame_size_bytes();
        let bytes = pad_partial(request.bytes, expected, request.is_final);
        let samples = samples_from_bytes(self.name(), &bytes, request.descriptor, self.order)?;
        Ok(RawFrame {
            descriptor: request.descriptor.clone(),
            samples,
            decode_level: 0,
        })
    }
}
