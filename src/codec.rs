//! Compression codec interface (spec §6.4): the one capability the core dispatches
//! polymorphically. Each Data object payload is compressed with at most one codec,
//! recorded in three bits of its object flags byte; decompression dispatches back out on
//! whichever codec id was stored.

use crate::error::{JournalError, Result};
use crate::objects::DataCompression;

/// Payloads shorter than this are never worth compressing (spec §4.5 step 3c).
pub const DEFAULT_COMPRESS_THRESHOLD: u64 = 512;
/// Absolute floor below which compression is never attempted even if the caller lowers
/// the threshold.
pub const MIN_COMPRESS_THRESHOLD: u64 = 8;

/// One compression backend. `compress` may decline (return `Ok(None)`) if compressing
/// would not actually shrink the payload; callers then store it uncompressed.
pub trait Codec {
    fn id(&self) -> DataCompression;
    fn compress(&self, input: &[u8]) -> Result<Option<Vec<u8>>>;
    fn decompress(&self, input: &[u8], size_hint: usize) -> Result<Vec<u8>>;
}

pub struct NoneCodec;

impl Codec for NoneCodec {
    fn id(&self) -> DataCompression {
        DataCompression::None
    }

    fn compress(&self, _input: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn decompress(&self, input: &[u8], _size_hint: usize) -> Result<Vec<u8>> {
        Ok(input.to_vec())
    }
}

pub struct XzCodec;

impl Codec for XzCodec {
    fn id(&self) -> DataCompression {
        DataCompression::Xz
    }

    fn compress(&self, input: &[u8]) -> Result<Option<Vec<u8>>> {
        use std::io::Write;
        let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
        encoder
            .write_all(input)
            .map_err(|e| JournalError::BadMessage(format!("xz compress: {e}")))?;
        let out = encoder
            .finish()
            .map_err(|e| JournalError::BadMessage(format!("xz compress: {e}")))?;
        if out.len() >= input.len() {
            return Ok(None);
        }
        Ok(Some(out))
    }

    fn decompress(&self, input: &[u8], size_hint: usize) -> Result<Vec<u8>> {
        use std::io::Read;
        let mut out = Vec::with_capacity(size_hint);
        xz2::read::XzDecoder::new(input)
            .read_to_end(&mut out)
            .map_err(|e| JournalError::BadMessage(format!("xz decompress: {e}")))?;
        Ok(out)
    }
}

pub struct Lz4Codec;

impl Codec for Lz4Codec {
    fn id(&self) -> DataCompression {
        DataCompression::Lz4
    }

    fn compress(&self, input: &[u8]) -> Result<Option<Vec<u8>>> {
        let out = lz4_flex::compress_prepend_size(input);
        if out.len() >= input.len() {
            return Ok(None);
        }
        Ok(Some(out))
    }

    fn decompress(&self, input: &[u8], _size_hint: usize) -> Result<Vec<u8>> {
        lz4_flex::decompress_size_prepended(input)
            .map_err(|e| JournalError::BadMessage(format!("lz4 decompress: {e}")))
    }
}

pub struct ZstdCodec {
    pub level: i32,
}

impl Default for ZstdCodec {
    fn default() -> Self {
        Self { level: 3 }
    }
}

impl Codec for ZstdCodec {
    fn id(&self) -> DataCompression {
        DataCompression::Zstd
    }

    fn compress(&self, input: &[u8]) -> Result<Option<Vec<u8>>> {
        let out = zstd::bulk::compress(input, self.level)
            .map_err(|e| JournalError::BadMessage(format!("zstd compress: {e}")))?;
        if out.len() >= input.len() {
            return Ok(None);
        }
        Ok(Some(out))
    }

    fn decompress(&self, input: &[u8], size_hint: usize) -> Result<Vec<u8>> {
        let capacity = size_hint.max(input.len() * 4).max(64);
        zstd::bulk::decompress(input, capacity)
            .map_err(|e| JournalError::BadMessage(format!("zstd decompress: {e}")))
    }
}

/// Decompress `input` according to `codec_id`, without needing to know which [`Codec`] was
/// used to write it — the id alone selects the backend.
pub fn decompress(codec_id: DataCompression, input: &[u8], size_hint: usize) -> Result<Vec<u8>> {
    match codec_id {
        DataCompression::None => Ok(input.to_vec()),
        DataCompression::Xz => XzCodec.decompress(input, size_hint),
        DataCompression::Lz4 => Lz4Codec.decompress(input, size_hint),
        DataCompression::Zstd => ZstdCodec::default().decompress(input, size_hint),
    }
}

/// Compress `payload` with `codec` if it is at least `threshold` bytes (and always at
/// least [`MIN_COMPRESS_THRESHOLD`]), returning the codec id actually used (`None` if the
/// payload was too short, or if compressing didn't shrink it).
pub fn maybe_compress(
    codec: &dyn Codec,
    payload: &[u8],
    threshold: u64,
) -> Result<(DataCompression, Vec<u8>)> {
    let threshold = threshold.max(MIN_COMPRESS_THRESHOLD);
    if (payload.len() as u64) < threshold {
        return Ok((DataCompression::None, payload.to_vec()));
    }
    match codec.compress(payload)? {
        Some(compressed) => Ok((codec.id(), compressed)),
        None => Ok((DataCompression::None, payload.to_vec())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_codec_round_trips() {
        let payload = b"hello world";
        let (id, bytes) = maybe_compress(&NoneCodec, payload, 0).unwrap();
        assert_eq!(id, DataCompression::None);
        assert_eq!(decompress(id, &bytes, payload.len()).unwrap(), payload);
    }

    #[test]
    fn zstd_round_trips_and_shrinks_repetitive_data() {
        let payload = vec![b'a'; 4096];
        let codec = ZstdCodec::default();
        let (id, bytes) = maybe_compress(&codec, &payload, 512).unwrap();
        assert_eq!(id, DataCompression::Zstd);
        assert!(bytes.len() < payload.len());
        assert_eq!(decompress(id, &bytes, payload.len()).unwrap(), payload);
    }

    #[test]
    fn lz4_round_trips() {
        let payload = vec![b'x'; 2048];
        let codec = Lz4Codec;
        let (id, bytes) = maybe_compress(&codec, &payload, 512).unwrap();
        assert_eq!(id, DataCompression::Lz4);
        assert_eq!(decompress(id, &bytes, payload.len()).unwrap(), payload);
    }

    #[test]
    fn xz_round_trips() {
        let payload = vec![b'z'; 2048];
        let codec = XzCodec;
        let (id, bytes) = maybe_compress(&codec, &payload, 512).unwrap();
        assert_eq!(id, DataCompression::Xz);
        assert_eq!(decompress(id, &bytes, payload.len()).unwrap(), payload);
    }

    #[test]
    fn below_threshold_stays_uncompressed() {
        let payload = vec![b'a'; 100];
        let codec = ZstdCodec::default();
        let (id, bytes) = maybe_compress(&codec, &payload, 512).unwrap();
        assert_eq!(id, DataCompression::None);
        assert_eq!(bytes, payload);
    }
}
