//! Byte encoding shared by the transports, the exchange payloads and the
//! partition store.

use async_compression::tokio::bufread::{ZstdDecoder, ZstdEncoder};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncReadExt;

use crate::error::CommError;

pub(crate) const BINCODE_CONFIG: bincode::config::Configuration = bincode::config::standard()
    .with_little_endian()
    .with_variable_int_encoding();

const RAW: u8 = 0;
const ZSTD: u8 = 1;

pub(crate) async fn zstd_compress(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZstdEncoder::with_quality(bytes, async_compression::Level::Precise(3));
    let mut compressed = Vec::new();
    encoder.read_to_end(&mut compressed).await?;
    Ok(compressed)
}

pub(crate) async fn zstd_decompress(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = ZstdDecoder::new(bytes);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed).await?;
    Ok(decompressed)
}

/// Encodes a partition for an exchange: one flag byte, then
/// `(declared_count, items)` in bincode, optionally zstd-compressed.
pub async fn encode_items<T: Serialize>(items: &[T], compress: bool) -> Result<Vec<u8>, CommError> {
    let body = bincode::serde::encode_to_vec((items.len() as u64, items), BINCODE_CONFIG)?;
    let mut payload = Vec::with_capacity(body.len() + 1);
    if compress {
        payload.push(ZSTD);
        payload.extend_from_slice(&zstd_compress(&body).await?);
    } else {
        payload.push(RAW);
        payload.extend_from_slice(&body);
    }
    Ok(payload)
}

/// Inverse of [`encode_items`]. Fails with `SizeMismatch` when the element
/// count announced by `partner` does not match what actually arrived.
pub async fn decode_items<T: DeserializeOwned>(
    payload: &[u8],
    partner: usize,
) -> Result<Vec<T>, CommError> {
    let (flag, body) = payload.split_first().ok_or(CommError::SizeMismatch {
        partner,
        declared: 0,
        received: 0,
    })?;
    let inflated;
    let body = match *flag {
        RAW => body,
        ZSTD => {
            inflated = zstd_decompress(body).await?;
            &inflated[..]
        }
        other => {
            return Err(CommError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown payload flag {} from rank {}", other, partner),
            )));
        }
    };
    let ((declared, items), _): ((u64, Vec<T>), _) =
        bincode::serde::decode_from_slice(body, BINCODE_CONFIG)?;
    if declared != items.len() as u64 {
        return Err(CommError::SizeMismatch {
            partner,
            declared,
            received: items.len(),
        });
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_compressed_payload_decodes() {
        let items: Vec<i64> = (0..5000).map(|i| (i * 7919) % 1013).collect();
        let raw = encode_items(&items, false).await.unwrap();
        let packed = encode_items(&items, true).await.unwrap();
        assert!(packed.len() < raw.len());
        let back: Vec<i64> = decode_items(&packed, 3).await.unwrap();
        assert_eq!(back, items);
    }

    #[tokio::test]
    async fn test_declared_count_is_checked() {
        let body = bincode::serde::encode_to_vec((4u64, vec![1u32, 2, 3]), BINCODE_CONFIG).unwrap();
        let mut payload = vec![RAW];
        payload.extend_from_slice(&body);
        let err = decode_items::<u32>(&payload, 7).await.unwrap_err();
        assert!(matches!(
            err,
            CommError::SizeMismatch {
                partner: 7,
                declared: 4,
                received: 3
            }
        ));
    }

    #[tokio::test]
    async fn test_empty_payload_is_rejected() {
        assert!(decode_items::<u32>(&[], 0).await.is_err());
    }
}
