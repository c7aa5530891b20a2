//! Binary chunk framing for the unordered channel
//!
//! Frame layout:
//! - `[0..metadata_size]`: UTF-8 JSON metadata, zero-padded
//! - `[metadata_size..]`: payload, at most `data_size` bytes
//!
//! The metadata length is the offset of the first 0x00 in the header, so the
//! JSON text itself must not contain a literal NUL.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("Payload of {size} bytes exceeds chunk data size {limit}")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("Metadata of {size} bytes exceeds metadata size {limit}")]
    MetadataTooLarge { size: usize, limit: usize },
    #[error("Metadata must not contain a NUL byte")]
    MetadataContainsNul,
    #[error("Frame of {size} bytes is shorter than the {header} byte header")]
    FrameTooShort { size: usize, header: usize },
    #[error("Frame of {size} bytes exceeds whole chunk size {limit}")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("Invalid chunk metadata: {0}")]
    InvalidMetadata(#[from] serde_json::Error),
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedChunk<M> {
    pub metadata: M,
    pub payload: Vec<u8>,
}

/// Pack `metadata` and `payload` into one frame.
///
/// The frame is `metadata_size + payload.len()` bytes; only the last chunk of
/// a file is shorter than the whole chunk size.
pub fn create_chunk<M: Serialize>(
    payload: &[u8],
    metadata: &M,
    data_size: usize,
    metadata_size: usize,
) -> Result<Vec<u8>, ChunkError> {
    if payload.len() > data_size {
        return Err(ChunkError::PayloadTooLarge {
            size: payload.len(),
            limit: data_size,
        });
    }

    let header = serde_json::to_vec(metadata)?;
    if header.len() > metadata_size {
        return Err(ChunkError::MetadataTooLarge {
            size: header.len(),
            limit: metadata_size,
        });
    }
    if header.contains(&0) {
        return Err(ChunkError::MetadataContainsNul);
    }

    let mut frame = vec![0u8; metadata_size + payload.len()];
    frame[..header.len()].copy_from_slice(&header);
    frame[metadata_size..].copy_from_slice(payload);
    Ok(frame)
}

/// Inverse of [`create_chunk`]
pub fn parse_chunk<M: DeserializeOwned>(
    frame: &[u8],
    whole_size: usize,
    metadata_size: usize,
) -> Result<ParsedChunk<M>, ChunkError> {
    if frame.len() < metadata_size {
        return Err(ChunkError::FrameTooShort {
            size: frame.len(),
            header: metadata_size,
        });
    }
    if frame.len() > whole_size {
        return Err(ChunkError::FrameTooLarge {
            size: frame.len(),
            limit: whole_size,
        });
    }

    let header = &frame[..metadata_size];
    let metadata_len = header
        .iter()
        .position(|b| *b == 0)
        .unwrap_or(metadata_size);
    let metadata = serde_json::from_slice(&header[..metadata_len])?;

    Ok(ParsedChunk {
        metadata,
        payload: frame[metadata_size..].to_vec(),
    })
}

/// Number of chunks needed for `size` bytes
pub fn chunk_count(size: u64, data_size: usize) -> u64 {
    if data_size == 0 {
        return 0;
    }
    size.div_ceil(data_size as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    const WHOLE: usize = 16384;
    const META: usize = 100;
    const DATA: usize = WHOLE - META;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Header {
        file_id: String,
        chunk_id: u32,
    }

    fn header(chunk_id: u32) -> Header {
        Header {
            file_id: "5f8e3a52-0c1b-4f77-9a3e-2b8f6f1d4c10".to_string(),
            chunk_id,
        }
    }

    #[test]
    fn test_roundtrip_full_frame() {
        let payload: Vec<u8> = (0..DATA).map(|i| (i % 251) as u8).collect();
        let frame = create_chunk(&payload, &header(4), DATA, META).unwrap();
        assert_eq!(frame.len(), WHOLE);

        let parsed: ParsedChunk<Header> = parse_chunk(&frame, WHOLE, META).unwrap();
        assert_eq!(parsed.metadata, header(4));
        assert_eq!(parsed.payload, payload);
    }

    #[test]
    fn test_short_last_frame() {
        let payload = vec![7u8; 1234];
        let frame = create_chunk(&payload, &header(2), DATA, META).unwrap();
        assert_eq!(frame.len(), META + 1234);

        let parsed: ParsedChunk<Header> = parse_chunk(&frame, WHOLE, META).unwrap();
        assert_eq!(parsed.payload, payload);
    }

    #[test]
    fn test_empty_payload() {
        let frame = create_chunk(&[], &header(0), DATA, META).unwrap();
        let parsed: ParsedChunk<Header> = parse_chunk(&frame, WHOLE, META).unwrap();
        assert!(parsed.payload.is_empty());
        assert_eq!(parsed.metadata.chunk_id, 0);
    }

    #[test]
    fn test_metadata_exactly_at_limit() {
        // {"k":"xxx..."} sized to fill the header with no padding left
        let filler = "x".repeat(META - 8);
        let metadata = serde_json::json!({ "k": filler });
        assert_eq!(serde_json::to_vec(&metadata).unwrap().len(), META);

        let frame = create_chunk(b"abc", &metadata, DATA, META).unwrap();
        let parsed: ParsedChunk<serde_json::Value> = parse_chunk(&frame, WHOLE, META).unwrap();
        assert_eq!(parsed.metadata, metadata);
        assert_eq!(parsed.payload, b"abc");
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let payload = vec![0u8; DATA + 1];
        let result = create_chunk(&payload, &header(0), DATA, META);
        assert!(matches!(
            result,
            Err(ChunkError::PayloadTooLarge { size, limit }) if size == DATA + 1 && limit == DATA
        ));
    }

    #[test]
    fn test_oversized_metadata_rejected() {
        let metadata = serde_json::json!({ "k": "x".repeat(META) });
        let result = create_chunk(b"", &metadata, DATA, META);
        assert!(matches!(result, Err(ChunkError::MetadataTooLarge { .. })));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let result: Result<ParsedChunk<Header>, _> = parse_chunk(&[b'{'; 10], WHOLE, META);
        assert!(matches!(result, Err(ChunkError::FrameTooShort { .. })));
    }

    #[test]
    fn test_garbage_header_rejected() {
        let mut frame = vec![0u8; META + 4];
        frame[..5].copy_from_slice(b"nope!");
        let result: Result<ParsedChunk<Header>, _> = parse_chunk(&frame, WHOLE, META);
        assert!(matches!(result, Err(ChunkError::InvalidMetadata(_))));
    }

    #[test]
    fn test_chunk_count() {
        assert_eq!(DATA, 16284);
        assert_eq!(chunk_count(40_000, DATA), 3);
        assert_eq!(chunk_count(DATA as u64, DATA), 1);
        assert_eq!(chunk_count(DATA as u64 + 1, DATA), 2);
        assert_eq!(chunk_count(0, DATA), 0);
    }
}
