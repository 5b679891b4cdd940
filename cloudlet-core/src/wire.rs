//! Frame codec: 4-byte big-endian length prefix, then a bincode field map.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::value::Fields;

/// Length prefix size in bytes.
pub const LEN_SIZE: usize = 4;

/// Upper bound for a single header frame. File payloads are streamed after
/// their header frame and are not subject to this limit.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

#[derive(Debug, Error)]
pub enum FrameDecodeError {
    #[error("stream ended inside the length prefix ({got} of {LEN_SIZE} bytes)")]
    TruncatedPrefix { got: usize },
    #[error("stream ended inside a frame ({got} of {expected} bytes)")]
    TruncatedFrame { expected: usize, got: usize },
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
    #[error("read error: {0}")]
    Io(#[from] io::Error),
}

/// Serialize a field map without the length prefix.
pub fn encode_fields(fields: &Fields) -> Result<Vec<u8>, FrameEncodeError> {
    bincode::serialize(fields).map_err(FrameEncodeError::Encode)
}

/// Serialize a field map into a complete frame, prefix included.
pub fn encode_frame(fields: &Fields) -> Result<Vec<u8>, FrameEncodeError> {
    let body = encode_fields(fields)?;
    if body.len() as u64 > u64::from(MAX_FRAME_LEN) {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut frame = Vec::with_capacity(LEN_SIZE + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Deserialize a frame body (the bytes after the prefix).
pub fn decode_fields(body: &[u8]) -> Result<Fields, FrameDecodeError> {
    bincode::deserialize(body).map_err(FrameDecodeError::Decode)
}

/// Read one frame. `Ok(None)` only when the stream ends exactly on a frame
/// boundary; a partial prefix or a body cut short is an error, not EOF.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Fields>, FrameDecodeError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LEN_SIZE];
    let mut got = 0;
    while got < LEN_SIZE {
        let n = reader.read(&mut prefix[got..]).await?;
        if n == 0 {
            if got == 0 {
                return Ok(None);
            }
            return Err(FrameDecodeError::TruncatedPrefix { got });
        }
        got += n;
    }

    let len = u32::from_be_bytes(prefix);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }

    let mut body = vec![0u8; len as usize];
    let mut got = 0;
    while got < body.len() {
        let n = reader.read(&mut body[got..]).await?;
        if n == 0 {
            return Err(FrameDecodeError::TruncatedFrame {
                expected: body.len(),
                got,
            });
        }
        got += n;
    }

    decode_fields(&body).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn sample() -> Fields {
        Fields::new()
            .with("command", 0x11i64)
            .with("blob_uri", "disk-overlay-0")
            .with("blob_size", 4096u64)
            .with("nested", Fields::new().with("flag", true))
    }

    #[test]
    fn prefix_is_big_endian_and_matches_body() {
        let frame = encode_frame(&sample()).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        assert_eq!(len as usize, frame.len() - LEN_SIZE);
        assert_eq!(encode_fields(&sample()).unwrap().len(), len as usize);
    }

    #[tokio::test]
    async fn roundtrip_single_frame() {
        let frame = encode_frame(&sample()).unwrap();
        let mut reader = &frame[..];
        let decoded = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(decoded, sample());
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn consecutive_frames_decode_in_order() {
        let first = Fields::new().with("command", 0x01i64);
        let second = Fields::new().with("command", 0x04i64);
        let mut bytes = encode_frame(&first).unwrap();
        bytes.extend(encode_frame(&second).unwrap());
        let mut reader = &bytes[..];
        assert_eq!(read_frame(&mut reader).await.unwrap().unwrap(), first);
        assert_eq!(read_frame(&mut reader).await.unwrap().unwrap(), second);
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_inside_prefix_is_an_error() {
        let frame = encode_frame(&sample()).unwrap();
        let mut reader = &frame[..2];
        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(err, FrameDecodeError::TruncatedPrefix { got: 2 }));
    }

    #[tokio::test]
    async fn eof_inside_body_is_an_error() {
        let frame = encode_frame(&sample()).unwrap();
        let mut reader = &frame[..frame.len() - 3];
        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(err, FrameDecodeError::TruncatedFrame { .. }));
    }

    #[tokio::test]
    async fn oversized_length_is_rejected_before_allocation() {
        let mut bytes = (MAX_FRAME_LEN + 1).to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 8]);
        let mut reader = &bytes[..];
        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(err, FrameDecodeError::TooLarge));
    }

    #[tokio::test]
    async fn garbage_body_is_a_decode_error() {
        let mut bytes = 4u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        let mut reader = &bytes[..];
        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(err, FrameDecodeError::Decode(_)));
    }

    #[test]
    fn values_of_every_kind_survive_encoding() {
        let fields = Fields::new()
            .with("null", Value::Null)
            .with("bool", true)
            .with("int", -7i64)
            .with("float", 2.5f64)
            .with("str", "overlay")
            .with("array", vec![Value::Int(1), Value::Str("two".into())])
            .with("map", Fields::new().with("k", "v"));
        let body = encode_fields(&fields).unwrap();
        assert_eq!(decode_fields(&body).unwrap(), fields);
    }
}
