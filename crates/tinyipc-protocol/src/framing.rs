//! Length-prefixed frame encoding.
//!
//! Frames are written with a 4-byte big-endian length prefix followed by
//! the JSON body:
//!
//! ```text
//! +----------------+------------------+
//! | length (4 BE)  |  JSON frame body |
//! +----------------+------------------+
//! ```

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::MAX_FRAME_SIZE;
use crate::error::{ProtocolError, ProtocolResult};
use crate::frame::Frame;

const HEADER_LEN: usize = 4;

/// Encodes a frame to bytes with length prefix.
///
/// # Example
///
/// ```rust
/// use tinyipc_protocol::{Frame, encode_frame};
///
/// let frame = Frame::request(1, "ping", serde_json::Value::Null);
/// let bytes = encode_frame(&frame).unwrap();
/// assert!(bytes.len() > 4);
/// ```
pub fn encode_frame(frame: &Frame) -> ProtocolResult<Vec<u8>> {
    let json = serde_json::to_vec(frame)?;
    let len = u32::try_from(json.len()).unwrap_or(u32::MAX);

    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buffer = Vec::with_capacity(HEADER_LEN + json.len());
    buffer.extend_from_slice(&len.to_be_bytes());
    buffer.extend_from_slice(&json);
    Ok(buffer)
}

/// Decodes a frame from a complete buffer (length prefix + body).
///
/// # Example
///
/// ```rust
/// use tinyipc_protocol::{Frame, decode_frame, encode_frame};
///
/// let frame = Frame::request(1, "ping", serde_json::Value::Null);
/// let bytes = encode_frame(&frame).unwrap();
/// assert_eq!(decode_frame(&bytes).unwrap(), frame);
/// ```
pub fn decode_frame(data: &[u8]) -> ProtocolResult<Frame> {
    let Some(header) = data.get(..HEADER_LEN) else {
        return Err(ProtocolError::IncompleteMessage {
            expected: HEADER_LEN,
            received: data.len(),
        });
    };

    let len = checked_len([header[0], header[1], header[2], header[3]])?;

    let Some(body) = data.get(HEADER_LEN..HEADER_LEN + len) else {
        return Err(ProtocolError::IncompleteMessage {
            expected: HEADER_LEN + len,
            received: data.len(),
        });
    };

    decode_body(body)
}

/// Reads one frame from an async byte stream.
///
/// Returns `Ok(None)` if the stream ends cleanly before any byte of a new
/// frame. A stream ending inside a frame is an error.
///
/// Not cancel safe: dropping the future mid-frame loses the partial frame.
pub async fn read_frame<R>(reader: &mut R) -> ProtocolResult<Option<Frame>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::IncompleteMessage {
                expected: HEADER_LEN,
                received: filled,
            });
        }
        filled += n;
    }

    let len = checked_len(len_buf)?;

    let mut body = vec![0u8; len];
    let mut received = 0;
    while received < len {
        let n = reader.read(&mut body[received..]).await?;
        if n == 0 {
            return Err(ProtocolError::IncompleteMessage {
                expected: len,
                received,
            });
        }
        received += n;
    }

    decode_body(&body).map(Some)
}

/// Writes one frame to an async byte stream and flushes it.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let data = encode_frame(frame)?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

fn checked_len(header: [u8; HEADER_LEN]) -> ProtocolResult<usize> {
    let len = u32::from_be_bytes(header);

    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    if len == 0 {
        return Err(ProtocolError::EmptyMessage);
    }

    Ok(len as usize)
}

fn decode_body(body: &[u8]) -> ProtocolResult<Frame> {
    let frame: Frame = serde_json::from_slice(body)?;
    frame.validate()?;
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ErrorCode, ErrorInfo};
    use serde_json::json;
    use std::io::Cursor;

    fn raw(body: &str) -> Vec<u8> {
        let mut data = (body.len() as u32).to_be_bytes().to_vec();
        data.extend_from_slice(body.as_bytes());
        data
    }

    #[test]
    fn encode_decode_roundtrip() {
        let frames = [
            Frame::request(1, "echo", json!({"x": 1, "nested": [1, 2, {"y": null}]})),
            Frame::response(2, json!("pong")),
            Frame::error(
                3,
                ErrorInfo::new(ErrorCode::Custom("E_QUOTA".into()), "over quota")
                    .with_data(json!({"limit": 10})),
            ),
        ];

        for frame in frames {
            let bytes = encode_frame(&frame).unwrap();
            let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            assert_eq!(len as usize, bytes.len() - 4);
            assert_eq!(decode_frame(&bytes).unwrap(), frame);
        }
    }

    #[test]
    fn decode_incomplete_length() {
        let result = decode_frame(&[0, 0]);
        assert!(matches!(
            result,
            Err(ProtocolError::IncompleteMessage { expected: 4, .. })
        ));
    }

    #[test]
    fn decode_incomplete_payload() {
        // Claim 100 bytes but only provide 10
        let mut data = vec![0, 0, 0, 100];
        data.extend_from_slice(&[0u8; 10]);

        let result = decode_frame(&data);
        assert!(matches!(
            result,
            Err(ProtocolError::IncompleteMessage { .. })
        ));
    }

    #[test]
    fn frame_too_large() {
        let data = (MAX_FRAME_SIZE + 1).to_be_bytes();
        let result = decode_frame(&data);
        assert!(matches!(result, Err(ProtocolError::MessageTooLarge { .. })));
    }

    #[test]
    fn decode_rejects_malformed_body() {
        let result = decode_frame(&raw("not json"));
        assert!(matches!(result, Err(ProtocolError::Serialization(_))));
    }

    #[test]
    fn decode_rejects_request_without_method() {
        let result = decode_frame(&raw(r#"{"correlationId":1,"kind":"REQUEST"}"#));
        assert!(matches!(
            result,
            Err(ProtocolError::MissingField { field: "method" })
        ));
    }

    #[test]
    fn decode_tolerates_unknown_fields() {
        let frame = decode_frame(&raw(
            r#"{"correlationId":9,"kind":"RESPONSE","payload":{"x":1},"extra":[1,2]}"#,
        ))
        .unwrap();
        assert_eq!(frame, Frame::response(9, json!({"x": 1})));
    }

    #[tokio::test]
    async fn read_frame_multiple_then_eof() {
        let first = Frame::request(1, "ping", json!({}));
        let second = Frame::response(1, json!("pong"));

        let mut bytes = encode_frame(&first).unwrap();
        bytes.extend(encode_frame(&second).unwrap());

        let mut reader = Cursor::new(bytes);
        assert_eq!(read_frame(&mut reader).await.unwrap(), Some(first));
        assert_eq!(read_frame(&mut reader).await.unwrap(), Some(second));
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn read_frame_truncated_header() {
        let mut reader = Cursor::new(vec![0u8, 0]);
        let result = read_frame(&mut reader).await;
        assert!(matches!(
            result,
            Err(ProtocolError::IncompleteMessage {
                expected: 4,
                received: 2
            })
        ));
    }

    #[tokio::test]
    async fn read_frame_truncated_body() {
        let bytes = encode_frame(&Frame::response(1, json!("pong"))).unwrap();
        let mut reader = Cursor::new(bytes[..bytes.len() - 3].to_vec());
        let result = read_frame(&mut reader).await;
        assert!(matches!(
            result,
            Err(ProtocolError::IncompleteMessage { .. })
        ));
    }

    #[tokio::test]
    async fn read_frame_empty_frame_error() {
        let mut reader = Cursor::new(0u32.to_be_bytes().to_vec());
        let result = read_frame(&mut reader).await;
        assert!(matches!(result, Err(ProtocolError::EmptyMessage)));
    }

    #[tokio::test]
    async fn write_then_read() {
        let frame = Frame::request(42, "add", json!({"a": 7, "b": 5}));
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &frame).await.unwrap();

        let mut reader = Cursor::new(buffer);
        assert_eq!(read_frame(&mut reader).await.unwrap(), Some(frame));
    }
}
