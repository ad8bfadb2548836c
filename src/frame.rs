//! Length-prefixed framing for client traffic.
//!
//! Wire format, one frame:
//!
//! ```text
//! [2 bytes: payload length, big-endian u16]
//! [N bytes: encrypted payload]
//! ```
//!
//! The length is the only header. A zero-length frame is valid and carries
//! an empty payload.

use crate::constants::{FRAME_HEADER_LEN, MAX_FRAME_PAYLOAD};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Framing errors
#[derive(Debug)]
pub enum FrameError {
    /// Peer closed the connection cleanly between frames.
    Closed,
    /// Peer closed the connection in the middle of a frame.
    Truncated { expected: usize, received: usize },
    /// Payload does not fit the 16-bit length field.
    TooLarge(usize),
    /// Underlying I/O failure.
    Io(std::io::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Closed => write!(f, "Connection closed"),
            FrameError::Truncated { expected, received } => {
                write!(f, "Short read: got {} of {} bytes", received, expected)
            }
            FrameError::TooLarge(len) => {
                write!(f, "Payload of {} bytes exceeds {}", len, MAX_FRAME_PAYLOAD)
            }
            FrameError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        FrameError::Io(e)
    }
}

/// Read one frame and return its payload.
///
/// Reads exactly two header bytes, then exactly as many payload bytes as
/// the header announces. Cancel-safety is not provided: a frame that was
/// partially read when the future is dropped is lost.
pub async fn read_frame<R>(reader: &mut R) -> Result<Bytes, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; FRAME_HEADER_LEN];
    read_full(reader, &mut head, true).await?;

    let size = u16::from_be_bytes(head) as usize;
    let mut payload = BytesMut::zeroed(size);
    read_full(reader, &mut payload, false).await?;

    Ok(payload.freeze())
}

/// Fill `buf` completely, mapping EOF to the matching framing error.
async fn read_full<R>(reader: &mut R, buf: &mut [u8], at_boundary: bool) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if at_boundary && filled == 0 {
                return Err(FrameError::Closed);
            }
            return Err(FrameError::Truncated {
                expected: buf.len(),
                received: filled,
            });
        }
        filled += n;
    }
    Ok(())
}

/// Append a framed payload to `dst`.
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
    let len = u16::try_from(payload.len()).map_err(|_| FrameError::TooLarge(payload.len()))?;
    dst.reserve(FRAME_HEADER_LEN + payload.len());
    dst.put_u16(len);
    dst.extend_from_slice(payload);
    Ok(())
}

/// Write one framed payload and flush it.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = BytesMut::new();
    encode_frame(payload, &mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn framed(payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_frame(payload, &mut buf).unwrap();
        buf.to_vec()
    }

    #[tokio::test]
    async fn test_read_hello() {
        let mut mock = Builder::new().read(&[0x00, 0x05]).read(b"hello").build();

        let payload = read_frame(&mut mock).await.unwrap();
        assert_eq!(&payload[..], b"hello");
    }

    #[tokio::test]
    async fn test_zero_length_frame() {
        let mut mock = Builder::new().read(&[0x00, 0x00]).read(&[0x00, 0x01, b'x']).build();

        let empty = read_frame(&mut mock).await.unwrap();
        assert!(empty.is_empty());

        let next = read_frame(&mut mock).await.unwrap();
        assert_eq!(&next[..], b"x");
    }

    #[tokio::test]
    async fn test_header_split_across_reads() {
        let mut mock = Builder::new()
            .read(&[0x00])
            .read(&[0x03, b'a'])
            .read(b"bc")
            .build();

        let payload = read_frame(&mut mock).await.unwrap();
        assert_eq!(&payload[..], b"abc");
    }

    #[tokio::test]
    async fn test_round_trip_lengths() {
        for len in [0usize, 1, 2, 127, 255, 256, 1000, 4096, 32767, 65534, 65535] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let wire = framed(&payload);
            assert_eq!(wire.len(), len + 2);
            assert_eq!(u16::from_be_bytes([wire[0], wire[1]]) as usize, len);

            let mut reader = &wire[..];
            let decoded = read_frame(&mut reader).await.unwrap();
            assert_eq!(&decoded[..], &payload[..], "length {}", len);
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn test_encode_too_large() {
        let payload = vec![0u8; MAX_FRAME_PAYLOAD + 1];
        let mut buf = BytesMut::new();
        match encode_frame(&payload, &mut buf) {
            Err(FrameError::TooLarge(len)) => assert_eq!(len, 65536),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_clean_close_between_frames() {
        let mut reader: &[u8] = &[];
        assert!(matches!(read_frame(&mut reader).await, Err(FrameError::Closed)));
    }

    #[tokio::test]
    async fn test_short_header() {
        let mut reader: &[u8] = &[0x00];
        match read_frame(&mut reader).await {
            Err(FrameError::Truncated { expected, received }) => {
                assert_eq!(expected, 2);
                assert_eq!(received, 1);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_short_payload() {
        let mut reader: &[u8] = &[0x00, 0x05, b'h', b'e'];
        match read_frame(&mut reader).await {
            Err(FrameError::Truncated { expected, received }) => {
                assert_eq!(expected, 5);
                assert_eq!(received, 2);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_io_error_propagates() {
        let err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let mut mock = Builder::new().read(&[0x00, 0x04]).read_error(err).build();

        match read_frame(&mut mock).await {
            Err(FrameError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_frame() {
        let mut mock = Builder::new().write(&[0x00, 0x02, b'o', b'k']).build();
        write_frame(&mut mock, b"ok").await.unwrap();
    }
}
