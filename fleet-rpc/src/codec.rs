//! Frame codecs.
//!
//! The wire carries length-prefixed frames: an unsigned big-endian length
//! header followed by exactly that many payload bytes. Writes build the
//! whole frame in one buffer and issue a single write so a frame is never
//! interleaved on the stream.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CodecError, IoStage};

/// Default frame payload ceiling: 10 MiB.
pub const DEFAULT_MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

/// Default length-header width in bytes.
pub const DEFAULT_HEADER_LEN: usize = 4;

/// Length-prefixed frame codec.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    header_len: usize,
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new(header_len: usize, max_frame_len: usize) -> Result<Self, CodecError> {
        if !matches!(header_len, 1 | 2 | 4 | 8) {
            return Err(CodecError::HeaderLengthUnsupported(header_len));
        }
        Ok(Self { header_len, max_frame_len })
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Read one frame: exact header, bounds check, exact payload.
    pub async fn read_frame<R>(&self, stream: &mut R) -> Result<Vec<u8>, CodecError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; 8];
        let header = &mut header[..self.header_len];
        stream.read_exact(header).await.map_err(|source| CodecError::Io {
            stage: IoStage::ReadHeader,
            source,
        })?;

        let len = header.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
        if len > self.max_frame_len {
            return Err(CodecError::MessageTooLarge { size: len, limit: self.max_frame_len });
        }

        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.map_err(|source| CodecError::Io {
            stage: IoStage::ReadPayload,
            source,
        })?;
        Ok(payload)
    }

    /// Write one frame as a single buffer / single write.
    pub async fn write_frame<W>(&self, stream: &mut W, payload: &[u8]) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin,
    {
        if payload.len() > self.max_frame_len {
            return Err(CodecError::MessageTooLarge {
                size: payload.len(),
                limit: self.max_frame_len,
            });
        }

        let mut buf = Vec::with_capacity(self.header_len + payload.len());
        for i in (0..self.header_len).rev() {
            buf.push(((payload.len() >> (i * 8)) & 0xff) as u8);
        }
        buf.extend_from_slice(payload);

        stream.write_all(&buf).await.map_err(|source| CodecError::Io {
            stage: IoStage::Write,
            source,
        })?;
        stream.flush().await.map_err(|source| CodecError::Io {
            stage: IoStage::Write,
            source,
        })
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            header_len: DEFAULT_HEADER_LEN,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Delimiter codec for internal text protocols: frames end at a single
/// delimiter byte, which is stripped on read and appended on write.
#[derive(Debug, Clone, Copy)]
pub struct DelimiterCodec {
    delimiter: u8,
    max_frame_len: usize,
}

impl DelimiterCodec {
    pub fn new(delimiter: u8, max_frame_len: usize) -> Self {
        Self { delimiter, max_frame_len }
    }

    pub async fn read_frame<R>(&self, stream: &mut R) -> Result<Vec<u8>, CodecError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut buf = Vec::new();
        let n = stream.read_until(self.delimiter, &mut buf).await.map_err(|source| {
            CodecError::Io { stage: IoStage::ReadPayload, source }
        })?;
        if n == 0 {
            return Err(CodecError::Io {
                stage: IoStage::ReadPayload,
                source: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "stream closed"),
            });
        }
        if buf.last() == Some(&self.delimiter) {
            buf.pop();
        }
        if buf.len() > self.max_frame_len {
            return Err(CodecError::MessageTooLarge { size: buf.len(), limit: self.max_frame_len });
        }
        Ok(buf)
    }

    pub async fn write_frame<W>(&self, stream: &mut W, payload: &[u8]) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = Vec::with_capacity(payload.len() + 1);
        buf.extend_from_slice(payload);
        buf.push(self.delimiter);
        stream.write_all(&buf).await.map_err(|source| CodecError::Io {
            stage: IoStage::Write,
            source,
        })?;
        stream.flush().await.map_err(|source| CodecError::Io {
            stage: IoStage::Write,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_round_trip() {
        let codec = FrameCodec::default();
        let mut buf = Vec::new();
        codec.write_frame(&mut buf, b"hello").await.unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 5]);

        let mut cursor = Cursor::new(buf);
        let payload = codec.read_frame(&mut cursor).await.unwrap();
        assert_eq!(payload, b"hello");
    }

    #[tokio::test]
    async fn test_empty_frame() {
        let codec = FrameCodec::default();
        let mut buf = Vec::new();
        codec.write_frame(&mut buf, b"").await.unwrap();
        let mut cursor = Cursor::new(buf);
        assert!(codec.read_frame(&mut cursor).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oversize_frame_rejected() {
        let codec = FrameCodec::new(4, 8).unwrap();
        let err = codec.write_frame(&mut Vec::new(), b"123456789").await.unwrap_err();
        assert!(matches!(err, CodecError::MessageTooLarge { size: 9, limit: 8 }));

        // A hostile header advertising more than the limit fails before
        // any payload allocation.
        let mut cursor = Cursor::new(vec![0xff, 0xff, 0xff, 0xff]);
        let err = codec.read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, CodecError::MessageTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_short_header_is_read_header_error() {
        let codec = FrameCodec::default();
        let mut cursor = Cursor::new(vec![0, 0]);
        match codec.read_frame(&mut cursor).await.unwrap_err() {
            CodecError::Io { stage, .. } => assert_eq!(stage, IoStage::ReadHeader),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_truncated_payload_is_read_payload_error() {
        let codec = FrameCodec::default();
        let mut cursor = Cursor::new(vec![0, 0, 0, 10, b'x']);
        match codec.read_frame(&mut cursor).await.unwrap_err() {
            CodecError::Io { stage, .. } => assert_eq!(stage, IoStage::ReadPayload),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unsupported_header_len() {
        assert!(matches!(
            FrameCodec::new(3, 1024),
            Err(CodecError::HeaderLengthUnsupported(3))
        ));
    }

    #[tokio::test]
    async fn test_delimiter_round_trip() {
        let codec = DelimiterCodec::new(b'\n', 1024);
        let mut buf = Vec::new();
        codec.write_frame(&mut buf, b"one line").await.unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(codec.read_frame(&mut cursor).await.unwrap(), b"one line");
    }
}
