//! Binary framing for the transfer channel.
//!
//! # Wire format
//!
//! ```text
//! FRAME: [1 byte: tag][4 bytes BE: payload_len][payload_len bytes: payload]
//!
//! HANDSHAKE (sender -> receiver): UTF-8 handshake text
//! ACCEPT    (receiver -> sender): [8 bytes BE: resume offset in chunks][4 bytes BE: block size]
//! CHUNK     (sender -> receiver): [8 bytes BE: sequence number][chunk bytes]
//! END       (sender -> receiver): empty
//! CREDIT    (receiver -> sender): [4 bytes BE: additional chunks allowed]
//! DONE      (receiver -> sender): UTF-8 resolved path
//! ERROR     (either direction):   [1 byte: error kind][UTF-8 reason]
//! ```

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const TAG_HANDSHAKE: u8 = 0x01;
pub const TAG_ACCEPT: u8 = 0x02;
pub const TAG_CHUNK: u8 = 0x03;
pub const TAG_END: u8 = 0x04;
pub const TAG_CREDIT: u8 = 0x05;
pub const TAG_DONE: u8 = 0x06;
pub const TAG_ERROR: u8 = 0x07;

/// Largest block size a receiver will ever accept (64 MiB).
pub const MAX_BLOCK_SIZE: u32 = 64 * 1024 * 1024;

/// Largest frame payload: a maximal chunk plus its sequence number.
pub const MAX_FRAME_LEN: u32 = MAX_BLOCK_SIZE + 8;

/// Largest payload of any frame other than `CHUNK` (64 KiB).
pub const MAX_CONTROL_LEN: u32 = 64 * 1024;

/// Errors produced while reading or writing frames.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown frame tag: {0:#04x}")]
    UnknownTag(u8),

    #[error("unknown error kind: {0}")]
    UnknownErrorKind(u8),

    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: u32, max: u32 },

    #[error("truncated {0} frame")]
    Truncated(&'static str),

    #[error("invalid UTF-8 in {0} frame")]
    InvalidUtf8(&'static str),
}

/// Failure category carried by an `ERROR` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorKind {
    MalformedHandshake = 1,
    AlreadyUploaded = 2,
    IncompatibleResume = 3,
    CatalogUnavailable = 4,
    SessionConflict = 5,
    Channel = 6,
    Cancelled = 7,
    Internal = 8,
}

impl ErrorKind {
    fn from_byte(b: u8) -> Result<Self, WireError> {
        Ok(match b {
            1 => Self::MalformedHandshake,
            2 => Self::AlreadyUploaded,
            3 => Self::IncompatibleResume,
            4 => Self::CatalogUnavailable,
            5 => Self::SessionConflict,
            6 => Self::Channel,
            7 => Self::Cancelled,
            8 => Self::Internal,
            other => return Err(WireError::UnknownErrorKind(other)),
        })
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::MalformedHandshake => "malformed handshake",
            Self::AlreadyUploaded => "already uploaded",
            Self::IncompatibleResume => "incompatible resume",
            Self::CatalogUnavailable => "catalog unavailable",
            Self::SessionConflict => "session conflict",
            Self::Channel => "channel error",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal error",
        };
        f.write_str(s)
    }
}

/// A single protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Handshake(String),
    Accept { resume_offset: u64, block_size: u32 },
    Chunk { sequence: u64, data: Vec<u8> },
    End,
    Credit(u32),
    Done(String),
    Error { kind: ErrorKind, reason: String },
}

impl Frame {
    /// Frame type name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Handshake(_) => "HANDSHAKE",
            Self::Accept { .. } => "ACCEPT",
            Self::Chunk { .. } => "CHUNK",
            Self::End => "END",
            Self::Credit(_) => "CREDIT",
            Self::Done(_) => "DONE",
            Self::Error { .. } => "ERROR",
        }
    }
}

/// Writes one frame and flushes the writer.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), WireError> {
    match frame {
        Frame::Handshake(text) => write_raw(writer, TAG_HANDSHAKE, &[text.as_bytes()]).await?,
        Frame::Accept {
            resume_offset,
            block_size,
        } => {
            write_raw(
                writer,
                TAG_ACCEPT,
                &[&resume_offset.to_be_bytes()[..], &block_size.to_be_bytes()[..]],
            )
            .await?
        }
        Frame::Chunk { sequence, data } => {
            write_raw(writer, TAG_CHUNK, &[&sequence.to_be_bytes()[..], data.as_slice()]).await?
        }
        Frame::End => write_raw(writer, TAG_END, &[]).await?,
        Frame::Credit(n) => write_raw(writer, TAG_CREDIT, &[&n.to_be_bytes()[..]]).await?,
        Frame::Done(path) => write_raw(writer, TAG_DONE, &[path.as_bytes()]).await?,
        Frame::Error { kind, reason } => {
            write_raw(writer, TAG_ERROR, &[&[*kind as u8][..], reason.as_bytes()]).await?
        }
    }
    writer.flush().await?;
    Ok(())
}

async fn write_raw<W: AsyncWrite + Unpin>(
    writer: &mut W,
    tag: u8,
    parts: &[&[u8]],
) -> Result<(), WireError> {
    let len: usize = parts.iter().map(|p| p.len()).sum();
    let max = payload_limit(tag);
    if len > max as usize {
        return Err(WireError::FrameTooLarge {
            len: len.min(u32::MAX as usize) as u32,
            max,
        });
    }
    writer.write_u8(tag).await?;
    writer.write_u32(len as u32).await?;
    for part in parts {
        writer.write_all(part).await?;
    }
    Ok(())
}

fn payload_limit(tag: u8) -> u32 {
    if tag == TAG_CHUNK {
        MAX_FRAME_LEN
    } else {
        MAX_CONTROL_LEN
    }
}

/// Reads one frame.
///
/// Returns `None` if the peer closed the stream cleanly at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>, WireError> {
    read_frame_limited(reader, MAX_FRAME_LEN).await
}

/// Reads one frame whose payload may not exceed `max_len`.
///
/// The length is checked before the payload is buffered. Frames other than
/// `CHUNK` are further capped at [`MAX_CONTROL_LEN`].
pub async fn read_frame_limited<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_len: u32,
) -> Result<Option<Frame>, WireError> {
    let tag = match reader.read_u8().await {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let len = reader.read_u32().await?;
    let max = max_len.min(payload_limit(tag));
    if len > max {
        return Err(WireError::FrameTooLarge { len, max });
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;

    let frame = match tag {
        TAG_HANDSHAKE => Frame::Handshake(utf8(payload, "HANDSHAKE")?),
        TAG_ACCEPT => {
            if payload.len() != 12 {
                return Err(WireError::Truncated("ACCEPT"));
            }
            let mut offset = [0u8; 8];
            let mut block = [0u8; 4];
            offset.copy_from_slice(&payload[..8]);
            block.copy_from_slice(&payload[8..]);
            Frame::Accept {
                resume_offset: u64::from_be_bytes(offset),
                block_size: u32::from_be_bytes(block),
            }
        }
        TAG_CHUNK => {
            if payload.len() < 8 {
                return Err(WireError::Truncated("CHUNK"));
            }
            let data = payload.split_off(8);
            let sequence = u64::from_be_bytes(
                payload
                    .as_slice()
                    .try_into()
                    .map_err(|_| WireError::Truncated("CHUNK"))?,
            );
            Frame::Chunk { sequence, data }
        }
        TAG_END => Frame::End,
        TAG_CREDIT => {
            let bytes: [u8; 4] = payload
                .as_slice()
                .try_into()
                .map_err(|_| WireError::Truncated("CREDIT"))?;
            Frame::Credit(u32::from_be_bytes(bytes))
        }
        TAG_DONE => Frame::Done(utf8(payload, "DONE")?),
        TAG_ERROR => {
            if payload.is_empty() {
                return Err(WireError::Truncated("ERROR"));
            }
            let reason = payload.split_off(1);
            Frame::Error {
                kind: ErrorKind::from_byte(payload[0])?,
                reason: utf8(reason, "ERROR")?,
            }
        }
        other => return Err(WireError::UnknownTag(other)),
    };

    tracing::trace!(frame = frame.name(), len, "frame read");
    Ok(Some(frame))
}

fn utf8(bytes: Vec<u8>, frame: &'static str) -> Result<String, WireError> {
    String::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8(frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(frame: Frame) -> Frame {
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();
        let mut cursor = &buf[..];
        read_frame(&mut cursor).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn chunk_frame_carries_sequence_and_bytes() {
        let frame = Frame::Chunk {
            sequence: 42,
            data: b"payload".to_vec(),
        };
        assert_eq!(roundtrip(frame.clone()).await, frame);
    }

    #[tokio::test]
    async fn empty_chunk_is_valid() {
        let frame = Frame::Chunk {
            sequence: 3,
            data: Vec::new(),
        };
        assert_eq!(roundtrip(frame.clone()).await, frame);
    }

    #[tokio::test]
    async fn accept_layout() {
        let mut buf = Vec::new();
        write_frame(
            &mut buf,
            &Frame::Accept {
                resume_offset: 2,
                block_size: 1000,
            },
        )
        .await
        .unwrap();
        assert_eq!(buf[0], TAG_ACCEPT);
        assert_eq!(&buf[1..5], &12u32.to_be_bytes());
        assert_eq!(&buf[5..13], &2u64.to_be_bytes());
        assert_eq!(&buf[13..17], &1000u32.to_be_bytes());
    }

    #[tokio::test]
    async fn error_frame_keeps_kind_and_reason() {
        let frame = Frame::Error {
            kind: ErrorKind::AlreadyUploaded,
            reason: "plant/a.csv already uploaded".into(),
        };
        assert_eq!(roundtrip(frame.clone()).await, frame);
    }

    #[tokio::test]
    async fn sequence_of_frames() {
        let frames = vec![
            Frame::Handshake("apiKey\nk\r\nfileName\nf".into()),
            Frame::Credit(2),
            Frame::End,
            Frame::Done("plant/f".into()),
        ];
        let mut buf = Vec::new();
        for f in &frames {
            write_frame(&mut buf, f).await.unwrap();
        }
        let mut cursor = &buf[..];
        for f in &frames {
            assert_eq!(&read_frame(&mut cursor).await.unwrap().unwrap(), f);
        }
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_tag_rejected() {
        let buf = [0x7fu8, 0, 0, 0, 0];
        let mut cursor = &buf[..];
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(WireError::UnknownTag(0x7f))
        ));
    }

    #[tokio::test]
    async fn oversized_length_rejected() {
        let mut buf = vec![TAG_CHUNK];
        buf.extend_from_slice(&u32::MAX.to_be_bytes());
        let mut cursor = &buf[..];
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(WireError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn control_frames_capped_before_buffering() {
        let mut buf = vec![TAG_HANDSHAKE];
        buf.extend_from_slice(&(MAX_CONTROL_LEN + 1).to_be_bytes());
        let mut cursor = &buf[..];
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(WireError::FrameTooLarge { max: MAX_CONTROL_LEN, .. })
        ));

        let oversized = Frame::Handshake("x".repeat(MAX_CONTROL_LEN as usize + 1));
        assert!(matches!(
            write_frame(&mut Vec::<u8>::new(), &oversized).await,
            Err(WireError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn caller_limit_applies_to_chunks() {
        let mut buf = Vec::new();
        write_frame(
            &mut buf,
            &Frame::Chunk {
                sequence: 1,
                data: vec![0; 16],
            },
        )
        .await
        .unwrap();

        let mut cursor = &buf[..];
        assert!(matches!(
            read_frame_limited(&mut cursor, 8 + 8).await,
            Err(WireError::FrameTooLarge { len: 24, max: 16 })
        ));
        let mut cursor = &buf[..];
        assert!(read_frame_limited(&mut cursor, 8 + 16).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn eof_inside_frame_is_error() {
        let buf = [TAG_CREDIT, 0, 0, 0, 4, 0];
        let mut cursor = &buf[..];
        assert!(matches!(read_frame(&mut cursor).await, Err(WireError::Io(_))));
    }

    #[tokio::test]
    async fn short_credit_payload_rejected() {
        let buf = [TAG_CREDIT, 0, 0, 0, 2, 0, 1];
        let mut cursor = &buf[..];
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(WireError::Truncated("CREDIT"))
        ));
    }
}
