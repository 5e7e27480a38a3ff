//! Frame boundaries on the wire.
//!
//! ## Modes
//!
//! - `raw`: whatever one socket read returns is one frame, and a frame is
//!   written as-is. Two frames sent back-to-back may arrive as one read, so
//!   peers must not pipeline sends in this mode.
//! - `length-prefixed` (default): every frame carries a 4-byte big-endian
//!   length header, so frame boundaries survive TCP coalescing and splitting.
//!
//! ```text
//! raw:             <frame bytes>
//! length-prefixed: [u32 BE length][frame bytes]
//! ```

use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use std::io;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// How frame boundaries are found in the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    /// One read is one frame.
    Raw,
    /// 4-byte big-endian length header per frame.
    #[default]
    LengthPrefixed,
}

/// Codec producing one `Bytes` per frame, used on both ends of a connection.
#[derive(Debug)]
pub struct FrameCodec {
    framing: Framing,
    max_frame_len: usize,
    length: LengthDelimitedCodec,
}

impl FrameCodec {
    /// Create a codec; frames longer than `max_frame_len` are rejected
    /// (length-prefixed) or split (raw).
    pub fn new(framing: Framing, max_frame_len: usize) -> Self {
        let length = LengthDelimitedCodec::builder()
            .max_frame_length(max_frame_len)
            .new_codec();

        Self {
            framing,
            max_frame_len,
            length,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        match self.framing {
            Framing::Raw => {
                if src.is_empty() {
                    return Ok(None);
                }
                let n = src.len().min(self.max_frame_len);
                Ok(Some(src.split_to(n).freeze()))
            }
            Framing::LengthPrefixed => Ok(self.length.decode(src)?.map(BytesMut::freeze)),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> io::Result<()> {
        match self.framing {
            Framing::Raw => {
                dst.extend_from_slice(&item);
                Ok(())
            }
            Framing::LengthPrefixed => self.length.encode(item, dst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_takes_whole_buffer() {
        let mut codec = FrameCodec::new(Framing::Raw, 1024);
        let mut buf = BytesMut::from(&b"hello world"[..]);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"hello world");
        assert!(buf.is_empty());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_raw_splits_at_max_frame_len() {
        let mut codec = FrameCodec::new(Framing::Raw, 4);
        let mut buf = BytesMut::from(&b"abcdef"[..]);

        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"abcd");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"ef");
    }

    #[test]
    fn test_length_prefixed_waits_for_full_frame() {
        let mut codec = FrameCodec::new(Framing::LengthPrefixed, 1024);
        let mut buf = BytesMut::from(&b"\x00\x00\x00\x05hel"[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"lo\x00\x00\x00\x01!");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"hello");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"!");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_length_prefixed_rejects_oversized_frame() {
        let mut codec = FrameCodec::new(Framing::LengthPrefixed, 8);
        let mut buf = BytesMut::from(&b"\x00\x00\x01\x00"[..]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_encode_adds_header_only_when_prefixed() {
        let mut buf = BytesMut::new();
        FrameCodec::new(Framing::LengthPrefixed, 1024)
            .encode(Bytes::from_static(b"hi"), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"\x00\x00\x00\x02hi");

        let mut buf = BytesMut::new();
        FrameCodec::new(Framing::Raw, 1024)
            .encode(Bytes::from_static(b"hi"), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"hi");
    }
}
