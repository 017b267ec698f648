//! Length-delimited frame codec.
//!
//! Frames are written as a 4-byte big-endian length prefix followed by the
//! prost-encoded [`Frame`]. The codec plugs into `tokio_util::codec::Framed`
//! on both sides of the pipe.

use bytes::{Buf, BufMut, BytesMut};
use prost::Message;
use tokio_util::codec::{Decoder, Encoder};

use crate::proto::Frame;

/// Upper bound on a single frame. Large enough for model payloads, small
/// enough to catch a desynchronized pipe before it eats all memory.
pub const MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

/// Codec for [`Frame`]s over a byte stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = frame.encoded_len();
        if len > MAX_FRAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("frame of {len} bytes exceeds {MAX_FRAME_LEN}"),
            ));
        }
        dst.reserve(4 + len);
        dst.put_u32(len as u32);
        frame
            .encode(dst)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds {MAX_FRAME_LEN}"),
            ));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let body = src.split_to(len);
        let frame = Frame::decode(body.freeze())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(Some(frame))
    }
}
