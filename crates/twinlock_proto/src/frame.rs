//! Length-prefixed frame codec.
//!
//! Every frame is `[header-key:1][payload-length:4][payload:N]`. The length is
//! a signed big-endian `i32`. A frame is only handed to the caller once the
//! whole payload is buffered; a bad header key poisons the stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::WireError;

/// Sentinel byte that opens every frame.
pub const HEADER_KEY: u8 = 0x5A;
/// Header size: key byte plus the 4-byte payload length.
pub const HEADER_LEN: usize = 5;
/// Largest payload a peer may declare.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Append one frame wrapping `payload` to `dst`.
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) -> Result<(), WireError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(WireError::FrameTooLarge(payload.len()));
    }
    dst.reserve(HEADER_LEN + payload.len());
    dst.put_u8(HEADER_KEY);
    dst.put_i32(payload.len() as i32);
    dst.put_slice(payload);
    Ok(())
}

/// Try to split one complete frame payload off the front of `src`.
///
/// Returns `Ok(None)` while the header or the payload is still incomplete;
/// nothing is consumed in that case.
pub fn decode_frame(src: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
    if src.is_empty() {
        return Ok(None);
    }
    // Check the key as soon as one byte is available so garbage is rejected
    // without waiting for a full header.
    if src[0] != HEADER_KEY {
        return Err(WireError::BadHeaderKey(src[0]));
    }
    if src.len() < HEADER_LEN {
        return Ok(None);
    }

    let declared = i32::from_be_bytes([src[1], src[2], src[3], src[4]]);
    if declared < 0 {
        return Err(WireError::NegativeLength(declared));
    }
    let len = declared as usize;
    if len > MAX_PAYLOAD_LEN {
        return Err(WireError::FrameTooLarge(len));
    }
    if src.len() < HEADER_LEN + len {
        src.reserve(HEADER_LEN + len - src.len());
        return Ok(None);
    }

    src.advance(HEADER_LEN);
    Ok(Some(src.split_to(len).freeze()))
}

/// `tokio_util` adapter so connections can use `FramedRead`/`FramedWrite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_frame(src)
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = WireError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame(&item, dst)
    }
}
