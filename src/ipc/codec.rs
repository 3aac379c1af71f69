//! Length-prefixed MessagePack codec for tokio I/O.
//!
//! Framing: `[4 bytes: payload length, big-endian u32][N bytes: MessagePack payload]`

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{MAX_PAYLOAD_SIZE, Message, RawEnvelope};

/// Codec error type.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("payload too large: {0} bytes (max {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge(usize),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("MessagePack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("MessagePack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Split one complete frame off `src`, remembering a consumed header
/// across calls in `pending_len`.
fn take_frame(
    pending_len: &mut Option<usize>,
    src: &mut BytesMut,
) -> Result<Option<BytesMut>, CodecError> {
    let payload_len = match *pending_len {
        Some(len) => len,
        None => {
            if src.len() < 4 {
                return Ok(None);
            }
            let len = src.get_u32() as usize;
            if len > MAX_PAYLOAD_SIZE {
                return Err(CodecError::PayloadTooLarge(len));
            }
            *pending_len = Some(len);
            len
        }
    };

    if src.len() < payload_len {
        src.reserve(payload_len - src.len());
        return Ok(None);
    }

    *pending_len = None;
    Ok(Some(src.split_to(payload_len)))
}

fn put_frame(item: &Message, dst: &mut BytesMut) -> Result<(), CodecError> {
    let payload = rmp_serde::to_vec_named(item)?;
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::PayloadTooLarge(payload.len()));
    }
    dst.reserve(4 + payload.len());
    dst.put_u32(payload.len() as u32);
    dst.extend_from_slice(&payload);
    Ok(())
}

/// Length-prefixed MessagePack codec.
///
/// Used by the client transport, which only ever expects known
/// messages from the manager. The manager itself uses [`FrameCodec`] +
/// [`decode_frame`] so it can answer unknown types.
#[derive(Debug, Default)]
pub struct LengthPrefixedCodec {
    pending_len: Option<usize>,
}

impl LengthPrefixedCodec {
    pub fn new() -> Self {
        Self { pending_len: None }
    }
}

impl Decoder for LengthPrefixedCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match take_frame(&mut self.pending_len, src)? {
            Some(payload) => Ok(Some(rmp_serde::from_slice(&payload)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for LengthPrefixedCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        put_frame(&item, dst)
    }
}

/// Frame-level codec. Handles only length-prefixed framing.
///
/// Returns raw payloads without deserializing, for two-phase decode:
/// try [`Message`], then fall back to [`RawEnvelope`].
#[derive(Debug, Default)]
pub struct FrameCodec {
    pending_len: Option<usize>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self { pending_len: None }
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        take_frame(&mut self.pending_len, src)
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        put_frame(&item, dst)
    }
}

/// Result of attempting to decode a raw frame into a protocol message.
#[derive(Debug)]
pub enum DecodeResult {
    Ok(Message),
    /// Unknown type; the envelope is kept for echoing the id.
    UnknownType(RawEnvelope),
    /// Could not even extract `{type, id}`.
    Malformed(rmp_serde::decode::Error),
}

/// Attempt two-phase decode of a raw frame.
pub fn decode_frame(payload: &[u8]) -> DecodeResult {
    match rmp_serde::from_slice::<Message>(payload) {
        Ok(msg) => DecodeResult::Ok(msg),
        Err(_) => match rmp_serde::from_slice::<RawEnvelope>(payload) {
            Ok(envelope) => DecodeResult::UnknownType(envelope),
            Err(e) => DecodeResult::Malformed(e),
        },
    }
}
