//! Length-delimited framing for the request envelope.
//!
//! A frame is a u32 big-endian payload length followed by a postcard
//! payload. The decoder buffers across partial reads: the length prefix is
//! only consumed once the whole payload is available, so a frame split over
//! any number of reads is decoded exactly once.

use super::{CodecReadError, CodecWriteError};
use crate::protocol::{RequestEnvelope, ResponseEnvelope};
use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder};

/// Frames larger than this are a protocol violation, not a big value.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

const LENGTH_PREFIX_BYTES: usize = 4;

/// `Rx` is what this side decodes, `Tx` what it encodes. The listener uses
/// [`ListenerCodec`]; a driver embedding the other half uses [`DriverCodec`].
pub struct EnvelopeCodec<Rx, Tx> {
    decoded: Vec<Rx>,
    _tx: PhantomData<Tx>,
}

pub type ListenerCodec = EnvelopeCodec<RequestEnvelope, ResponseEnvelope>;
pub type DriverCodec = EnvelopeCodec<ResponseEnvelope, RequestEnvelope>;

impl<Rx, Tx> Default for EnvelopeCodec<Rx, Tx> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Rx, Tx> EnvelopeCodec<Rx, Tx> {
    pub fn new() -> Self {
        EnvelopeCodec {
            decoded: Vec::new(),
            _tx: PhantomData,
        }
    }
}

impl<Rx: DeserializeOwned, Tx> Decoder for EnvelopeCodec<Rx, Tx> {
    type Item = Vec<Rx>;
    type Error = CodecReadError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() < LENGTH_PREFIX_BYTES {
                break;
            }

            let length = u32::from_be_bytes(src[..LENGTH_PREFIX_BYTES].try_into().unwrap()) as usize;
            if length > MAX_FRAME_BYTES {
                return Err(CodecReadError::Parser(anyhow!(
                    "envelope frame of {length} bytes exceeds the {MAX_FRAME_BYTES} byte limit"
                )));
            }

            // Leave the prefix in place until the whole payload arrived.
            if src.len() < LENGTH_PREFIX_BYTES + length {
                break;
            }

            src.advance(LENGTH_PREFIX_BYTES);
            let payload = src.split_to(length);
            let envelope = postcard::from_bytes(&payload).map_err(|e| {
                CodecReadError::Parser(anyhow!(e).context("Error decoding envelope payload"))
            })?;
            self.decoded.push(envelope);
        }

        if self.decoded.is_empty() {
            Ok(None)
        } else {
            Ok(Some(std::mem::take(&mut self.decoded)))
        }
    }
}

impl<Rx, Tx: Serialize> Encoder<Vec<Tx>> for EnvelopeCodec<Rx, Tx> {
    type Error = CodecWriteError;

    fn encode(&mut self, item: Vec<Tx>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        for envelope in item {
            let payload = postcard::to_stdvec(&envelope).map_err(|e| {
                CodecWriteError::Encoder(anyhow!(e).context("Error encoding envelope payload"))
            })?;
            dst.reserve(LENGTH_PREFIX_BYTES + payload.len());
            dst.put_u32(payload.len() as u32);
            dst.extend_from_slice(&payload);
        }
        Ok(())
    }
}
