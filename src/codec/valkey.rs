//! RESP2/RESP3 framing for connections to server nodes.
//!
//! Commands are always encoded as RESP2 bulk-string arrays, which are valid
//! under both protocol versions. Replies are decoded according to the
//! protocol negotiated during the handshake; RESP3 frames are normalized to
//! the RESP2 shape the rest of the crate works with (maps flatten to
//! field-value arrays, doubles and big numbers to their textual forms).
//!
//! The negotiated protocol is shared mutable state: the handshake sends
//! `HELLO 3` optimistically and downgrades the decoder when the server
//! rejects it, without tearing down the stream.

use super::{CodecBuilder, CodecReadError, CodecWriteError, Direction};
use crate::config::ProtocolVersion;
use crate::frame::ValkeyFrame;
use anyhow::anyhow;
use bytes::{Buf, BytesMut};
use bytes_utils::string::Str;
use redis_protocol::resp2::prelude::{decode_mut, encode_bytes};
use redis_protocol::resp3::decode::complete::decode_mut as resp3_decode_mut;
use redis_protocol::resp3::types::Frame as Resp3Frame;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};

/// The protocol a connection is currently speaking.
///
/// Shared between the handshake driver and the reader task's decoder so a
/// `HELLO` rejection can switch an in-flight stream back to RESP2.
#[derive(Clone, Debug)]
pub struct NegotiatedProtocol(Arc<AtomicU8>);

impl NegotiatedProtocol {
    pub fn new(version: ProtocolVersion) -> Self {
        let value = match version {
            ProtocolVersion::Resp2 => 2,
            ProtocolVersion::Resp3 => 3,
        };
        NegotiatedProtocol(Arc::new(AtomicU8::new(value)))
    }

    pub fn get(&self) -> ProtocolVersion {
        match self.0.load(Ordering::Acquire) {
            2 => ProtocolVersion::Resp2,
            _ => ProtocolVersion::Resp3,
        }
    }

    pub fn downgrade_to_resp2(&self) {
        self.0.store(2, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct ValkeyCodecBuilder {
    protocol: NegotiatedProtocol,
    direction: Direction,
}

impl ValkeyCodecBuilder {
    pub fn new(direction: Direction, protocol: NegotiatedProtocol) -> Self {
        ValkeyCodecBuilder {
            protocol,
            direction,
        }
    }
}

impl CodecBuilder for ValkeyCodecBuilder {
    type Item = ValkeyFrame;
    type Decoder = ValkeyDecoder;
    type Encoder = ValkeyEncoder;

    fn build(&self) -> (ValkeyDecoder, ValkeyEncoder) {
        (
            ValkeyDecoder::new(self.protocol.clone(), self.direction),
            ValkeyEncoder::new(self.direction),
        )
    }
}

pub struct ValkeyDecoder {
    frames: Vec<ValkeyFrame>,
    protocol: NegotiatedProtocol,
    direction: Direction,
}

impl ValkeyDecoder {
    pub fn new(protocol: NegotiatedProtocol, direction: Direction) -> Self {
        Self {
            frames: Vec::new(),
            protocol,
            direction,
        }
    }
}

impl Decoder for ValkeyDecoder {
    type Item = Vec<ValkeyFrame>;
    type Error = CodecReadError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let frame = match self.protocol.get() {
                ProtocolVersion::Resp2 => decode_mut(src)
                    .map_err(|e| {
                        CodecReadError::Parser(anyhow!(e).context("Error decoding resp2 frame"))
                    })?
                    .map(|(frame, _size, _bytes)| Ok(frame)),
                ProtocolVersion::Resp3 => resp3_decode_mut(src)
                    .map_err(|e| {
                        CodecReadError::Parser(anyhow!(e).context("Error decoding resp3 frame"))
                    })?
                    .map(|(frame, _size, _bytes)| normalize_resp3(frame)),
            };

            match frame {
                Some(frame) => {
                    let frame = frame.map_err(CodecReadError::Parser)?;
                    tracing::trace!("{}: incoming frame: {:?}", self.direction, frame);
                    self.frames.push(frame);
                }
                None => {
                    if self.frames.is_empty() || src.remaining() != 0 {
                        return Ok(None);
                    } else {
                        return Ok(Some(std::mem::take(&mut self.frames)));
                    }
                }
            }
        }
    }
}

/// Collapses a RESP3 reply into the RESP2 shape.
///
/// Attributes are dropped, maps and sets flatten into arrays, booleans map to
/// integers, doubles and big numbers to their textual forms. Out-of-band push
/// frames have no place on the single-response path and fail the stream.
fn normalize_resp3(frame: Resp3Frame) -> anyhow::Result<ValkeyFrame> {
    Ok(match frame {
        Resp3Frame::SimpleString { data, .. } => ValkeyFrame::SimpleString(data),
        Resp3Frame::SimpleError { data, .. } => ValkeyFrame::Error(data),
        Resp3Frame::BlobString { data, .. } => ValkeyFrame::BulkString(data),
        Resp3Frame::BlobError { data, .. } => {
            let text = Str::from_inner(data).map_err(|e| anyhow!("blob error not utf8: {e}"))?;
            ValkeyFrame::Error(text)
        }
        Resp3Frame::Number { data, .. } => ValkeyFrame::Integer(data),
        Resp3Frame::Null => ValkeyFrame::Null,
        Resp3Frame::Boolean { data, .. } => ValkeyFrame::Integer(data as i64),
        Resp3Frame::Double { data, .. } => ValkeyFrame::BulkString(data.to_string().into()),
        Resp3Frame::BigNumber { data, .. } => ValkeyFrame::BulkString(data),
        Resp3Frame::VerbatimString { data, .. } => ValkeyFrame::BulkString(data),
        Resp3Frame::Array { data, .. } => ValkeyFrame::Array(
            data.into_iter()
                .map(normalize_resp3)
                .collect::<anyhow::Result<Vec<_>>>()?,
        ),
        Resp3Frame::Map { data, .. } => {
            let mut flat = Vec::with_capacity(data.len() * 2);
            for (key, value) in data {
                flat.push(normalize_resp3(key)?);
                flat.push(normalize_resp3(value)?);
            }
            ValkeyFrame::Array(flat)
        }
        Resp3Frame::Set { data, .. } => ValkeyFrame::Array(
            data.into_iter()
                .map(normalize_resp3)
                .collect::<anyhow::Result<Vec<_>>>()?,
        ),
        Resp3Frame::Push { .. } => {
            return Err(anyhow!(
                "received out-of-band push frame on a request-response connection"
            ))
        }
        other => return Err(anyhow!("unexpected resp3 frame: {other:?}")),
    })
}

pub struct ValkeyEncoder {
    direction: Direction,
}

impl ValkeyEncoder {
    pub fn new(direction: Direction) -> Self {
        Self { direction }
    }
}

impl Encoder<Vec<ValkeyFrame>> for ValkeyEncoder {
    type Error = CodecWriteError;

    fn encode(&mut self, item: Vec<ValkeyFrame>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.into_iter().try_for_each(|frame| {
            tracing::trace!("{}: outgoing frame: {:?}", self.direction, frame);
            encode_bytes(dst, &frame)
                .map(|_| ())
                .map_err(|e| CodecWriteError::Encoder(anyhow!("encoding error: {e} - {frame:?}")))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolVersion;
    use hex_literal::hex;
    use pretty_assertions::assert_eq;

    const SET_MESSAGE: [u8; 45] = hex!("2a330d0a24330d0a5345540d0a2431360d0a6b65793a5f5f72616e645f696e745f5f0d0a24330d0a7878780d0a");

    const OK_MESSAGE: [u8; 5] = hex!("2b4f4b0d0a");

    const GET_MESSAGE: [u8; 36] =
        hex!("2a320d0a24330d0a4745540d0a2431360d0a6b65793a5f5f72616e645f696e745f5f0d0a");

    const INC_MESSAGE: [u8; 41] =
        hex!("2a320d0a24340d0a494e43520d0a2432300d0a636f756e7465723a5f5f72616e645f696e745f5f0d0a");

    fn build(version: ProtocolVersion) -> (ValkeyDecoder, ValkeyEncoder) {
        ValkeyCodecBuilder::new(Direction::Sink, NegotiatedProtocol::new(version)).build()
    }

    fn test_resp2_roundtrip(raw_frame: &[u8]) {
        let (mut decoder, mut encoder) = build(ProtocolVersion::Resp2);
        let frames = decoder
            .decode(&mut BytesMut::from(raw_frame))
            .unwrap()
            .unwrap();

        let mut dest = BytesMut::new();
        encoder.encode(frames, &mut dest).unwrap();
        assert_eq!(raw_frame, &dest);
    }

    #[test]
    fn resp2_roundtrips() {
        test_resp2_roundtrip(&OK_MESSAGE);
        test_resp2_roundtrip(&SET_MESSAGE);
        test_resp2_roundtrip(&GET_MESSAGE);
        test_resp2_roundtrip(&INC_MESSAGE);
    }

    #[test]
    fn partial_frame_is_buffered() {
        let (mut decoder, _) = build(ProtocolVersion::Resp2);

        let mut src = BytesMut::from(&SET_MESSAGE[..20]);
        assert_eq!(decoder.decode(&mut src).unwrap(), None);

        src.extend_from_slice(&SET_MESSAGE[20..]);
        let frames = decoder.decode(&mut src).unwrap().unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn pipelined_replies_decode_in_order() {
        let (mut decoder, _) = build(ProtocolVersion::Resp2);

        let mut src = BytesMut::from(&b":1\r\n:2\r\n:3\r\n"[..]);
        let frames = decoder.decode(&mut src).unwrap().unwrap();
        assert_eq!(
            frames,
            vec![
                ValkeyFrame::Integer(1),
                ValkeyFrame::Integer(2),
                ValkeyFrame::Integer(3)
            ]
        );
    }

    #[test]
    fn resp3_map_flattens() {
        let (mut decoder, _) = build(ProtocolVersion::Resp3);

        // %1\r\n+server\r\n+valkey\r\n
        let mut src = BytesMut::from(&b"%1\r\n+server\r\n+valkey\r\n"[..]);
        let frames = decoder.decode(&mut src).unwrap().unwrap();
        assert_eq!(
            frames,
            vec![ValkeyFrame::Array(vec![
                ValkeyFrame::SimpleString("server".into()),
                ValkeyFrame::SimpleString("valkey".into()),
            ])]
        );
    }

    #[test]
    fn resp3_scalars_normalize() {
        let (mut decoder, _) = build(ProtocolVersion::Resp3);

        let mut src = BytesMut::from(&b"#t\r\n_\r\n,3.5\r\n"[..]);
        let frames = decoder.decode(&mut src).unwrap().unwrap();
        assert_eq!(
            frames,
            vec![
                ValkeyFrame::Integer(1),
                ValkeyFrame::Null,
                ValkeyFrame::BulkString("3.5".into()),
            ]
        );
    }

    #[test]
    fn downgrade_switches_decoder() {
        let protocol = NegotiatedProtocol::new(ProtocolVersion::Resp3);
        let (mut decoder, _) =
            ValkeyCodecBuilder::new(Direction::Sink, protocol.clone()).build();

        let mut src = BytesMut::from(&b"-ERR unknown command 'HELLO'\r\n"[..]);
        let frames = decoder.decode(&mut src).unwrap().unwrap();
        assert!(matches!(frames[0], ValkeyFrame::Error(_)));

        protocol.downgrade_to_resp2();
        let mut src = BytesMut::from(&OK_MESSAGE[..]);
        let frames = decoder.decode(&mut src).unwrap().unwrap();
        assert_eq!(frames, vec![ValkeyFrame::SimpleString("OK".into())]);
    }
}
