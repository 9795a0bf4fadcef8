//! Codec types for the two wire formats the crate speaks: RESP to server
//! nodes, and the length-delimited request envelope to out-of-process
//! drivers.

use core::fmt;
use tokio_util::codec::{Decoder, Encoder};

pub mod envelope;
pub mod valkey;

/// Which half of a conversation a codec instance sits on. Only used to label
/// trace output; the framing is symmetric.
#[derive(Eq, PartialEq, Copy, Clone)]
pub enum Direction {
    /// Decoding requests, encoding responses (the envelope listener).
    Source,
    /// Encoding requests, decoding responses (connections to server nodes).
    Sink,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sink => write!(f, "Sink"),
            Self::Source => write!(f, "Source"),
        }
    }
}

#[derive(Debug)]
pub enum CodecReadError {
    /// The codec failed to parse a received frame
    Parser(anyhow::Error),
    /// The tcp connection returned an error
    Io(std::io::Error),
}

impl From<std::io::Error> for CodecReadError {
    fn from(err: std::io::Error) -> Self {
        CodecReadError::Io(err)
    }
}

#[derive(Debug)]
pub enum CodecWriteError {
    /// The codec failed to encode a frame
    Encoder(anyhow::Error),
    /// The tcp connection returned an error
    Io(std::io::Error),
}

impl From<std::io::Error> for CodecWriteError {
    fn from(err: std::io::Error) -> Self {
        CodecWriteError::Io(err)
    }
}

// TODO: Replace with trait_alias (rust-lang/rust#41517).
pub trait DecoderHalf<T>: Decoder<Item = T, Error = CodecReadError> + Send {}
impl<T, D: Decoder<Item = T, Error = CodecReadError> + Send> DecoderHalf<T> for D {}

// TODO: Replace with trait_alias (rust-lang/rust#41517).
pub trait EncoderHalf<T>: Encoder<T, Error = CodecWriteError> + Send {}
impl<T, E: Encoder<T, Error = CodecWriteError> + Send> EncoderHalf<T> for E {}

pub trait CodecBuilder: Clone + Send {
    type Item;
    type Decoder: DecoderHalf<Vec<Self::Item>>;
    type Encoder: EncoderHalf<Vec<Self::Item>>;

    fn build(&self) -> (Self::Decoder, Self::Encoder);
}
