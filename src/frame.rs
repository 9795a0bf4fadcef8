//! Frame level helpers shared by the codec, router and dispatcher.
//!
//! The crate speaks RESP2-shaped frames everywhere; RESP3 replies are
//! normalized into this shape by the decoder (see [`crate::codec::valkey`]).

pub use redis_protocol::resp2::types::Frame as ValkeyFrame;

use crate::error::Error;

/// Whether a command only reads state. Read commands are safe to re-dispatch
/// after a connection dropped before the write was acknowledged; everything
/// else is treated as non-idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    Read,
    Write,
}

#[inline]
pub fn query_type(command_name: &[u8]) -> QueryType {
    match command_name.to_ascii_uppercase().as_slice() {
        b"APPEND" | b"BITCOUNT" | b"STRLEN" | b"GET" | b"GETRANGE" | b"MGET" | b"LRANGE"
        | b"LINDEX" | b"LLEN" | b"SCARD" | b"SISMEMBER" | b"SMEMBERS" | b"SUNION" | b"SINTER"
        | b"ZCARD" | b"ZCOUNT" | b"ZRANGE" | b"ZRANK" | b"ZSCORE" | b"ZRANGEBYSCORE" | b"HGET"
        | b"HGETALL" | b"HEXISTS" | b"HKEYS" | b"HLEN" | b"HSTRLEN" | b"HVALS" | b"PFCOUNT"
        | b"EXISTS" | b"TTL" | b"PTTL" | b"TYPE" | b"PING" | b"ECHO" => QueryType::Read,
        _ => QueryType::Write,
    }
}

/// A cluster redirection reply.
///
/// MOVED is permanent (the slot migrated, the map must be updated), ASK is a
/// single-hop redirect during migration and must not touch the map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirection {
    Moved { slot: u16, server: String },
    Ask { slot: u16, server: String },
}

impl Redirection {
    pub fn parse(frame: &ValkeyFrame) -> Option<Redirection> {
        match frame {
            ValkeyFrame::Error(err) => {
                let mut tokens = err.split(' ');
                match tokens.next()? {
                    "MOVED" => Some(Redirection::Moved {
                        slot: tokens.next()?.parse().ok()?,
                        server: tokens.next()?.to_owned(),
                    }),
                    "ASK" => Some(Redirection::Ask {
                        slot: tokens.next()?.parse().ok()?,
                        server: tokens.next()?.to_owned(),
                    }),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

/// Maps an error reply onto the caller-facing taxonomy.
pub fn error_from_reply(message: &str) -> Error {
    if message.starts_with("EXECABORT") {
        Error::ExecAbort(message.to_string())
    } else {
        Error::Request(message.to_string())
    }
}

/// Fails unless the frame is the `+OK` the handshake commands reply with.
pub fn expect_ok(frame: &ValkeyFrame) -> Result<(), Error> {
    match frame {
        ValkeyFrame::SimpleString(s) if s.as_ref() == b"OK" => Ok(()),
        ValkeyFrame::Error(e) => Err(error_from_reply(e)),
        other => Err(Error::Request(format!("expected OK but got: {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_moved() {
        let frame = ValkeyFrame::Error("MOVED 3999 127.0.0.1:6381".into());
        assert_eq!(
            Redirection::parse(&frame),
            Some(Redirection::Moved {
                slot: 3999,
                server: "127.0.0.1:6381".into()
            })
        );
    }

    #[test]
    fn parses_ask() {
        let frame = ValkeyFrame::Error("ASK 3999 127.0.0.1:6381".into());
        assert_eq!(
            Redirection::parse(&frame),
            Some(Redirection::Ask {
                slot: 3999,
                server: "127.0.0.1:6381".into()
            })
        );
    }

    #[test]
    fn plain_errors_are_not_redirections() {
        let frame = ValkeyFrame::Error("ERR unknown command".into());
        assert_eq!(Redirection::parse(&frame), None);
        assert_eq!(Redirection::parse(&ValkeyFrame::Null), None);
    }

    #[test]
    fn classifies_reads() {
        assert_eq!(query_type(b"get"), QueryType::Read);
        assert_eq!(query_type(b"MGET"), QueryType::Read);
        assert_eq!(query_type(b"SET"), QueryType::Write);
        assert_eq!(query_type(b"INCR"), QueryType::Write);
    }
}
