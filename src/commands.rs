//! Opaque command values.
//!
//! The core never interprets a command beyond what routing needs: its name
//! and its first key. The full per-command builder surface lives in the
//! language bindings; [`cmd`] is the escape hatch they are built on.

use crate::frame::{query_type, QueryType, ValkeyFrame};
use crate::routing::RoutingSpec;
use bytes::Bytes;

/// Builds a command from its name: `cmd("SET").arg("foo").arg("bar")`.
pub fn cmd(name: &str) -> Command {
    Command {
        parts: vec![Bytes::copy_from_slice(name.as_bytes())],
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    parts: Vec<Bytes>,
}

impl Command {
    pub fn arg(mut self, arg: impl IntoArg) -> Self {
        self.parts.push(arg.into_arg());
        self
    }

    /// Rebuilds a command a driver sent over the envelope.
    pub fn from_parts(parts: Vec<Vec<u8>>) -> Self {
        Command {
            parts: parts.into_iter().map(Bytes::from).collect(),
        }
    }

    pub fn name(&self) -> &[u8] {
        self.parts.first().map(|p| p.as_ref()).unwrap_or(b"")
    }

    /// The first key, taken as the argument after the name. Commands without
    /// keys have none.
    pub fn key(&self) -> Option<&[u8]> {
        self.parts.get(1).map(|p| p.as_ref())
    }

    pub fn query_type(&self) -> QueryType {
        query_type(self.name())
    }

    /// The wire form: an array of bulk strings.
    pub fn to_frame(&self) -> ValkeyFrame {
        ValkeyFrame::Array(
            self.parts
                .iter()
                .map(|part| ValkeyFrame::BulkString(part.clone()))
                .collect(),
        )
    }

    /// The routing the dispatcher uses when the caller does not override it.
    /// Key-less administrative commands touch all primaries or all nodes the
    /// same way the server documents them; everything else routes by key
    /// when it has one.
    pub fn default_routing(&self) -> RoutingSpec {
        match self.name().to_ascii_uppercase().as_slice() {
            b"FLUSHALL" | b"FLUSHDB" | b"DBSIZE" | b"KEYS" | b"SCRIPT" => RoutingSpec::AllPrimaries,
            b"BGSAVE" | b"SAVE" | b"BGREWRITEAOF" | b"LASTSAVE" | b"ACL" => RoutingSpec::AllNodes,
            b"PING" | b"ECHO" | b"CLIENT" | b"HELLO" | b"AUTH" | b"SELECT" | b"CLUSTER"
            | b"INFO" | b"TIME" => RoutingSpec::Random,
            _ => match self.key() {
                Some(key) => RoutingSpec::ByKey {
                    key: key.to_vec(),
                    prefer_replica: false,
                },
                None => RoutingSpec::Random,
            },
        }
    }
}

pub trait IntoArg {
    fn into_arg(self) -> Bytes;
}

impl IntoArg for &str {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl IntoArg for String {
    fn into_arg(self) -> Bytes {
        Bytes::from(self)
    }
}

impl IntoArg for &[u8] {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl IntoArg for Vec<u8> {
    fn into_arg(self) -> Bytes {
        Bytes::from(self)
    }
}

impl IntoArg for Bytes {
    fn into_arg(self) -> Bytes {
        self
    }
}

impl IntoArg for i64 {
    fn into_arg(self) -> Bytes {
        Bytes::from(self.to_string())
    }
}

impl IntoArg for u64 {
    fn into_arg(self) -> Bytes {
        Bytes::from(self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn builds_the_wire_frame() {
        let command = cmd("SET").arg("foo").arg(42i64);
        assert_eq!(
            command.to_frame(),
            ValkeyFrame::Array(vec![
                ValkeyFrame::BulkString("SET".into()),
                ValkeyFrame::BulkString("foo".into()),
                ValkeyFrame::BulkString("42".into()),
            ])
        );
    }

    #[test]
    fn default_routing_uses_the_first_key() {
        assert_eq!(
            cmd("GET").arg("foo").default_routing(),
            RoutingSpec::ByKey {
                key: b"foo".to_vec(),
                prefer_replica: false
            }
        );
        assert_eq!(cmd("PING").default_routing(), RoutingSpec::Random);
        assert_eq!(cmd("FLUSHALL").default_routing(), RoutingSpec::AllPrimaries);
    }

    #[test]
    fn envelope_commands_rebuild() {
        let command = Command::from_parts(vec![b"INCR".to_vec(), b"counter".to_vec()]);
        assert_eq!(command.name(), b"INCR");
        assert_eq!(command.key(), Some(&b"counter"[..]));
        assert_eq!(command.query_type(), QueryType::Write);
    }
}
