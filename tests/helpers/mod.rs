#![allow(dead_code)]

//! An in-process scripted server for integration tests.
//!
//! Speaks just enough RESP2 to exercise the client: it decodes inbound
//! command arrays with the crate's own codec, answers `HELLO` the way a
//! pre-RESP3 server would (so every test also covers the protocol
//! downgrade), and delegates everything else to the test's handler.

use futures::{SinkExt, StreamExt};
use shoal::codec::valkey::{NegotiatedProtocol, ValkeyCodecBuilder};
use shoal::codec::{CodecBuilder, Direction};
use shoal::config::ProtocolVersion;
use shoal::frame::ValkeyFrame;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder, Framed};

/// What the handler wants done with one command.
pub enum Reply {
    Frame(ValkeyFrame),
    /// Reply after a delay; later commands queue behind it, exactly like a
    /// wedged single-threaded server.
    Delayed(Duration, ValkeyFrame),
    /// Never reply.
    Silent,
}

pub type Handler = dyn Fn(&[Vec<u8>]) -> Reply + Send + Sync;

pub struct MockServer {
    pub address: String,
    accept_task: JoinHandle<()>,
    shutdown: Arc<Notify>,
    commands: Arc<Mutex<Vec<Vec<String>>>>,
}

impl MockServer {
    pub async fn spawn(
        handler: impl Fn(&[Vec<u8>]) -> Reply + Send + Sync + 'static,
    ) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let handler: Arc<Handler> = Arc::new(handler);
        let commands: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let shutdown = Arc::new(Notify::new());

        let accept_task = {
            let handler = handler.clone();
            let commands = commands.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let (stream, _) = match listener.accept().await {
                        Ok(accepted) => accepted,
                        Err(_) => return,
                    };
                    tokio::spawn(serve_connection(
                        stream,
                        handler.clone(),
                        commands.clone(),
                        shutdown.clone(),
                    ));
                }
            })
        };

        MockServer {
            address,
            accept_task,
            shutdown,
            commands,
        }
    }

    /// Every command received so far, as lossy strings: `["GET", "foo"]`.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().unwrap().clone()
    }

    pub fn commands_named(&self, name: &str) -> usize {
        self.commands()
            .iter()
            .filter(|parts| parts.first().map(|n| n == name).unwrap_or(false))
            .count()
    }

    /// Stops accepting and drops every open connection.
    pub fn shutdown(&self) {
        self.accept_task.abort();
        self.shutdown.notify_waiters();
    }
}

async fn serve_connection(
    stream: TcpStream,
    handler: Arc<Handler>,
    commands: Arc<Mutex<Vec<Vec<String>>>>,
    shutdown: Arc<Notify>,
) {
    let (decoder, encoder) = ValkeyCodecBuilder::new(
        Direction::Source,
        NegotiatedProtocol::new(ProtocolVersion::Resp2),
    )
    .build();
    let mut framed = Framed::new(stream, FramedCodec { decoder, encoder });

    loop {
        let frames = tokio::select! {
            _ = shutdown.notified() => return,
            next = framed.next() => match next {
                Some(Ok(frames)) => frames,
                _ => return,
            },
        };

        for frame in frames {
            let args = match flatten(frame) {
                Some(args) => args,
                None => return,
            };
            commands.lock().unwrap().push(
                args.iter()
                    .map(|a| String::from_utf8_lossy(a).into_owned())
                    .collect(),
            );

            let reply = if args[0].eq_ignore_ascii_case(b"HELLO") {
                // A pre-RESP3 server; the client downgrades.
                Reply::Frame(ValkeyFrame::Error("ERR unknown command 'HELLO'".into()))
            } else {
                handler(&args)
            };

            match reply {
                Reply::Frame(frame) => {
                    if framed.send(vec![frame]).await.is_err() {
                        return;
                    }
                }
                Reply::Delayed(delay, frame) => {
                    tokio::time::sleep(delay).await;
                    if framed.send(vec![frame]).await.is_err() {
                        return;
                    }
                }
                Reply::Silent => {}
            }
        }
    }
}

fn flatten(frame: ValkeyFrame) -> Option<Vec<Vec<u8>>> {
    match frame {
        ValkeyFrame::Array(parts) => parts
            .into_iter()
            .map(|part| match part {
                ValkeyFrame::BulkString(bytes) => Some(bytes.to_vec()),
                ValkeyFrame::SimpleString(bytes) => Some(bytes.to_vec()),
                _ => None,
            })
            .collect(),
        _ => None,
    }
}

/// Combines the crate's decoder and encoder into one codec for `Framed`.
struct FramedCodec {
    decoder: shoal::codec::valkey::ValkeyDecoder,
    encoder: shoal::codec::valkey::ValkeyEncoder,
}

impl tokio_util::codec::Decoder for FramedCodec {
    type Item = Vec<ValkeyFrame>;
    type Error = shoal::codec::CodecReadError;

    fn decode(
        &mut self,
        src: &mut bytes::BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode(src)
    }
}

impl tokio_util::codec::Encoder<Vec<ValkeyFrame>> for FramedCodec {
    type Error = shoal::codec::CodecWriteError;

    fn encode(
        &mut self,
        item: Vec<ValkeyFrame>,
        dst: &mut bytes::BytesMut,
    ) -> Result<(), Self::Error> {
        self.encoder.encode(item, dst)
    }
}

/// Builds a `CLUSTER SLOTS` reply: `(start, end, primary, replicas)` rows.
pub fn cluster_slots_reply(shards: &[(u16, u16, &str, &[&str])]) -> ValkeyFrame {
    fn node_entry(address: &str) -> ValkeyFrame {
        let (host, port) = address.rsplit_once(':').unwrap();
        ValkeyFrame::Array(vec![
            ValkeyFrame::BulkString(host.to_string().into()),
            ValkeyFrame::Integer(port.parse().unwrap()),
            ValkeyFrame::BulkString("0000000000000000000000000000000000000000".into()),
        ])
    }

    ValkeyFrame::Array(
        shards
            .iter()
            .map(|(start, end, primary, replicas)| {
                let mut row = vec![
                    ValkeyFrame::Integer(*start as i64),
                    ValkeyFrame::Integer(*end as i64),
                    node_entry(primary),
                ];
                row.extend(replicas.iter().map(|replica| node_entry(replica)));
                ValkeyFrame::Array(row)
            })
            .collect(),
    )
}

pub fn bulk(value: &str) -> ValkeyFrame {
    ValkeyFrame::BulkString(value.to_string().into())
}

pub fn ok() -> ValkeyFrame {
    ValkeyFrame::SimpleString("OK".into())
}
