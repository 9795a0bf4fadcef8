//! The unix-socket front end for out-of-process drivers.
//!
//! Drivers connect, write length-delimited request envelopes and read the
//! matching responses back, correlated by the `callback_idx` they chose.
//! Responses are written as they complete, not in request order; the
//! envelope exists precisely so drivers can pipeline without ordering.
//!
//! Each request runs on its own task, which is also where the reply frame is
//! materialized into a serializable [`Value`](crate::protocol::Value); the
//! socket's reader task never blocks on decoding a large reply.

use crate::client::Client;
use crate::codec::envelope::ListenerCodec;
use crate::commands::Command;
use crate::error::Error;
use crate::frame::ValkeyFrame;
use crate::protocol::{RequestEnvelope, RequestKind, ResponseEnvelope};
use crate::routing::RoutingSpec;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

/// Keeps the listener alive; [`close`] stops accepting, disconnects every
/// driver and removes the socket file.
///
/// [`close`]: ListenerHandle::close
pub struct ListenerHandle {
    accept_task: JoinHandle<()>,
    path: PathBuf,
}

impl ListenerHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn close(self) {
        self.accept_task.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Binds `path` and serves envelope requests against `client`.
pub fn start(path: impl AsRef<Path>, client: Client) -> Result<ListenerHandle, Error> {
    let path = path.as_ref().to_path_buf();
    let listener = UnixListener::bind(&path)
        .map_err(|e| Error::Configuration(format!("failed to bind {}: {e}", path.display())))?;

    let accept_task = tokio::spawn(accept_loop(listener, client));
    Ok(ListenerHandle { accept_task, path })
}

async fn accept_loop(listener: UnixListener, client: Client) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(drive_driver_connection(stream, client.clone()));
            }
            Err(err) => {
                warn!("envelope listener accept failed: {err}");
                return;
            }
        }
    }
}

async fn drive_driver_connection(stream: UnixStream, client: Client) {
    let framed = Framed::new(stream, ListenerCodec::new());
    let (sink, stream) = framed.split();

    let (response_tx, response_rx) = mpsc::unbounded_channel();
    tokio::spawn(write_responses(sink, response_rx));

    read_requests(stream, client, response_tx).await;
}

async fn read_requests(
    mut stream: SplitStream<Framed<UnixStream, ListenerCodec>>,
    client: Client,
    response_tx: mpsc::UnboundedSender<ResponseEnvelope>,
) {
    while let Some(result) = stream.next().await {
        match result {
            Ok(requests) => {
                for request in requests {
                    let client = client.clone();
                    let response_tx = response_tx.clone();
                    tokio::spawn(async move {
                        let response = handle_request(&client, request).await;
                        let _ = response_tx.send(response);
                    });
                }
            }
            Err(err) => {
                debug!("driver connection closed: {err:?}");
                return;
            }
        }
    }
}

async fn write_responses(
    mut sink: SplitSink<Framed<UnixStream, ListenerCodec>, Vec<ResponseEnvelope>>,
    mut response_rx: mpsc::UnboundedReceiver<ResponseEnvelope>,
) {
    while let Some(first) = response_rx.recv().await {
        let mut responses = vec![first];
        loop {
            match response_rx.try_recv() {
                Ok(response) => responses.push(response),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        if let Err(err) = sink.send(responses).await {
            debug!("failed to write responses to driver: {err:?}");
            return;
        }
    }
}

async fn handle_request(client: &Client, request: RequestEnvelope) -> ResponseEnvelope {
    let callback_idx = request.callback_idx;

    let work = async {
        match request.kind {
            RequestKind::Single(spec) => {
                client
                    .submit(Command::from_parts(spec.parts), request.route)
                    .await
            }
            RequestKind::Transaction(specs) => {
                let commands = specs
                    .into_iter()
                    .map(|spec| Command::from_parts(spec.parts))
                    .collect();
                client
                    .submit_transaction(commands, request.route)
                    .await
                    .map(|replies| match replies {
                        Some(replies) => ValkeyFrame::Array(replies),
                        // A watched key changed; the driver sees null.
                        None => ValkeyFrame::Null,
                    })
            }
            RequestKind::ScriptInvocation { hash, keys, args } => {
                let route = request.route.or_else(|| {
                    keys.first().map(|key| RoutingSpec::ByKey {
                        key: key.clone(),
                        prefer_replica: false,
                    })
                });
                let mut command = crate::commands::cmd("EVALSHA")
                    .arg(hash)
                    .arg(keys.len() as u64);
                for key in keys {
                    command = command.arg(key);
                }
                for arg in args {
                    command = command.arg(arg);
                }
                client.submit(command, route).await
            }
        }
    };

    // A driver-specified deadline tightens (never widens) the configured one.
    let result = match request.timeout_ms {
        Some(timeout_ms) => {
            match tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), work).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout),
            }
        }
        None => work.await,
    };

    ResponseEnvelope::from_result(callback_idx, result)
}
