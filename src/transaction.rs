//! The transaction engine: an ordered command batch executed atomically via
//! MULTI/EXEC.
//!
//! The whole batch is written to one node as a single pipelined drain. There
//! are no intra-transaction retries: the server either executes everything
//! or reports why it did not. Cross-slot batches are the server's call to
//! reject (CROSSSLOT), which surfaces unchanged.

use crate::client::Client;
use crate::commands::{cmd, Command};
use crate::connection::ConnectionError;
use crate::error::Error;
use crate::frame::{error_from_reply, expect_ok, ValkeyFrame};
use crate::routing::RoutingSpec;
use tokio::time::Instant;

/// An ordered list of commands submitted as one atomic unit.
///
/// ```no_run
/// # use shoal::{cmd, Client};
/// # use shoal::transaction::Transaction;
/// # async fn example(client: Client) -> shoal::Result<()> {
/// let replies = Transaction::new()
///     .command(cmd("SET").arg("k").arg(1i64))
///     .command(cmd("INCR").arg("k"))
///     .exec(&client)
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default, Clone)]
pub struct Transaction {
    commands: Vec<Command>,
    routing: Option<RoutingSpec>,
}

impl Transaction {
    pub fn new() -> Self {
        Transaction::default()
    }

    pub fn command(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    /// Pins routing instead of deriving it from the first keyed command.
    pub fn route(mut self, routing: RoutingSpec) -> Self {
        self.routing = Some(routing);
        self
    }

    /// Runs the batch. `None` means a watched key changed and the server
    /// discarded the transaction.
    pub async fn exec(self, client: &Client) -> Result<Option<Vec<ValkeyFrame>>, Error> {
        client.submit_transaction(self.commands, self.routing).await
    }
}

pub(crate) async fn execute(
    client: &Client,
    commands: Vec<Command>,
    routing: Option<RoutingSpec>,
    _deadline: Instant,
) -> Result<Option<Vec<ValkeyFrame>>, Error> {
    if commands.is_empty() {
        return Err(Error::Request("cannot execute an empty transaction".into()));
    }

    let address = client.transaction_address(&commands, routing).await?;
    let connection = client.topology().connection_for(&address).await?;

    let mut frames = Vec::with_capacity(commands.len() + 2);
    frames.push(cmd("MULTI").to_frame());
    for command in &commands {
        frames.push(command.to_frame());
    }
    frames.push(cmd("EXEC").to_frame());

    let rx = connection.send_batch(frames)?;
    let mut replies = rx
        .await
        .map_err(|_| Error::Connection(ConnectionError::LocalClosed))??;

    let exec_reply = replies.pop().expect("EXEC reply missing from batch");
    expect_ok(&replies[0]).map_err(|err| match err {
        Error::Request(message) => Error::ExecAbort(message),
        other => other,
    })?;

    // A command the server refused to queue aborts EXEC; keep the original
    // refusal, it is more useful than the generic EXECABORT message.
    let queue_error = replies.iter().skip(1).find_map(|frame| match frame {
        ValkeyFrame::Error(message) => Some(message.to_string()),
        _ => None,
    });

    match exec_reply {
        ValkeyFrame::Null => Ok(None),
        ValkeyFrame::Array(items) => Ok(Some(items)),
        ValkeyFrame::Error(message) => {
            if let Some(queue_error) = queue_error {
                Err(Error::ExecAbort(queue_error))
            } else {
                Err(error_from_reply(&message))
            }
        }
        other => Err(Error::Request(format!(
            "unexpected EXEC reply: {other:?}"
        ))),
    }
}
