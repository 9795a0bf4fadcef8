//! TCP dialing for node connections.

use crate::connection::ConnectionError;
use crate::error::Error;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;

/// Dials `destination`, bounding the whole attempt with `connect_timeout`.
///
/// Every failure mode, the timeout included, surfaces as a `Connection`
/// error: an unreachable node is not a caller mistake, it is what the
/// topology's backoff schedule exists for.
pub async fn dial<A: ToSocketAddrs + std::fmt::Debug>(
    connect_timeout: Duration,
    destination: A,
) -> Result<TcpStream, Error> {
    match timeout(connect_timeout, TcpStream::connect(&destination)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => Err(connect_error(err)),
        Err(_) => Err(connect_error(std::io::Error::new(
            ErrorKind::TimedOut,
            format!("no response from {destination:?} within {connect_timeout:?}"),
        ))),
    }
}

pub(crate) fn connect_error(err: std::io::Error) -> Error {
    Error::Connection(ConnectionError::Io(Arc::new(err)))
}
