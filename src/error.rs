//! The error taxonomy surfaced to callers.

use crate::connection::ConnectionError;

pub type Result<T> = std::result::Result<T, Error>;

/// What went wrong with a single request, or with the client as a whole.
///
/// `Connection` and `Timeout` make the client attempt connection-level
/// recovery (reconnect with backoff) but never an automatic re-send of the
/// request itself; the only requests re-dispatched are those the server
/// explicitly redirected with MOVED/ASK.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// The socket was not usable. The request is not guaranteed to have been
    /// observed by the server.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The per-request deadline elapsed before a response arrived.
    #[error("request timed out")]
    Timeout,

    /// The server aborted a transaction before EXEC could run.
    #[error("transaction aborted: {0}")]
    ExecAbort(String),

    /// The server answered with an error reply. The message is passed through
    /// unchanged (WRONGTYPE, NOAUTH, CROSSSLOT, ...).
    #[error("{0}")]
    Request(String),

    /// The request chased redirections past the allowed bound.
    #[error("request exceeded the maximum of {0} redirections")]
    MaxRedirections(u8),

    /// The client is closed or closing. Terminal.
    #[error("client is closed")]
    Closing,

    /// The options given at construction do not describe a usable client.
    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl Error {
    /// True when submitting again can never succeed on this client.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::Closing | Error::Configuration(_))
    }
}

/// Well-known server error prefixes the core reacts to during handshakes.
///
/// Everything else is passed through to the caller as [`Error::Request`].
#[derive(thiserror::Error, Clone, Debug, PartialEq)]
pub enum ServerError {
    #[error("authentication is required")]
    NotAuthenticated,

    #[error("user not authorized to perform action")]
    NotAuthorized,

    #[error("username or password is incorrect")]
    BadCredentials,

    #[error("{0}")]
    Other(String),
}

impl ServerError {
    pub fn from_message(error: &str) -> ServerError {
        match error.split_once(' ').map(|x| x.0) {
            Some("NOAUTH") => ServerError::NotAuthenticated,
            Some("NOPERM") => ServerError::NotAuthorized,
            Some("WRONGPASS") => ServerError::BadCredentials,
            _ => ServerError::Other(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_prefixes() {
        assert_eq!(
            ServerError::from_message("NOAUTH Authentication required."),
            ServerError::NotAuthenticated
        );
        assert_eq!(
            ServerError::from_message("WRONGPASS invalid username-password pair"),
            ServerError::BadCredentials
        );
        assert_eq!(
            ServerError::from_message("WRONGTYPE Operation against a key"),
            ServerError::Other("WRONGTYPE Operation against a key".into())
        );
    }
}
