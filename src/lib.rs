//! A shard-aware client core for Valkey and Redis compatible servers.
//!
//! Shoal maintains a persistent, fully pipelined connection to every server
//! node it talks to, routes each request to the node that owns it (slot-aware
//! in cluster mode), retries redirected requests with bounded backoff and
//! enforces a per-request deadline.
//!
//! The main entry points:
//! * [`client::Client`], the dispatcher: [`client::Client::submit`] sends a
//!   single command, [`client::Client::submit_transaction`] an atomic batch.
//! * [`config::ClientConfig`], every recognized connection option.
//! * [`routing::RoutingSpec`], per-request routing overrides.
//! * [`listener`], a unix-socket front end speaking the length-delimited
//!   request envelope, for drivers living in another process.
//!
//! Command builders are intentionally minimal ([`commands::cmd`]): the core
//! treats commands as opaque values and only inspects them for routing.

// Accidentally printing would break embedders that own stdout
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]

pub mod client;
pub mod codec;
pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod listener;
pub mod protocol;
pub mod retry;
pub mod routing;
pub mod slots;
pub mod tcp;
pub mod tls;
pub mod topology;
pub mod transaction;

pub use client::Client;
pub use commands::{cmd, Command};
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use routing::RoutingSpec;
