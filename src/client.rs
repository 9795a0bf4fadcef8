//! The dispatcher: accepts requests, routes them, enforces deadlines, and
//! chases redirections.
//!
//! A submitted request may suspend at four points: waiting for its target
//! node to reach Ready, waiting for the writer drain, waiting for the
//! response frame, and waiting for an in-flight topology refresh. The
//! per-request deadline bounds all of them together.
//!
//! Retry discipline: a request that failed before it was ever queued on a
//! connection is safe to try again anywhere. Once queued, only MOVED/ASK
//! redirections re-dispatch it, plus read-classified commands whose
//! connection dropped, so non-idempotent commands are delivered at most
//! once.

use crate::commands::Command;
use crate::config::ClientConfig;
use crate::error::Error;
use crate::frame::{error_from_reply, QueryType, Redirection, ValkeyFrame};
use crate::routing::{resolve, RouteTarget, RoutingSpec};
use crate::slots::slot_of;
use crate::topology::Topology;
use futures::future::join_all;
use metrics::{counter, Counter};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

/// How many MOVED/ASK hops (or safe re-dispatches) one request may take.
const MAX_REDIRECTIONS: u8 = 5;

/// A handle to the client; cheap to clone, all clones share the same
/// connections. [`close`] ends them all.
///
/// [`close`]: Client::close
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

struct ClientInner {
    config: Arc<ClientConfig>,
    topology: Arc<Topology>,
    closed: AtomicBool,
    rng: Mutex<SmallRng>,
    failed_requests: Counter,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    /// Validates `config`, discovers the topology and eagerly establishes
    /// the first connection so configuration and credential problems
    /// surface here rather than on the first request.
    pub async fn connect(config: ClientConfig) -> Result<Client, Error> {
        config.validate()?;
        let config = Arc::new(config);
        let topology = Arc::new(Topology::new(config.clone())?);

        if config.cluster_mode {
            topology.refresh_slots().await?;
        } else {
            let address = config.seed_addresses().remove(0);
            topology.connection_for(&address).await?;
        }

        let client = Client {
            inner: Arc::new(ClientInner {
                topology: topology.clone(),
                closed: AtomicBool::new(false),
                rng: Mutex::new(SmallRng::from_entropy()),
                failed_requests: counter!("shoal_failed_requests_count"),
                background: Mutex::new(Vec::new()),
                config: config.clone(),
            }),
        };

        let mut background = client.inner.background.lock().unwrap();
        if let Some(interval_ms) = config.periodic_refresh_ms {
            let topology = topology.clone();
            background.push(tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
                interval.tick().await;
                loop {
                    interval.tick().await;
                    if let Err(err) = topology.refresh_slots().await {
                        debug!("periodic topology refresh failed: {err}");
                    }
                }
            }));
        }
        {
            let topology = topology.clone();
            let idle_timeout = config.idle_timeout().max(Duration::from_millis(2));
            background.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(idle_timeout / 2);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    topology.reap_idle(idle_timeout).await;
                }
            }));
        }
        drop(background);

        Ok(client)
    }

    /// Sends one command and awaits its reply.
    ///
    /// Routing defaults to what the command implies (its first key, or
    /// Random/fan-out for keyless commands); pass `routing` to override.
    /// Fan-out replies come back as an ordered array of `[address, reply]`
    /// pairs, and any node-level failure fails the whole request; use
    /// [`Client::submit_per_node`] to opt into per-node results instead.
    pub async fn submit(
        &self,
        command: Command,
        routing: Option<RoutingSpec>,
    ) -> Result<ValkeyFrame, Error> {
        let deadline = self.start_request()?;
        let result = timeout_at(deadline, self.dispatch(command, routing, deadline))
            .await
            .unwrap_or(Err(Error::Timeout));
        self.count_failure(&result);
        result
    }

    /// Fan-out with per-node results: one entry per target address, in
    /// routing order, each node's own success or failure.
    pub async fn submit_per_node(
        &self,
        command: Command,
        routing: RoutingSpec,
    ) -> Result<Vec<(String, Result<ValkeyFrame, Error>)>, Error> {
        let deadline = self.start_request()?;
        let addresses = match self.resolve(&routing).await? {
            RouteTarget::Fanout(addresses) => addresses,
            RouteTarget::Single { address, .. } => vec![address],
        };
        let result = timeout_at(deadline, self.fan_out(&command, addresses, deadline))
            .await
            .map_err(|_| Error::Timeout);
        self.count_failure(&result);
        result
    }

    /// Runs `commands` as one atomic MULTI/EXEC batch on a single node.
    ///
    /// Returns the EXEC reply array, or `None` when a watched key changed
    /// and the server discarded the transaction.
    pub async fn submit_transaction(
        &self,
        commands: Vec<Command>,
        routing: Option<RoutingSpec>,
    ) -> Result<Option<Vec<ValkeyFrame>>, Error> {
        let deadline = self.start_request()?;
        let result = timeout_at(
            deadline,
            crate::transaction::execute(self, commands, routing, deadline),
        )
        .await
        .unwrap_or(Err(Error::Timeout));
        self.count_failure(&result);
        result
    }

    /// Rejects every pending request with `Closing`, ends every socket and
    /// makes further submissions fail synchronously.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for handle in self.inner.background.lock().unwrap().drain(..) {
            handle.abort();
        }
        self.inner.topology.close_all().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn topology(&self) -> &Arc<Topology> {
        &self.inner.topology
    }

    fn start_request(&self) -> Result<Instant, Error> {
        if self.is_closed() {
            return Err(Error::Closing);
        }
        Ok(Instant::now() + self.inner.config.request_timeout())
    }

    fn count_failure<T>(&self, result: &Result<T, Error>) {
        if result.is_err() {
            self.inner.failed_requests.increment(1);
        }
    }

    pub(crate) async fn resolve(&self, routing: &RoutingSpec) -> Result<RouteTarget, Error> {
        let slot_map = self.inner.topology.slot_map().await;
        let mut rng = self.inner.rng.lock().unwrap();
        resolve(routing, &slot_map, self.inner.config.read_from, &mut rng)
    }

    async fn dispatch(
        &self,
        command: Command,
        routing: Option<RoutingSpec>,
        deadline: Instant,
    ) -> Result<ValkeyFrame, Error> {
        let routing = match routing {
            None | Some(RoutingSpec::PrimaryFirstOfBatch) => command.default_routing(),
            Some(routing) => routing,
        };

        match self.resolve(&routing).await? {
            RouteTarget::Single { address, fallback } => {
                self.dispatch_single(&command, address, fallback, deadline)
                    .await
            }
            RouteTarget::Fanout(addresses) => {
                let responses = self.fan_out(&command, addresses, deadline).await;
                let mut entries = Vec::with_capacity(responses.len());
                for (address, response) in responses {
                    let response = response?;
                    entries.push(ValkeyFrame::Array(vec![
                        ValkeyFrame::BulkString(address.into_bytes().into()),
                        response,
                    ]));
                }
                Ok(ValkeyFrame::Array(entries))
            }
        }
    }

    /// One command to one node, chasing redirections up to the bound.
    pub(crate) async fn dispatch_single(
        &self,
        command: &Command,
        mut address: String,
        mut fallback: Option<String>,
        _deadline: Instant,
    ) -> Result<ValkeyFrame, Error> {
        let frame = command.to_frame();
        let mut asking = false;

        for _ in 0..MAX_REDIRECTIONS {
            let connection = match self.inner.topology.connection_for(&address).await {
                Ok(connection) => connection,
                Err(error) => {
                    // A replica that cannot be dialed falls back to its
                    // primary; everything else fails the request.
                    if let Some(primary) = fallback.take() {
                        debug!("replica {address} unreachable, reading from primary");
                        address = primary;
                        continue;
                    }
                    return Err(error);
                }
            };

            let reply = if asking {
                let asking_frame = crate::commands::cmd("ASKING").to_frame();
                match connection.send_batch(vec![asking_frame, frame.clone()]) {
                    // Never queued: always safe to try again.
                    Err(_) => continue,
                    Ok(rx) => match rx.await {
                        Err(_) => Err(Error::Connection(
                            crate::connection::ConnectionError::LocalClosed,
                        )),
                        Ok(Ok(mut replies)) => Ok(replies.pop().expect("batch reply missing")),
                        Ok(Err(error)) => Err(error),
                    },
                }
            } else {
                match connection.send(frame.clone()) {
                    // Never queued: always safe to try again.
                    Err(_) => continue,
                    Ok(rx) => match rx.await {
                        Err(_) => Err(Error::Connection(
                            crate::connection::ConnectionError::LocalClosed,
                        )),
                        Ok(reply) => reply,
                    },
                }
            };

            match reply {
                Ok(frame) => match Redirection::parse(&frame) {
                    Some(Redirection::Moved { slot, server }) => {
                        debug!("got MOVED {slot} {server}");
                        self.inner.topology.apply_moved(slot, &server).await;
                        let topology = self.inner.topology.clone();
                        tokio::spawn(async move {
                            let _ = topology.refresh_slots().await;
                        });
                        address = server;
                        fallback = None;
                        asking = false;
                    }
                    Some(Redirection::Ask { slot, server }) => {
                        debug!("got ASK {slot} {server}");
                        address = server;
                        fallback = None;
                        asking = true;
                    }
                    None => {
                        if let ValkeyFrame::Error(message) = frame {
                            return Err(error_from_reply(&message));
                        }
                        return Ok(frame);
                    }
                },
                Err(Error::Connection(err)) => {
                    // The request was queued and possibly written. Only
                    // idempotent reads may be sent again.
                    if command.query_type() == QueryType::Read {
                        debug!("connection to {address} dropped, retrying read: {err}");
                        continue;
                    }
                    return Err(Error::Connection(err));
                }
                Err(error) => return Err(error),
            }
        }

        Err(Error::MaxRedirections(MAX_REDIRECTIONS))
    }

    async fn fan_out(
        &self,
        command: &Command,
        addresses: Vec<String>,
        deadline: Instant,
    ) -> Vec<(String, Result<ValkeyFrame, Error>)> {
        let requests = addresses.into_iter().map(|address| async move {
            let result = self
                .dispatch_single(command, address.clone(), None, deadline)
                .await;
            (address, result)
        });
        join_all(requests).await
    }

    /// Routes a transaction: the slot of the first keyed command pins the
    /// batch to that shard's primary, a key-less batch runs on a random
    /// primary.
    pub(crate) async fn transaction_address(
        &self,
        commands: &[Command],
        routing: Option<RoutingSpec>,
    ) -> Result<String, Error> {
        let slot_map = self.inner.topology.slot_map().await;

        if let Some(routing) = routing {
            match routing {
                RoutingSpec::PrimaryFirstOfBatch => {}
                RoutingSpec::ByKey { key, .. } => {
                    return slot_map
                        .shard_for_slot(slot_of(&key))
                        .map(|shard| shard.primary.clone())
                        .ok_or_else(|| Error::Request("no known node owns the slot".into()));
                }
                RoutingSpec::BySlotId { slot, .. } => {
                    return slot_map
                        .shard_for_slot(slot)
                        .map(|shard| shard.primary.clone())
                        .ok_or_else(|| Error::Request("no known node owns the slot".into()));
                }
                RoutingSpec::Random => {}
                other => {
                    return Err(Error::Request(format!(
                        "transactions cannot be routed with {other:?}"
                    )))
                }
            }
        }

        if let Some(key) = commands.iter().find_map(|c| c.key()) {
            return slot_map
                .shard_for_slot(slot_of(key))
                .map(|shard| shard.primary.clone())
                .ok_or_else(|| Error::Request("no known node owns the slot".into()));
        }

        let mut rng = self.inner.rng.lock().unwrap();
        resolve(
            &RoutingSpec::Random,
            &slot_map,
            self.inner.config.read_from,
            &mut rng,
        )
        .map(|target| match target {
            RouteTarget::Single { address, .. } => address,
            RouteTarget::Fanout(mut addresses) => addresses.remove(0),
        })
    }
}
