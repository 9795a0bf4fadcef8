//! Cluster topology: the published slot map snapshot and the registry of
//! node connections.
//!
//! Standalone deployments are the degenerate case: one node owns every slot
//! and refreshing is a no-op. In cluster mode the map is fetched with
//! `CLUSTER SLOTS` (falling back to `CLUSTER SHARDS`), published as an
//! immutable snapshot, and re-fetched on first connect, on MOVED replies, or
//! on a configured interval. Refreshes are coalesced: any number of
//! concurrent triggers share a single in-flight fetch.

use crate::config::ClientConfig;
use crate::connection::{Connection, HandshakeConfig};
use crate::error::Error;
use crate::frame::ValkeyFrame;
use crate::retry::Backoff;
use crate::slots::{parse_shards, parse_slots, SlotMap};
use crate::tls::TlsConnector;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use metrics::{counter, Counter};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

struct NodeSlot {
    connection: Option<Arc<Connection>>,
    backoff: Backoff,
}

pub struct Topology {
    config: Arc<ClientConfig>,
    handshake: HandshakeConfig,
    tls: Option<TlsConnector>,
    slot_map: RwLock<Arc<SlotMap>>,
    nodes: Mutex<HashMap<String, Arc<Mutex<NodeSlot>>>>,
    /// Serializes refreshes and records when the last one finished, so a
    /// trigger that raced an in-flight refresh returns without re-fetching.
    refresh_finished_at: Mutex<Instant>,
    reconnect_attempts: Counter,
}

impl Topology {
    pub fn new(config: Arc<ClientConfig>) -> Result<Topology, Error> {
        let tls = config
            .tls
            .as_ref()
            .map(TlsConnector::new)
            .transpose()
            .map_err(|e| Error::Configuration(e.to_string()))?;

        let initial_map = if config.cluster_mode {
            // Discovered by the first refresh.
            SlotMap::default()
        } else {
            SlotMap::standalone(config.seed_addresses().remove(0))
        };

        Ok(Topology {
            handshake: HandshakeConfig::from_config(&config),
            tls,
            slot_map: RwLock::new(Arc::new(initial_map)),
            nodes: Mutex::new(HashMap::new()),
            refresh_finished_at: Mutex::new(Instant::now()),
            reconnect_attempts: counter!("shoal_reconnect_attempts_count"),
            config,
        })
    }

    /// The current snapshot. In-flight requests keep using the snapshot they
    /// resolved against even while a refresh publishes a new one.
    pub async fn slot_map(&self) -> Arc<SlotMap> {
        self.slot_map.read().await.clone()
    }

    async fn node_slot(&self, address: &str) -> Arc<Mutex<NodeSlot>> {
        let mut nodes = self.nodes.lock().await;
        nodes
            .entry(address.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(NodeSlot {
                    connection: None,
                    backoff: Backoff::new(self.config.reconnect_strategy),
                }))
            })
            .clone()
    }

    /// Returns the Ready connection for `address`, dialing if necessary.
    ///
    /// Dials for one node are serialized; concurrent submitters await the
    /// same attempt. A failed dial sleeps out the backoff schedule and tries
    /// again; once the schedule is exhausted the error is returned and the
    /// schedule restarts for the next submission. The caller bounds this
    /// whole wait with the request deadline.
    pub async fn connection_for(&self, address: &str) -> Result<Arc<Connection>, Error> {
        let slot = self.node_slot(address).await;
        let mut slot = slot.lock().await;

        if let Some(connection) = &slot.connection {
            if !connection.is_closed() {
                return Ok(connection.clone());
            }
            slot.connection = None;
        }

        loop {
            match Connection::connect(
                address,
                &self.handshake,
                &self.tls,
                self.config.connect_timeout(),
            )
            .await
            {
                Ok(connection) => {
                    debug!("connected to {address}");
                    let connection = Arc::new(connection);
                    slot.connection = Some(connection.clone());
                    slot.backoff.reset();
                    return Ok(connection);
                }
                Err(error) => {
                    self.reconnect_attempts.increment(1);
                    match slot.backoff.next_delay() {
                        Some(delay) => {
                            warn!(
                                "failed to connect to {address}, retrying in {delay:?}: {error}"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            slot.backoff.reset();
                            return Err(error);
                        }
                    }
                }
            }
        }
    }

    /// Re-fetches and publishes the slot map. Standalone mode is a no-op.
    ///
    /// Coalesced: triggers that arrive while a refresh is in flight queue on
    /// the refresh lock and return as soon as it finishes, without issuing
    /// their own fetch.
    pub async fn refresh_slots(&self) -> Result<(), Error> {
        if !self.config.cluster_mode {
            return Ok(());
        }

        let triggered_at = Instant::now();
        let mut finished_at = self.refresh_finished_at.lock().await;
        if *finished_at > triggered_at {
            trace!("refresh coalesced into one that just finished");
            return Ok(());
        }

        let result = self.fetch_and_publish().await;
        *finished_at = Instant::now();
        result
    }

    fn latest_contact_points(&self, slot_map: &SlotMap) -> Vec<String> {
        if slot_map.is_empty() {
            self.config.seed_addresses()
        } else {
            slot_map.nodes().to_vec()
        }
    }

    async fn fetch_and_publish(&self) -> Result<(), Error> {
        debug!("fetching slot map");
        let current = self.slot_map().await;
        let addresses = self.latest_contact_points(&current);

        let mut results = FuturesUnordered::new();
        for address in &addresses {
            results.push(async move {
                self.fetch_from_node(address)
                    .await
                    .map_err(|err| {
                        trace!("error fetching slot map from {address}: {err}");
                        err
                    })
            });
        }

        let mut errors = Vec::new();
        while let Some(result) = results.next().await {
            match result {
                Ok(slots) => {
                    debug!("fetched slot map: {} nodes", slots.nodes().len());
                    *self.slot_map.write().await = Arc::new(slots);
                    return Ok(());
                }
                Err(err) => errors.push(err),
            }
        }

        debug!("failed to fetch slot map from all hosts");
        Err(errors
            .into_iter()
            .next()
            .unwrap_or_else(|| Error::Request("no contact points".into())))
    }

    async fn fetch_from_node(&self, address: &str) -> Result<SlotMap, Error> {
        let connection = self.connection_for(address).await?;

        let reply = connection
            .request(crate::commands::cmd("CLUSTER").arg("SLOTS").to_frame())
            .await?;
        match reply {
            ValkeyFrame::Array(rows) => {
                return parse_slots(&rows).map_err(|e| Error::Request(e.to_string()));
            }
            ValkeyFrame::Error(message) => {
                // Pre-SLOTS servers answer with an unknown command error;
                // newer servers may deprecate it. Either way, try SHARDS.
                debug!("CLUSTER SLOTS failed on {address}: {message}");
            }
            frame => {
                return Err(Error::Request(format!(
                    "unexpected response for cluster slots: {frame:?}"
                )))
            }
        }

        let reply = connection
            .request(crate::commands::cmd("CLUSTER").arg("SHARDS").to_frame())
            .await?;
        match reply {
            ValkeyFrame::Array(rows) => parse_shards(&rows).map_err(|e| Error::Request(e.to_string())),
            ValkeyFrame::Error(message) => Err(Error::Request(message.to_string())),
            frame => Err(Error::Request(format!(
                "unexpected response for cluster shards: {frame:?}"
            ))),
        }
    }

    /// Applies the lightweight MOVED patch: pins the one redirected slot to
    /// its new owner. The caller schedules the full (coalesced) refresh.
    pub async fn apply_moved(&self, slot: u16, server: &str) {
        let mut map = self.slot_map.write().await;
        *map = Arc::new(map.with_moved_slot(slot, server.to_string()));
    }

    /// Closes connections that have sat idle past the configured timeout.
    pub async fn reap_idle(&self, idle_timeout: Duration) {
        let nodes = self.nodes.lock().await;
        for (address, slot) in nodes.iter() {
            if let Ok(mut slot) = slot.try_lock() {
                let idle = slot
                    .connection
                    .as_ref()
                    .map(|c| c.is_idle(idle_timeout))
                    .unwrap_or(false);
                if idle {
                    debug!("reaping idle connection to {address}");
                    if let Some(connection) = slot.connection.take() {
                        connection.close(&Error::Closing);
                    }
                }
            }
        }
    }

    /// Tears down every connection, rejecting anything pending with
    /// `Closing`.
    pub async fn close_all(&self) {
        let mut nodes = self.nodes.lock().await;
        for (_, slot) in nodes.drain() {
            let mut slot = slot.lock().await;
            if let Some(connection) = slot.connection.take() {
                connection.close(&Error::Closing);
            }
        }
    }

    /// The number of live node connections; used by tests and diagnostics.
    pub async fn connected_nodes(&self) -> usize {
        let nodes = self.nodes.lock().await;
        let mut count = 0;
        for slot in nodes.values() {
            if let Ok(slot) = slot.try_lock() {
                if slot
                    .connection
                    .as_ref()
                    .map(|c| !c.is_closed())
                    .unwrap_or(false)
                {
                    count += 1;
                }
            }
        }
        count
    }
}
