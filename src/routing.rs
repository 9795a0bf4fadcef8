//! Request routing.
//!
//! A [`RoutingSpec`] says where a request may run; resolution against the
//! current slot map snapshot turns it into concrete node addresses. Routing
//! is data, not behaviour: each variant carries only what it needs and the
//! dispatcher interprets the result.

use crate::config::ReadFrom;
use crate::error::Error;
use crate::slots::{slot_of, SlotMap};
use rand::rngs::SmallRng;
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum RoutingSpec {
    /// Any primary; used for keyless commands.
    Random,
    /// Fan out to every primary.
    AllPrimaries,
    /// Fan out to every known node, replicas included.
    AllNodes,
    /// Route by key slot. `prefer_replica` widens the connection-wide
    /// read-from strategy for this one request.
    ByKey {
        key: Vec<u8>,
        prefer_replica: bool,
    },
    /// Route to an explicit slot.
    BySlotId {
        slot: u16,
        prefer_replica: bool,
    },
    /// Transactions: pinned to the node owning the first keyed command of
    /// the batch, or Random when the batch has no keys. The transaction
    /// engine rewrites this into one of the concrete variants above.
    PrimaryFirstOfBatch,
}

/// A resolved destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// One node, with an optional fallback if the preferred node cannot be
    /// dialed (a replica's primary).
    Single {
        address: String,
        fallback: Option<String>,
    },
    /// Ordered fan-out; responses are collected per address.
    Fanout(Vec<String>),
}

impl RouteTarget {
    fn single(address: String) -> Self {
        RouteTarget::Single {
            address,
            fallback: None,
        }
    }
}

/// Resolves a routing spec against a slot map snapshot.
///
/// The `prefer_replica` flag and the `read_from` strategy are combined as a
/// union: either one steers a request onto the slot's replicas, round-robin,
/// with the primary as the dial fallback.
pub fn resolve(
    spec: &RoutingSpec,
    slot_map: &SlotMap,
    read_from: ReadFrom,
    rng: &mut SmallRng,
) -> Result<RouteTarget, Error> {
    match spec {
        RoutingSpec::Random => slot_map
            .primaries()
            .into_iter()
            .choose(rng)
            .map(RouteTarget::single)
            .ok_or_else(no_known_nodes),
        RoutingSpec::AllPrimaries => {
            let primaries = slot_map.primaries();
            if primaries.is_empty() {
                return Err(no_known_nodes());
            }
            Ok(RouteTarget::Fanout(primaries))
        }
        RoutingSpec::AllNodes => {
            let nodes = slot_map.nodes().to_vec();
            if nodes.is_empty() {
                return Err(no_known_nodes());
            }
            Ok(RouteTarget::Fanout(nodes))
        }
        RoutingSpec::ByKey {
            key,
            prefer_replica,
        } => resolve_slot(slot_of(key), *prefer_replica, slot_map, read_from),
        RoutingSpec::BySlotId {
            slot,
            prefer_replica,
        } => resolve_slot(*slot, *prefer_replica, slot_map, read_from),
        RoutingSpec::PrimaryFirstOfBatch => Err(Error::Request(
            "PrimaryFirstOfBatch must be rewritten by the transaction engine".into(),
        )),
    }
}

fn resolve_slot(
    slot: u16,
    prefer_replica: bool,
    slot_map: &SlotMap,
    read_from: ReadFrom,
) -> Result<RouteTarget, Error> {
    let shard = slot_map
        .shard_for_slot(slot)
        .ok_or_else(|| Error::Request(format!("no known node owns slot {slot}")))?;

    let replica_wanted = prefer_replica || read_from == ReadFrom::PreferReplica;
    if replica_wanted {
        if let Some(replica) = shard.next_replica() {
            return Ok(RouteTarget::Single {
                address: replica.to_string(),
                fallback: Some(shard.primary.clone()),
            });
        }
    }

    Ok(RouteTarget::single(shard.primary.clone()))
}

fn no_known_nodes() -> Error {
    Error::Request("no known nodes".into())
}
