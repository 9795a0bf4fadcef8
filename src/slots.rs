//! Slot math and the slot map.
//!
//! A cluster partitions the key space into 16384 slots; every key hashes to
//! exactly one. The map from slot ranges to shards is fetched with
//! `CLUSTER SLOTS` (or `CLUSTER SHARDS` on newer servers) and published as an
//! immutable snapshot: refreshes build a new map and swap the pointer, so a
//! request holding a snapshot is never affected by a concurrent refresh.

use crate::frame::ValkeyFrame;
use anyhow::{bail, ensure, Context, Result};
use itertools::Itertools;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

pub const SLOT_COUNT: u16 = 16384;

/// The hash tag is the substring between the first `{` and the next `}`, if
/// non-empty. Keys sharing a tag colocate on one slot.
#[inline(always)]
pub fn get_hashtag(key: &[u8]) -> Option<&[u8]> {
    if let Some(open) = key.iter().position(|v| *v == b'{') {
        if let Some(close) = key[open..].iter().position(|v| *v == b'}') {
            let rv = &key[open + 1..open + close];
            if !rv.is_empty() {
                return Some(rv);
            }
        }
    }
    None
}

/// `CRC16-XMODEM(hash_tag(key)) % 16384`. Must match the server's own
/// hashing or routing silently degrades into a redirect storm.
#[inline(always)]
pub fn slot_of(key: &[u8]) -> u16 {
    let key = get_hashtag(key).unwrap_or(key);
    crc16::State::<crc16::XMODEM>::calculate(key) % SLOT_COUNT
}

/// One shard: the primary and its replicas, plus a cursor for round-robin
/// replica reads. The cursor is interior-mutable so snapshots stay shared.
#[derive(Debug)]
pub struct Shard {
    pub primary: String,
    pub replicas: Vec<String>,
    next_replica: AtomicUsize,
}

impl Shard {
    pub fn new(primary: String, replicas: Vec<String>) -> Self {
        Shard {
            primary,
            replicas,
            next_replica: AtomicUsize::new(0),
        }
    }

    /// The next replica in round-robin order, or `None` for a replica-less
    /// shard.
    pub fn next_replica(&self) -> Option<&str> {
        if self.replicas.is_empty() {
            return None;
        }
        let index = self.next_replica.fetch_add(1, Ordering::Relaxed) % self.replicas.len();
        Some(&self.replicas[index])
    }
}

/// Immutable snapshot of the slot space.
///
/// Shards are keyed by the *end* slot of their range; the owner of a slot is
/// the entry with the smallest end at or above it. A standalone deployment is
/// the degenerate single-shard case.
#[derive(Debug, Clone, Default)]
pub struct SlotMap {
    shards: BTreeMap<u16, Arc<Shard>>,
    nodes: Vec<String>,
}

impl SlotMap {
    /// All slots owned by the one server of a standalone deployment.
    pub fn standalone(address: String) -> Self {
        let mut shards = BTreeMap::new();
        shards.insert(
            SLOT_COUNT - 1,
            Arc::new(Shard::new(address.clone(), Vec::new())),
        );
        SlotMap {
            shards,
            nodes: vec![address],
        }
    }

    pub fn from_shards(entries: Vec<(u16, u16, Shard)>) -> Self {
        let mut nodes = Vec::new();
        let mut shards = BTreeMap::new();
        for (_start, end, shard) in entries {
            for node in std::iter::once(&shard.primary).chain(shard.replicas.iter()) {
                if !nodes.contains(node) {
                    nodes.push(node.clone());
                }
            }
            shards.insert(end, Arc::new(shard));
        }
        SlotMap { shards, nodes }
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn shard_for_slot(&self, slot: u16) -> Option<&Arc<Shard>> {
        self.shards.range(slot..).next().map(|(_, shard)| shard)
    }

    /// Every known node address, insertion ordered (primaries before their
    /// replicas, shards in discovery order).
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    /// Primary addresses, deduplicated, in slot-range order.
    pub fn primaries(&self) -> Vec<String> {
        self.shards
            .values()
            .map(|shard| shard.primary.clone())
            .unique()
            .collect()
    }

    /// Copy-on-write patch after a MOVED reply: the redirected slot is pinned
    /// to its new owner until the scheduled full refresh lands. The patch is
    /// a single-slot override, which is the lightweight half of the contract;
    /// the refresh restores precision.
    pub fn with_moved_slot(&self, slot: u16, server: String) -> SlotMap {
        let mut updated = self.clone();
        if !updated.nodes.contains(&server) {
            updated.nodes.push(server.clone());
        }
        updated
            .shards
            .insert(slot, Arc::new(Shard::new(server, Vec::new())));
        updated
    }
}

fn parse_node_address(frames: &[ValkeyFrame], start: u16, end: u16) -> Result<Option<String>> {
    ensure!(start <= end, "invalid slot range: {}-{}", start, end);
    ensure!(frames.len() >= 2, "expected at least two fields");

    let ip = if let ValkeyFrame::BulkString(ref ip) = frames[0] {
        std::str::from_utf8(ip.as_ref()).context("Failed to parse IP address as utf8")?
    } else {
        bail!("unexpected type for ip");
    };

    if ip.is_empty() {
        warn!("Node IP unknown for slots {}-{}.", start, end);
        return Ok(None);
    }

    let port = if let ValkeyFrame::Integer(port) = frames[1] {
        port
    } else {
        bail!("unexpected type for port");
    };

    Ok(Some(format!("{ip}:{port}")))
}

/// Parses a `CLUSTER SLOTS` reply:
/// `[start, end, [primary ip, port, ...], [replica ip, port, ...]...]` rows.
pub fn parse_slots(results: &[ValkeyFrame]) -> Result<SlotMap> {
    let mut entries: Vec<(u16, u16, Shard)> = Vec::new();

    for result in results {
        match result {
            ValkeyFrame::Array(result) => {
                let mut start: u16 = 0;
                let mut end: u16 = 0;
                let mut primary: Option<String> = None;
                let mut replicas: Vec<String> = Vec::new();

                for (index, item) in result.iter().enumerate() {
                    match (index, item) {
                        (0, ValkeyFrame::Integer(i)) => start = *i as u16,
                        (1, ValkeyFrame::Integer(i)) => end = *i as u16,
                        (2, ValkeyFrame::Array(node)) => {
                            primary = parse_node_address(node, start, end)
                                .context("failed to decode primary entry")?;
                        }
                        (_, ValkeyFrame::Array(node)) => {
                            if let Some(address) = parse_node_address(node, start, end)
                                .context("failed to decode replica entry")?
                            {
                                replicas.push(address);
                            }
                        }
                        _ => bail!("unexpected value in slot map"),
                    }
                }

                if let Some(primary) = primary {
                    entries.push((start, end, Shard::new(primary, replicas)));
                }
            }
            _ => bail!("unexpected value in slot map"),
        }
    }

    if entries.is_empty() {
        bail!("empty slot map!");
    }

    Ok(SlotMap::from_shards(entries))
}

/// Looks up `key` in a flattened field-value list. Both wire shapes of
/// `CLUSTER SHARDS` normalize to this: RESP3 maps are flattened by the
/// decoder, RESP2 replies arrive flattened already.
fn kv_lookup<'a>(fields: &'a [ValkeyFrame], key: &[u8]) -> Option<&'a ValkeyFrame> {
    fields.chunks_exact(2).find_map(|pair| match &pair[0] {
        ValkeyFrame::BulkString(k) if k.as_ref() == key => Some(&pair[1]),
        ValkeyFrame::SimpleString(k) if k.as_ref() == key => Some(&pair[1]),
        _ => None,
    })
}

fn bulk_str(frame: &ValkeyFrame) -> Option<&str> {
    match frame {
        ValkeyFrame::BulkString(b) => std::str::from_utf8(b.as_ref()).ok(),
        ValkeyFrame::SimpleString(b) => std::str::from_utf8(b.as_ref()).ok(),
        _ => None,
    }
}

/// Parses a `CLUSTER SHARDS` reply (newer servers): one entry per shard with
/// a `slots` range list and a `nodes` list carrying endpoint/port/role.
pub fn parse_shards(results: &[ValkeyFrame]) -> Result<SlotMap> {
    let mut entries: Vec<(u16, u16, Shard)> = Vec::new();

    for result in results {
        let fields = match result {
            ValkeyFrame::Array(fields) => fields,
            _ => bail!("unexpected value in shards reply"),
        };

        let slots = match kv_lookup(fields, b"slots") {
            Some(ValkeyFrame::Array(slots)) => slots,
            _ => bail!("shard entry without slots"),
        };

        let nodes = match kv_lookup(fields, b"nodes") {
            Some(ValkeyFrame::Array(nodes)) => nodes,
            _ => bail!("shard entry without nodes"),
        };

        let mut primary: Option<String> = None;
        let mut replicas: Vec<String> = Vec::new();
        for node in nodes {
            let node_fields = match node {
                ValkeyFrame::Array(fields) => fields,
                _ => bail!("unexpected node entry in shards reply"),
            };

            let endpoint = kv_lookup(node_fields, b"endpoint")
                .or_else(|| kv_lookup(node_fields, b"ip"))
                .and_then(bulk_str)
                .context("node entry without endpoint")?;
            let port = match kv_lookup(node_fields, b"port") {
                Some(ValkeyFrame::Integer(port)) => *port,
                _ => bail!("node entry without port"),
            };
            let role = kv_lookup(node_fields, b"role")
                .and_then(bulk_str)
                .context("node entry without role")?;

            if let Some(ValkeyFrame::BulkString(health)) = kv_lookup(node_fields, b"health") {
                if health.as_ref() != b"online" {
                    continue;
                }
            }

            let address = format!("{endpoint}:{port}");
            match role {
                "master" | "primary" => primary = Some(address),
                _ => replicas.push(address),
            }
        }

        let primary = primary.context("shard entry without a primary")?;

        // The slots list is pairs of range starts and ends.
        for range in slots.chunks_exact(2) {
            match (&range[0], &range[1]) {
                (ValkeyFrame::Integer(start), ValkeyFrame::Integer(end)) => {
                    entries.push((
                        *start as u16,
                        *end as u16,
                        Shard::new(primary.clone(), replicas.clone()),
                    ));
                }
                _ => bail!("unexpected slot range in shards reply"),
            }
        }
    }

    if entries.is_empty() {
        bail!("empty shards reply!");
    }

    Ok(SlotMap::from_shards(entries))
}
