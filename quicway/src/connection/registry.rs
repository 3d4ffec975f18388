//! Connection registry.
//!
//! A sharded concurrent map from local connection ID to the owning actor's
//! identity. `insert_unique` is the primitive that makes the
//! create-connection race benign: exactly one caller wins, every other
//! caller receives the winner's entry and adopts it. Entries are removed by
//! the actor monitor when the actor terminates, normally or by panic.

use crate::connection::InboundDatagram;
use crate::peer::PeerAddr;
use parking_lot::RwLock;
use quicway_x::ConnectionId;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::mpsc;

const SHARD_COUNT: usize = 16;

/// A live connection: local CID, owning actor, and its packet mailbox.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub cid: ConnectionId,
    pub actor_id: u64,
    pub packets: mpsc::Sender<InboundDatagram>,
    pub created_at: Instant,
}

pub struct ConnectionRegistry {
    shards: Vec<RwLock<HashMap<ConnectionId, ConnectionEntry>>>,
    /// Address→CID side-table for zero-length-DCID routing and migration
    /// tracking. Present only when `allow_address_routing` is enabled.
    by_addr: Option<RwLock<HashMap<PeerAddr, ConnectionId>>>,
}

impl ConnectionRegistry {
    pub fn new(allow_address_routing: bool) -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self {
            shards,
            by_addr: allow_address_routing.then(|| RwLock::new(HashMap::new())),
        }
    }

    fn shard(&self, cid: &ConnectionId) -> &RwLock<HashMap<ConnectionId, ConnectionEntry>> {
        // Local CIDs are keyed-PRF output, so the first byte is uniform.
        &self.shards[cid.0[0] as usize % SHARD_COUNT]
    }

    /// Insert `entry` iff its CID is unused. On conflict the existing entry
    /// is returned so the caller can adopt the winner.
    pub fn insert_unique(&self, entry: ConnectionEntry) -> Result<(), ConnectionEntry> {
        let mut shard = self.shard(&entry.cid).write();
        match shard.get(&entry.cid) {
            Some(existing) => Err(existing.clone()),
            None => {
                shard.insert(entry.cid, entry);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, cid: &ConnectionId) -> Option<ConnectionEntry> {
        self.shard(cid).read().get(cid).cloned()
    }

    /// Remove an entry, but only if it still belongs to `actor_id`. A
    /// monitor firing for a dead incarnation must not evict a live one that
    /// reused the CID.
    pub fn remove(&self, cid: &ConnectionId, actor_id: u64) -> Option<ConnectionEntry> {
        let mut shard = self.shard(cid).write();
        if shard.get(cid).is_some_and(|e| e.actor_id == actor_id) {
            shard.remove(cid)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all live entries (used by supervisor shutdown).
    pub fn entries(&self) -> Vec<ConnectionEntry> {
        self.shards
            .iter()
            .flat_map(|s| s.read().values().cloned().collect::<Vec<_>>())
            .collect()
    }

    pub fn bind_address(&self, peer: PeerAddr, cid: ConnectionId) {
        if let Some(table) = &self.by_addr {
            table.write().insert(peer, cid);
        }
    }

    pub fn unbind_address(&self, peer: &PeerAddr, cid: &ConnectionId) {
        if let Some(table) = &self.by_addr {
            let mut table = table.write();
            if table.get(peer) == Some(cid) {
                table.remove(peer);
            }
        }
    }

    /// Resolve a peer address to its connection, if address routing is on.
    pub fn lookup_address(&self, peer: &PeerAddr) -> Option<ConnectionEntry> {
        let cid = *self.by_addr.as_ref()?.read().get(peer)?;
        self.lookup(&cid)
    }
}
