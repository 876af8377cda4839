//! Known overlay peers grouped by the storage provider operating them.

use libp2p::{Multiaddr, PeerId};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use tracing::info;

/// A peer fails once its fail count reaches this.
pub const PEER_FAILURE_MAX: u32 = 1;
/// SP buckets larger than this get pruned.
pub const PRUNE_PEERS_MAX: usize = 10;
pub const PEER_SP_UNSPECIFIED: &str = "PEER_SP_UNSPECIFIED";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: PeerId,
    pub sp: String,
    pub addr: Option<Multiaddr>,
    pub fail_count: u32,
    /// Unix millis of the last success or failure.
    pub last_update: i64,
}

impl Peer {
    pub fn failing(&self) -> bool {
        self.fail_count >= PEER_FAILURE_MAX
    }

    fn incr_fail(&mut self) {
        self.fail_count += 1;
        self.last_update = chrono::Utc::now().timestamp_millis();
    }

    fn reset(&mut self) {
        self.fail_count = 0;
        self.last_update = chrono::Utc::now().timestamp_millis();
    }
}

#[derive(Debug, Default)]
struct Directory {
    peers: HashMap<PeerId, Peer>,
    sp_peers: BTreeMap<String, Vec<PeerId>>,
}

impl Directory {
    /// Trims every oversized SP bucket, keeping the healthiest and freshest
    /// peers. Returns the peers dropped.
    fn prune(&mut self) -> Vec<PeerId> {
        let mut discarded = Vec::new();
        let Directory { peers, sp_peers } = self;
        for (sp, ids) in sp_peers.iter_mut() {
            if ids.len() <= PRUNE_PEERS_MAX {
                continue;
            }
            info!(sp = %sp, peers = ids.len(), "Pruning sp peers");
            ids.sort_by(|a, b| {
                let (pa, pb) = (peers.get(a), peers.get(b));
                let key = |p: Option<&Peer>| p.map_or((u32::MAX, i64::MIN), |p| (p.fail_count, p.last_update));
                let (fa, la) = key(pa);
                let (fb, lb) = key(pb);
                fa.cmp(&fb).then(lb.cmp(&la))
            });
            for id in ids.drain(PRUNE_PEERS_MAX..) {
                peers.remove(&id);
                info!(node_id = %id, "Delete node");
                discarded.push(id);
            }
        }
        discarded
    }
}

/// Peer id → peer and sp → peer ids, behind one lock. The directory never touches
/// the address book itself; callers clear the peers it reports as pruned.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    inner: Mutex<Directory>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        let mut dir = Directory::default();
        dir.sp_peers.insert(PEER_SP_UNSPECIFIED.to_string(), Vec::new());
        Self {
            inner: Mutex::new(dir),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Directory> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replaces the SP set. Buckets of SPs that stay keep their peers; peers of
    /// SPs that disappear move to the unspecified bucket.
    pub fn update_sp(&self, sps: &[String]) {
        let mut dir = self.lock();
        let mut old = std::mem::take(&mut dir.sp_peers);
        let mut unspecified = old.remove(PEER_SP_UNSPECIFIED).unwrap_or_default();
        let mut next = BTreeMap::new();
        for sp in sps {
            let ids = old.remove(sp).unwrap_or_default();
            next.insert(sp.clone(), ids);
        }
        for (_, ids) in old {
            for id in ids {
                if let Some(peer) = dir.peers.get_mut(&id) {
                    peer.sp = PEER_SP_UNSPECIFIED.to_string();
                }
                if !unspecified.contains(&id) {
                    unspecified.push(id);
                }
            }
        }
        next.insert(PEER_SP_UNSPECIFIED.to_string(), unspecified);
        dir.sp_peers = next;
    }

    pub fn check_sp(&self, sp: &str) -> bool {
        self.lock().sp_peers.contains_key(sp)
    }

    /// Inserts or refreshes a peer and resets its fail count. Returns peers pruned
    /// as a consequence.
    pub fn add_peer(&self, id: PeerId, sp: &str, addr: Option<Multiaddr>) -> Vec<PeerId> {
        let mut dir = self.lock();
        let sp = if dir.sp_peers.contains_key(sp) {
            sp.to_string()
        } else {
            PEER_SP_UNSPECIFIED.to_string()
        };
        let previous_sp = dir.peers.get(&id).map(|p| p.sp.clone());
        if let Some(prev) = previous_sp.filter(|prev| *prev != sp) {
            if let Some(ids) = dir.sp_peers.get_mut(&prev) {
                ids.retain(|p| *p != id);
            }
        }
        let peer = dir.peers.entry(id).or_insert_with(|| Peer {
            id,
            sp: sp.clone(),
            addr: addr.clone(),
            fail_count: 0,
            last_update: 0,
        });
        peer.sp = sp.clone();
        if addr.is_some() {
            peer.addr = addr;
        }
        peer.reset();
        let bucket = dir.sp_peers.entry(sp).or_default();
        if !bucket.contains(&id) {
            bucket.push(id);
        }
        dir.prune()
    }

    /// Records a failed interaction with `id`. Returns peers pruned as a consequence.
    pub fn delete_peer(&self, id: &PeerId) -> Vec<PeerId> {
        let mut dir = self.lock();
        match dir.peers.get_mut(id) {
            Some(peer) => peer.incr_fail(),
            None => return Vec::new(),
        }
        dir.prune()
    }

    pub fn get(&self, id: &PeerId) -> Option<Peer> {
        self.lock().peers.get(id).cloned()
    }

    pub fn peers_of(&self, sp: &str) -> Vec<PeerId> {
        self.lock().sp_peers.get(sp).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
