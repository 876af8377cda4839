use crate::error::SpResult;
use libp2p::{Multiaddr, PeerId};
use tracing::debug;

const PEER_TREE: &str = "peerstore";

/// Permanent peer addresses, persisted in a sled tree keyed by peer id.
#[derive(Clone)]
pub struct PeerStore {
    tree: sled::Tree,
}

impl PeerStore {
    pub fn open(db: &sled::Db) -> SpResult<Self> {
        Ok(Self {
            tree: db.open_tree(PEER_TREE)?,
        })
    }

    fn decode(raw: &[u8]) -> SpResult<Vec<Multiaddr>> {
        let text: Vec<String> = bincode::deserialize(raw)?;
        Ok(text.iter().filter_map(|a| a.parse().ok()).collect())
    }

    /// Merges `addrs` into the peer's known addresses.
    pub fn add_addrs(&self, peer: &PeerId, addrs: &[Multiaddr]) -> SpResult<()> {
        if addrs.is_empty() {
            return Ok(());
        }
        let key = peer.to_bytes();
        let mut known = match self.tree.get(&key)? {
            Some(raw) => Self::decode(&raw)?,
            None => Vec::new(),
        };
        let mut changed = false;
        for addr in addrs {
            if !known.contains(addr) {
                known.push(addr.clone());
                changed = true;
            }
        }
        if changed {
            let text: Vec<String> = known.iter().map(|a| a.to_string()).collect();
            self.tree.insert(key, bincode::serialize(&text)?)?;
            debug!(peer = %peer, addrs = known.len(), "Stored peer addresses");
        }
        Ok(())
    }

    pub fn addrs(&self, peer: &PeerId) -> SpResult<Vec<Multiaddr>> {
        match self.tree.get(peer.to_bytes())? {
            Some(raw) => Self::decode(&raw),
            None => Ok(Vec::new()),
        }
    }

    pub fn all(&self) -> SpResult<Vec<(PeerId, Vec<Multiaddr>)>> {
        let mut out = Vec::new();
        for entry in self.tree.iter() {
            let (key, raw) = entry?;
            let Ok(peer) = PeerId::from_bytes(&key) else {
                continue;
            };
            out.push((peer, Self::decode(&raw)?));
        }
        Ok(out)
    }

    pub fn peers(&self) -> SpResult<Vec<PeerId>> {
        Ok(self.all()?.into_iter().map(|(p, _)| p).collect())
    }

    pub fn remove_peer(&self, peer: &PeerId) -> SpResult<()> {
        self.tree.remove(peer.to_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> PeerStore {
        let db = sled::Config::new().temporary(true).open().expect("db");
        PeerStore::open(&db).expect("tree")
    }

    #[test]
    fn addresses_merge_and_remove() {
        let store = store();
        let peer = PeerId::random();
        let a: Multiaddr = "/ip4/127.0.0.1/tcp/9933".parse().expect("addr");
        let b: Multiaddr = "/ip4/10.0.0.1/tcp/9933".parse().expect("addr");
        store.add_addrs(&peer, &[a.clone()]).expect("add");
        store.add_addrs(&peer, &[a.clone(), b.clone()]).expect("add");
        assert_eq!(store.addrs(&peer).expect("addrs"), vec![a, b]);
        assert_eq!(store.peers().expect("peers"), vec![peer]);
        store.remove_peer(&peer).expect("remove");
        assert!(store.addrs(&peer).expect("addrs").is_empty());
        assert!(store.all().expect("all").is_empty());
    }
}
