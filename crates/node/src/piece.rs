use crate::error::{SpError, SpResult};
use crate::interfaces::PieceStore;
use async_trait::async_trait;
use sled::Tree;
use strata_protocol::ObjectId;
use tracing::debug;

const PIECE_TREE: &str = "pieces";
const USED_BYTES_KEY: &[u8] = b"__meta:used_bytes";
const PIECE_PREFIX: &str = "p:";

/// Key of a whole segment held by the primary SP.
pub fn segment_piece_key(object_id: ObjectId, segment_idx: u32) -> String {
    format!("s_{object_id}_{segment_idx}")
}

/// Key of one erasure shard held by a secondary SP.
pub fn ec_piece_key(object_id: ObjectId, replicate_idx: u32, segment_idx: u32) -> String {
    format!("e_{object_id}_{replicate_idx}_{segment_idx}")
}

/// Piece store on a sled tree with a byte quota.
#[derive(Clone)]
pub struct SledPieceStore {
    tree: Tree,
    max_bytes: u64,
}

impl SledPieceStore {
    pub fn open(db: &sled::Db, max_gb: u64) -> SpResult<Self> {
        let max_bytes = max_gb
            .saturating_mul(1024)
            .saturating_mul(1024)
            .saturating_mul(1024);
        Self::with_quota(db, max_bytes)
    }

    pub fn with_quota(db: &sled::Db, max_bytes: u64) -> SpResult<Self> {
        let tree = db.open_tree(PIECE_TREE)?;
        Ok(Self { tree, max_bytes })
    }

    pub fn used_bytes(&self) -> u64 {
        read_used_bytes(&self.tree).unwrap_or(0)
    }

    fn put_sync(&self, key: &str, data: Vec<u8>) -> SpResult<()> {
        let key = piece_key(key);
        let existing = self.tree.get(&key)?.map(|v| v.len() as u64).unwrap_or(0);
        let used = read_used_bytes(&self.tree)?;
        let projected = used
            .saturating_sub(existing)
            .saturating_add(data.len() as u64);
        if projected > self.max_bytes {
            return Err(SpError::InvalidParameters(format!(
                "piece store quota exceeded: {projected} > {}",
                self.max_bytes
            )));
        }
        self.tree.insert(key.as_bytes(), data)?;
        write_used_bytes(&self.tree, projected)?;
        Ok(())
    }

    fn get_sync(&self, key: &str, offset: u64, len: u64) -> SpResult<Vec<u8>> {
        let Some(value) = self.tree.get(piece_key(key))? else {
            return Err(SpError::RecordNotFound(format!("piece {key}")));
        };
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        if start > value.len() {
            return Err(SpError::InvalidParameters(format!(
                "offset {offset} beyond piece {key} of {} bytes",
                value.len()
            )));
        }
        let end = if len == 0 {
            value.len()
        } else {
            start
                .saturating_add(usize::try_from(len).unwrap_or(usize::MAX))
                .min(value.len())
        };
        Ok(value[start..end].to_vec())
    }

    fn delete_sync(&self, key: &str) -> SpResult<()> {
        if let Some(v) = self.tree.remove(piece_key(key))? {
            let used = read_used_bytes(&self.tree)?;
            write_used_bytes(&self.tree, used.saturating_sub(v.len() as u64))?;
            debug!(key, "Deleted piece");
        }
        Ok(())
    }
}

#[async_trait]
impl PieceStore for SledPieceStore {
    async fn get_piece(&self, key: &str, offset: u64, len: u64) -> SpResult<Vec<u8>> {
        self.get_sync(key, offset, len)
    }

    async fn put_piece(&self, key: &str, data: Vec<u8>) -> SpResult<()> {
        self.put_sync(key, data)
    }

    async fn delete_piece(&self, key: &str) -> SpResult<()> {
        self.delete_sync(key)
    }
}

fn piece_key(key: &str) -> String {
    format!("{PIECE_PREFIX}{key}")
}

fn read_used_bytes(tree: &Tree) -> Result<u64, sled::Error> {
    let Some(v) = tree.get(USED_BYTES_KEY)? else {
        return Ok(0);
    };
    if v.len() != 8 {
        return Ok(0);
    }
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&v);
    Ok(u64::from_le_bytes(arr))
}

fn write_used_bytes(tree: &Tree, bytes: u64) -> Result<(), sled::Error> {
    tree.insert(USED_BYTES_KEY, bytes.to_le_bytes().to_vec())?;
    Ok(())
}
