use crate::error::{SpError, SpResult};
use reed_solomon_erasure::galois_8::ReedSolomon;
use strata_protocol::StorageParams;

/// Reed-Solomon codec for one segment at a time.
pub struct ErasureEncoder {
    rs: ReedSolomon,
    data_shards: usize,
    parity_shards: usize,
}

impl ErasureEncoder {
    pub fn new(data_shards: usize, parity_shards: usize) -> SpResult<Self> {
        let rs = ReedSolomon::new(data_shards, parity_shards)
            .map_err(|e| SpError::Erasure(format!("init {data_shards}+{parity_shards}: {e:?}")))?;
        Ok(Self {
            rs,
            data_shards,
            parity_shards,
        })
    }

    pub fn from_params(params: &StorageParams) -> SpResult<Self> {
        Self::new(
            params.data_chunk_num as usize,
            params.parity_chunk_num as usize,
        )
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Splits `data` into zero-padded data shards of `ceil(len / data_shards)` bytes
    /// and appends the parity shards.
    pub fn encode(&self, data: &[u8]) -> SpResult<Vec<Vec<u8>>> {
        let shard_size = data.len().div_ceil(self.data_shards).max(1);
        let mut shards: Vec<Vec<u8>> = vec![vec![0; shard_size]; self.total_shards()];

        for (i, shard) in shards.iter_mut().enumerate().take(self.data_shards) {
            let start = i * shard_size;
            if start >= data.len() {
                break;
            }
            let end = (start + shard_size).min(data.len());
            shard[..end - start].copy_from_slice(&data[start..end]);
        }

        self.rs
            .encode(&mut shards)
            .map_err(|e| SpError::Erasure(format!("encode: {e:?}")))?;
        Ok(shards)
    }

    /// Rebuilds missing shards and returns the first `original_len` data bytes.
    pub fn decode(&self, mut shards: Vec<Option<Vec<u8>>>, original_len: usize) -> SpResult<Vec<u8>> {
        self.rs
            .reconstruct(&mut shards)
            .map_err(|e| SpError::Erasure(format!("reconstruct: {e:?}")))?;
        let mut result = Vec::with_capacity(original_len);
        for shard in shards.iter().take(self.data_shards).flatten() {
            result.extend_from_slice(shard);
        }
        result.truncate(original_len);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_from_parity_loss() {
        let enc = ErasureEncoder::new(4, 2).expect("codec");
        let data: Vec<u8> = (0..1001u32).map(|i| (i % 251) as u8).collect();
        let shards = enc.encode(&data).expect("encode");
        assert_eq!(shards.len(), 6);
        assert!(shards.iter().all(|s| s.len() == 251));

        let mut partial: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        partial[0] = None;
        partial[5] = None;
        assert_eq!(enc.decode(partial, data.len()).expect("decode"), data);
    }

    #[test]
    fn shard_size_matches_storage_params() {
        let params = StorageParams {
            max_segment_size: 10,
            data_chunk_num: 4,
            parity_chunk_num: 2,
            max_payload_size: 100,
        };
        let enc = ErasureEncoder::from_params(&params).expect("codec");
        let shards = enc.encode(&[7; 5]).expect("encode");
        assert_eq!(shards[0].len() as u64, params.ec_piece_size(25, 2));
    }

    #[test]
    fn zero_shards_rejected() {
        assert!(matches!(ErasureEncoder::new(0, 2), Err(SpError::Erasure(_))));
    }
}
