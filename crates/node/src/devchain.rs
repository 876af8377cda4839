//! In-process chain for development and tests. Heights either follow wall-clock
//! block times or are moved by hand.

use crate::error::{SpError, SpResult};
use crate::interfaces::Chain;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};
use strata_protocol::signature::verify_signature;
use strata_protocol::{ObjectInfo, SealObjectMessage, StorageParams, StorageProvider};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevChainConfig {
    pub start_height: u64,
    /// Zero keeps the height fixed until moved by hand.
    pub block_time_ms: u64,
    pub storage_params: StorageParams,
    pub storage_providers: Vec<StorageProvider>,
}

impl Default for DevChainConfig {
    fn default() -> Self {
        Self {
            start_height: 10_000,
            block_time_ms: 1000,
            storage_params: StorageParams::default(),
            storage_providers: Vec::new(),
        }
    }
}

pub struct DevChain {
    started: Instant,
    base_height: AtomicU64,
    block_time: Duration,
    params: RwLock<StorageParams>,
    sps: RwLock<Vec<StorageProvider>>,
    sealed: Mutex<HashMap<(String, String), SealObjectMessage>>,
    failing_seals: AtomicU32,
}

impl DevChain {
    pub fn new(cfg: DevChainConfig) -> Self {
        Self {
            started: Instant::now(),
            base_height: AtomicU64::new(cfg.start_height),
            block_time: Duration::from_millis(cfg.block_time_ms),
            params: RwLock::new(cfg.storage_params),
            sps: RwLock::new(cfg.storage_providers),
            sealed: Mutex::new(HashMap::new()),
            failing_seals: AtomicU32::new(0),
        }
    }

    fn height(&self) -> u64 {
        let base = self.base_height.load(Ordering::Acquire);
        if self.block_time.is_zero() {
            return base;
        }
        let blocks = self.started.elapsed().as_millis() / self.block_time.as_millis().max(1);
        base.saturating_add(u64::try_from(blocks).unwrap_or(u64::MAX))
    }

    pub fn advance(&self, blocks: u64) {
        self.base_height.fetch_add(blocks, Ordering::AcqRel);
    }

    pub fn set_storage_providers(&self, sps: Vec<StorageProvider>) {
        *self.sps.write().unwrap_or_else(|e| e.into_inner()) = sps;
    }

    pub fn set_storage_params(&self, params: StorageParams) {
        *self.params.write().unwrap_or_else(|e| e.into_inner()) = params;
    }

    /// Makes the next `n` seal submissions fail.
    pub fn fail_next_seals(&self, n: u32) {
        self.failing_seals.store(n, Ordering::Release);
    }

    pub fn sealed(&self, bucket: &str, object: &str) -> Option<SealObjectMessage> {
        self.sealed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(bucket.to_string(), object.to_string()))
            .cloned()
    }
}

#[async_trait]
impl Chain for DevChain {
    async fn current_height(&self) -> SpResult<u64> {
        Ok(self.height())
    }

    async fn storage_params(&self) -> SpResult<StorageParams> {
        Ok(*self.params.read().unwrap_or_else(|e| e.into_inner()))
    }

    async fn sp_list(&self) -> SpResult<Vec<StorageProvider>> {
        Ok(self.sps.read().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn seal_object_on_chain(&self, msg: &SealObjectMessage, signature: &[u8]) -> SpResult<()> {
        let pending = self.failing_seals.load(Ordering::Acquire);
        if pending > 0 {
            self.failing_seals.store(pending - 1, Ordering::Release);
            warn!(object = %msg.object_name, "Dev chain rejected seal");
            return Err(SpError::ChainTimeout("seal transaction dropped".into()));
        }
        let body = serde_json::to_vec(msg).unwrap_or_default();
        verify_signature(&msg.operator, &body, signature)?;
        if msg.secondary_sp_addresses.len() != msg.secondary_sp_signatures.len() {
            return Err(SpError::InvalidParameters(
                "secondary addresses and signatures differ in length".into(),
            ));
        }
        info!(bucket = %msg.bucket_name, object = %msg.object_name, height = self.height(), "Object sealed");
        self.sealed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((msg.bucket_name.clone(), msg.object_name.clone()), msg.clone());
        Ok(())
    }

    async fn listen_object_seal(&self, object: &ObjectInfo, timeout_blocks: u64) -> SpResult<bool> {
        let deadline = self.height().saturating_add(timeout_blocks);
        let poll = if self.block_time.is_zero() {
            Duration::from_millis(50)
        } else {
            self.block_time.min(Duration::from_millis(200))
        };
        let max_polls = if self.block_time.is_zero() { 1 } else { u64::MAX };
        let mut polls = 0u64;
        loop {
            if self.sealed(&object.bucket_name, &object.object_name).is_some() {
                return Ok(true);
            }
            polls += 1;
            if self.height() >= deadline || polls > max_polls {
                return Ok(false);
            }
            tokio::time::sleep(poll).await;
        }
    }
}
