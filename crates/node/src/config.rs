use crate::devchain::DevChainConfig;
use crate::rcmgr::Limiter;
use crate::task::{TaskConfig, DEFAULT_REPLICATE_MEMORY_LIMIT};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

pub const P2P_PRIVATE_KEY_ENV: &str = "STRATA_P2P_PRIVATE_KEY";
pub const PING_PERIOD_MIN_SECS: u64 = 1;
pub const SECONDARY_APPROVAL_EXPIRED_HEIGHT_MIN: u64 = 900;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Upper bound on overlay requests handled at once.
    pub query_sp_parallel_per_node: u64,
    pub executor_workers: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            query_sp_parallel_per_node: 10240,
            executor_workers: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicateConfig {
    pub approval_timeout_seconds: u64,
    /// Approvals asked for per redundancy index; the count is rounded up.
    pub approval_factor: f64,
}

impl Default for ReplicateConfig {
    fn default() -> Self {
        Self {
            approval_timeout_seconds: 10,
            approval_factor: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub upload_capacity: usize,
    pub replicate_capacity: usize,
    pub seal_capacity: usize,
    pub gc_object_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            upload_capacity: 10240,
            replicate_capacity: 10240,
            seal_capacity: 10240,
            gc_object_capacity: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub gc_interval_seconds: u64,
    pub refresh_storage_params_seconds: u64,
    pub refresh_sp_info_seconds: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            gc_interval_seconds: 60,
            refresh_storage_params_seconds: 3600,
            refresh_sp_info_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Last block already covered by a gc-object window.
    pub frontier: u64,
    pub block_interval: u64,
    pub block_distance: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            frontier: 0,
            block_interval: 1000,
            block_distance: 1800,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SealConfig {
    pub max_retries: u32,
    pub listen_window_blocks: u64,
    pub max_listen_retries: u32,
}

impl Default for SealConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            listen_window_blocks: 10,
            max_listen_retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Derived from the operator key when blank.
    pub sp_operator_address: String,
    pub operator_private_key: String,
    pub approval_private_key: String,
    /// Blank generates a fresh overlay identity at start.
    pub p2p_private_key: String,
    pub p2p_listen_address: String,
    pub p2p_bootstrap: Vec<String>,
    pub p2p_ping_period_seconds: u64,
    pub secondary_approval_expired_height: u64,
    pub max_upload_concurrent: usize,
    pub storage_max_gb: u64,
    pub parallel: ParallelConfig,
    pub replicate: ReplicateConfig,
    pub replicate_task_memory_limit: i64,
    pub resource_manager: Limiter,
    pub task: TaskConfig,
    pub queue: QueueConfig,
    pub manager: ManagerConfig,
    pub gc: GcConfig,
    pub seal: SealConfig,
    pub dev_chain: DevChainConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            sp_operator_address: String::new(),
            operator_private_key: String::new(),
            approval_private_key: String::new(),
            p2p_private_key: String::new(),
            p2p_listen_address: "127.0.0.1:9933".to_string(),
            p2p_bootstrap: Vec::new(),
            p2p_ping_period_seconds: 2,
            secondary_approval_expired_height: SECONDARY_APPROVAL_EXPIRED_HEIGHT_MIN,
            max_upload_concurrent: 40960,
            storage_max_gb: 100,
            parallel: ParallelConfig::default(),
            replicate: ReplicateConfig::default(),
            replicate_task_memory_limit: DEFAULT_REPLICATE_MEMORY_LIMIT,
            resource_manager: Limiter::default(),
            task: TaskConfig::default(),
            queue: QueueConfig::default(),
            manager: ManagerConfig::default(),
            gc: GcConfig::default(),
            seal: SealConfig::default(),
            dev_chain: DevChainConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Reads a JSON config; a missing file yields the defaults. The environment
    /// override and lower bounds are applied either way.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut cfg = if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read node config {}", path.display()))?;
            let cfg: NodeConfig = serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse node config {}", path.display()))?;
            info!(path = %path.display(), "Loaded node config");
            cfg
        } else {
            warn!(path = %path.display(), "Node config not found, using defaults");
            NodeConfig::default()
        };
        cfg.apply_env();
        cfg.normalize();
        Ok(cfg)
    }

    pub fn apply_env(&mut self) {
        if let Ok(key) = std::env::var(P2P_PRIVATE_KEY_ENV) {
            if !key.trim().is_empty() {
                self.p2p_private_key = key;
            }
        }
    }

    /// Raises values below their enforced minimums.
    pub fn normalize(&mut self) {
        if self.p2p_ping_period_seconds < PING_PERIOD_MIN_SECS {
            self.p2p_ping_period_seconds = PING_PERIOD_MIN_SECS;
        }
        if self.secondary_approval_expired_height < SECONDARY_APPROVAL_EXPIRED_HEIGHT_MIN {
            self.secondary_approval_expired_height = SECONDARY_APPROVAL_EXPIRED_HEIGHT_MIN;
        }
        if self.replicate.approval_factor < 1.0 || !self.replicate.approval_factor.is_finite() {
            self.replicate.approval_factor = 1.0;
        }
        if self.parallel.executor_workers == 0 {
            self.parallel.executor_workers = 1;
        }
        if self.gc.block_interval == 0 {
            self.gc.block_interval = GcConfig::default().block_interval;
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(path, raw)
            .with_context(|| format!("failed to write node config {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: NodeConfig = serde_json::from_str(
            r#"{"max_upload_concurrent": 2, "replicate": {"approval_factor": 1.5}, "gc": {"frontier": 5000}}"#,
        )
        .expect("parse");
        assert_eq!(cfg.max_upload_concurrent, 2);
        assert_eq!(cfg.replicate.approval_factor, 1.5);
        assert_eq!(cfg.replicate.approval_timeout_seconds, 10);
        assert_eq!(cfg.gc.frontier, 5000);
        assert_eq!(cfg.gc.block_distance, 1800);
        assert_eq!(cfg.parallel.query_sp_parallel_per_node, 10240);
        assert_eq!(cfg.queue.gc_object_capacity, 4);
        assert_eq!(cfg.seal.max_retries, 3);
    }

    #[test]
    fn minimums_are_enforced() {
        let mut cfg = NodeConfig {
            p2p_ping_period_seconds: 0,
            secondary_approval_expired_height: 10,
            ..Default::default()
        };
        cfg.normalize();
        assert_eq!(cfg.p2p_ping_period_seconds, 1);
        assert_eq!(cfg.secondary_approval_expired_height, 900);

        cfg.secondary_approval_expired_height = 5000;
        cfg.normalize();
        assert_eq!(cfg.secondary_approval_expired_height, 5000);
    }

    #[test]
    fn save_then_load() {
        let dir = std::env::temp_dir().join(format!("strata-config-{}", std::process::id()));
        let path = dir.join("node.json");
        let cfg = NodeConfig {
            p2p_bootstrap: vec!["16Uiu2HAm@127.0.0.1:9934".into()],
            ..Default::default()
        };
        cfg.save(&path).expect("save");
        let loaded = NodeConfig::load(&path).expect("load");
        assert_eq!(loaded.p2p_bootstrap, cfg.p2p_bootstrap);
        let _ = fs::remove_dir_all(&dir);
    }
}
