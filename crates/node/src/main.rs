use anyhow::Context;
use clap::Parser;
use k256::ecdsa::SigningKey;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use strata_node::approval::ApprovalService;
use strata_node::config::NodeConfig;
use strata_node::devchain::DevChain;
use strata_node::executor::{Executor, ExecutorOptions, EXECUTOR_SERVICE};
use strata_node::gc::GcDriver;
use strata_node::interfaces::{Chain, MetadataDb, PieceStore, Signer};
use strata_node::manager::{Manager, ManagerOptions};
use strata_node::metadb::SledMetadataDb;
use strata_node::p2p::{build_node, identity_from_hex, parse_bootstrap, resolve_address, OverlayConfig};
use strata_node::peers::PeerDirectory;
use strata_node::peerstore::PeerStore;
use strata_node::piece::SledPieceStore;
use strata_node::rcmgr::ResourceManager;
use strata_node::receiver::PieceReceiver;
use strata_node::replicator::{Replicator, ReplicatorOptions};
use strata_node::signer::LocalSigner;
use strata_node::task::set_replicate_memory_limit;
use strata_protocol::signature::signing_key_from_hex;
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

const REPLICATOR_SERVICE: &str = "replicator";
const IDENTITY_FILE: &str = "node_identity.key";
const CONFIG_FILE: &str = "config.json";

#[derive(Parser, Debug, Clone)]
#[command(name = "strata-node", version, about = "Storage provider node")]
struct Args {
    /// JSON config; defaults to config.json in the data dir.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "./node-data")]
    data_dir: PathBuf,

    /// host:port or a multiaddr; overrides the config file.
    #[arg(long)]
    listen: Option<String>,

    /// Entries of the form peer_id@host:port; overrides the config file.
    #[arg(long, num_args = 0..)]
    bootstrap: Vec<String>,

    #[arg(long, default_value_t = false)]
    log_json: bool,

    #[arg(long, default_value_t = false)]
    print_peer_id: bool,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("failed to create data dir {}", args.data_dir.display()))?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| args.data_dir.join(CONFIG_FILE));
    let mut cfg = NodeConfig::load(&config_path)?;
    if let Some(listen) = &args.listen {
        cfg.p2p_listen_address = listen.clone();
    }
    if !args.bootstrap.is_empty() {
        cfg.p2p_bootstrap = args.bootstrap.clone();
    }

    let keypair = load_or_create_identity(&args.data_dir, &cfg.p2p_private_key)?;
    if args.print_peer_id {
        println!("{}", keypair.public().to_peer_id());
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(());
    });
    run_node(&args.data_dir, cfg, keypair, shutdown_rx).await
}

async fn run_node(
    data_dir: &Path,
    cfg: NodeConfig,
    keypair: libp2p::identity::Keypair,
    shutdown_rx: oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let db = sled::open(data_dir.join("db"))
        .with_context(|| format!("failed to open database in {}", data_dir.display()))?;
    let dev_chain = Arc::new(DevChain::new(cfg.dev_chain.clone()));
    let chain: Arc<dyn Chain> = dev_chain.clone();
    let sled_metadb = Arc::new(SledMetadataDb::open(&db)?);
    let metadb: Arc<dyn MetadataDb> = sled_metadb.clone();
    let store: Arc<dyn PieceStore> = Arc::new(SledPieceStore::open(&db, cfg.storage_max_gb)?);

    let operator_key = signing_key_or_random(&cfg.operator_private_key, "operator")?;
    let approval_key = signing_key_or_random(&cfg.approval_private_key, "approval")?;
    let signer: Arc<dyn Signer> = Arc::new(LocalSigner::new(operator_key, approval_key, chain.clone()));
    let operator = signer.operator_address();
    if !cfg.sp_operator_address.is_empty() && !cfg.sp_operator_address.eq_ignore_ascii_case(&operator) {
        warn!(
            configured = %cfg.sp_operator_address,
            derived = %operator,
            "Configured operator address does not match the operator key"
        );
    }

    let rcmgr = ResourceManager::init_global(cfg.resource_manager.clone());
    set_replicate_memory_limit(cfg.replicate_task_memory_limit);

    let peers = Arc::new(PeerDirectory::new());
    let peerstore = PeerStore::open(&db)?;
    let approvals = Arc::new(ApprovalService::new(
        peers.clone(),
        chain.clone(),
        signer.clone(),
        cfg.secondary_approval_expired_height,
    ));
    let receiver = Arc::new(PieceReceiver::new(
        store.clone(),
        metadb.clone(),
        chain.clone(),
        signer.clone(),
        cfg.task.clone(),
    ));

    let mut bootstrap = Vec::with_capacity(cfg.p2p_bootstrap.len());
    for entry in &cfg.p2p_bootstrap {
        bootstrap.push(parse_bootstrap(entry).await?);
    }
    let overlay = OverlayConfig {
        listen: resolve_address(&cfg.p2p_listen_address).await?,
        bootstrap,
        ping_period: Duration::from_secs(cfg.p2p_ping_period_seconds),
        max_inbound: usize::try_from(cfg.parallel.query_sp_parallel_per_node).unwrap_or(usize::MAX),
    };
    let (node, handle) = build_node(
        keypair,
        overlay,
        peers.clone(),
        peerstore,
        approvals,
        receiver,
        signer.clone(),
    )?;
    let handle = Arc::new(handle);
    info!(peer_id = %handle.peer_id(), operator = %operator, "Node identity loaded");
    info!(
        max_gb = cfg.storage_max_gb,
        path = %data_dir.display(),
        "Node storage allocation configured"
    );

    let replicator = Arc::new(Replicator::new(
        store.clone(),
        metadb.clone(),
        chain.clone(),
        signer.clone(),
        handle.clone(),
        handle.clone(),
        rcmgr.open_service(REPLICATOR_SERVICE)?,
        ReplicatorOptions::new(&cfg.replicate, &cfg.seal),
    ));
    let manager = Arc::new(
        Manager::new(ManagerOptions::from_config(&cfg), metadb.clone(), chain.clone()).with_peers(peers),
    );
    let gc = Arc::new(GcDriver::new(manager.clone(), store, metadb, operator));
    let executor = Arc::new(Executor::new(
        manager.clone(),
        replicator,
        gc,
        rcmgr.open_service(EXECUTOR_SERVICE)?,
        ExecutorOptions {
            workers: cfg.parallel.executor_workers,
            ..ExecutorOptions::default()
        },
    ));

    let (stop_tx, stop_rx) = watch::channel(false);
    let manager_loop = tokio::spawn(manager.run(stop_rx.clone()));
    let workers = executor.run(stop_rx.clone());
    let sync_loop = tokio::spawn(follow_chain(dev_chain, sled_metadb, stop_rx));

    let result = node.run(shutdown_rx).await;
    let _ = stop_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }
    let _ = manager_loop.await;
    let _ = sync_loop.await;
    db.flush_async().await.context("failed to flush database")?;
    info!("Node stopped");
    result
}

/// The dev chain is its own metadata source: deleted-object windows are
/// complete up to the current height.
async fn follow_chain(chain: Arc<DevChain>, metadb: Arc<SledMetadataDb>, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => match chain.current_height().await {
                Ok(height) => {
                    if let Err(err) = metadb.set_synced_block(height) {
                        warn!(error = %err, "Failed to record synced block");
                    }
                }
                Err(err) => warn!(error = %err, "Failed to query chain height"),
            },
        }
    }
}

fn signing_key_or_random(hex_key: &str, role: &str) -> anyhow::Result<SigningKey> {
    if hex_key.trim().is_empty() {
        warn!(role, "No private key configured, using an ephemeral key");
        return Ok(SigningKey::random(&mut rand::rngs::OsRng));
    }
    signing_key_from_hex(hex_key).with_context(|| format!("invalid {role} private key"))
}

fn load_or_create_identity(data_dir: &Path, configured: &str) -> anyhow::Result<libp2p::identity::Keypair> {
    if !configured.trim().is_empty() {
        return identity_from_hex(configured);
    }
    let key_path = data_dir.join(IDENTITY_FILE);
    if key_path.exists() {
        let bytes = fs::read(&key_path)?;
        let keypair = libp2p::identity::Keypair::from_protobuf_encoding(&bytes)?;
        return Ok(keypair);
    }

    let keypair = libp2p::identity::Keypair::generate_secp256k1();
    let encoded = keypair.to_protobuf_encoding()?;
    fs::write(&key_path, encoded)?;
    Ok(keypair)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_file_is_reused() {
        let dir = std::env::temp_dir().join(format!("strata-identity-{}", std::process::id()));
        fs::create_dir_all(&dir).expect("dir");
        let first = load_or_create_identity(&dir, "").expect("create");
        let second = load_or_create_identity(&dir, "").expect("load");
        assert_eq!(first.public().to_peer_id(), second.public().to_peer_id());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn cli_overrides_parse() {
        let args = Args::parse_from([
            "strata-node",
            "--listen",
            "0.0.0.0:9000",
            "--bootstrap",
            "a@127.0.0.1:1",
            "b@127.0.0.1:2",
            "--log-json",
        ]);
        assert_eq!(args.listen.as_deref(), Some("0.0.0.0:9000"));
        assert_eq!(args.bootstrap.len(), 2);
        assert!(args.log_json);
        assert_eq!(args.data_dir, PathBuf::from("./node-data"));
    }
}
