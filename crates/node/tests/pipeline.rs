use async_trait::async_trait;
use k256::ecdsa::SigningKey;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_node::approval::ApprovalService;
use strata_node::devchain::{DevChain, DevChainConfig};
use strata_node::erasure::ErasureEncoder;
use strata_node::executor::{Executor, ExecutorOptions};
use strata_node::gc::GcDriver;
use strata_node::interfaces::{
    ApprovalCollector, Chain, DeletedObject, JobState, MetadataDb, PieceStore, SecondaryClient,
    Signer,
};
use strata_node::manager::{Manager, ManagerOptions};
use strata_node::metadb::SledMetadataDb;
use strata_node::peers::PeerDirectory;
use strata_node::piece::{ec_piece_key, segment_piece_key, SledPieceStore};
use strata_node::rcmgr::{Limiter, ResourceLimit, ResourceManager, ResourceScope};
use strata_node::receiver::PieceReceiver;
use strata_node::replicator::{Replicator, ReplicatorOptions};
use strata_node::signer::LocalSigner;
use strata_node::task::{TaskConfig, TaskKind};
use strata_node::{SpError, SpResult};
use strata_protocol::signature::{address_of_signer, format_address, verify_signature};
use strata_protocol::{
    checksum, integrity_hash, DonePieceRequest, DonePieceResponse, ObjectId, ObjectInfo,
    PutPieceRequest, ReplicatePieceApproval, SecondarySpSealDoc, StorageParams, StorageProvider,
};

const PRIMARY_SEED: u8 = 1;

fn key(seed: u8) -> SigningKey {
    SigningKey::from_slice(&[seed; 32]).expect("valid scalar")
}

fn address(seed: u8) -> String {
    format_address(&address_of_signer(&key(seed)))
}

fn temp_db() -> sled::Db {
    sled::Config::new().temporary(true).open().expect("db")
}

fn params() -> StorageParams {
    StorageParams {
        max_segment_size: 1024 * 1024,
        data_chunk_num: 4,
        parity_chunk_num: 2,
        ..StorageParams::default()
    }
}

struct Secondary {
    operator: String,
    endpoint: String,
    approvals: Arc<ApprovalService>,
    receiver: Arc<PieceReceiver>,
    store: Arc<SledPieceStore>,
}

/// Routes approval requests straight to the secondaries' approval services and
/// hands their answers back through the primary's collector.
struct LoopbackApprovals {
    primary: Arc<ApprovalService>,
    responders: Vec<Arc<ApprovalService>>,
}

#[async_trait]
impl ApprovalCollector for LoopbackApprovals {
    async fn get_secondary_replicate_piece_approval(
        &self,
        approval: ReplicatePieceApproval,
        expected: usize,
        timeout: Duration,
    ) -> SpResult<Vec<ReplicatePieceApproval>> {
        let primary = self.primary.clone();
        let responders = self.responders.clone();
        self.primary
            .collect(approval, expected, timeout, move |request| async move {
                for responder in responders {
                    let primary = primary.clone();
                    let request = request.clone();
                    tokio::spawn(async move {
                        if let Ok(Some(response)) = responder.on_request(request).await {
                            let _ = primary.on_response(response);
                        }
                    });
                }
                Ok(())
            })
            .await
    }
}

/// Delivers pieces to in-process receivers; endpoints in `tampered` answer
/// with a corrupted integrity hash.
struct LoopbackClient {
    receivers: HashMap<String, Arc<PieceReceiver>>,
    tampered: HashSet<String>,
}

impl LoopbackClient {
    fn receiver(&self, endpoint: &str) -> SpResult<&Arc<PieceReceiver>> {
        self.receivers
            .get(endpoint)
            .ok_or_else(|| SpError::Network(format!("no route to {endpoint}")))
    }
}

#[async_trait]
impl SecondaryClient for LoopbackClient {
    async fn put_piece(&self, endpoint: &str, req: PutPieceRequest) -> SpResult<()> {
        let resp = self.receiver(endpoint)?.handle_put(req).await;
        if resp.accepted {
            Ok(())
        } else {
            Err(SpError::Network(resp.error))
        }
    }

    async fn done_piece(&self, endpoint: &str, req: DonePieceRequest) -> SpResult<DonePieceResponse> {
        let mut resp = self.receiver(endpoint)?.handle_done(req).await;
        if self.tampered.contains(endpoint) {
            resp.integrity_hash = checksum(b"not the pieces you sent");
        }
        Ok(resp)
    }
}

struct Cluster {
    chain: Arc<DevChain>,
    metadb: Arc<SledMetadataDb>,
    store: Arc<SledPieceStore>,
    manager: Arc<Manager>,
    executor: Executor,
    scope: Arc<ResourceScope>,
    secondaries: Vec<Secondary>,
}

struct ClusterOptions {
    secondaries: u8,
    responders: usize,
    tampered: Vec<usize>,
    approval_factor: f64,
    approval_timeout: Duration,
    executor_limit: Option<ResourceLimit>,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            secondaries: 6,
            responders: 6,
            tampered: Vec::new(),
            approval_factor: 1.0,
            approval_timeout: Duration::from_secs(2),
            executor_limit: None,
        }
    }
}

fn cluster(opts: ClusterOptions) -> Cluster {
    let chain = Arc::new(DevChain::new(DevChainConfig {
        start_height: 100,
        block_time_ms: 0,
        storage_params: params(),
        storage_providers: Vec::new(),
    }));
    let primary_address = address(PRIMARY_SEED);

    let mut sps = vec![StorageProvider {
        operator_address: primary_address.clone(),
        approval_address: address(PRIMARY_SEED + 100),
        endpoint: "sp-primary".into(),
        ..Default::default()
    }];
    let mut secondaries = Vec::new();
    for i in 0..opts.secondaries {
        let seed = 10 + i;
        let db = temp_db();
        let store = Arc::new(SledPieceStore::open(&db, 1).expect("store"));
        let metadb = Arc::new(SledMetadataDb::open(&db).expect("metadb"));
        let signer: Arc<dyn Signer> = Arc::new(LocalSigner::new(key(seed), key(seed + 100), chain.clone()));
        let peers = Arc::new(PeerDirectory::new());
        peers.update_sp(&[primary_address.to_lowercase()]);
        let endpoint = format!("sp-{i}");
        sps.push(StorageProvider {
            operator_address: address(seed),
            approval_address: address(seed + 100),
            endpoint: endpoint.clone(),
            ..Default::default()
        });
        secondaries.push(Secondary {
            operator: address(seed),
            endpoint,
            approvals: Arc::new(ApprovalService::new(peers, chain.clone(), signer.clone(), 900)),
            receiver: Arc::new(PieceReceiver::new(
                store.clone(),
                metadb,
                chain.clone(),
                signer,
                TaskConfig::default(),
            )),
            store,
        });
    }
    chain.set_storage_providers(sps);

    let db = temp_db();
    let store = Arc::new(SledPieceStore::open(&db, 1).expect("store"));
    let metadb = Arc::new(SledMetadataDb::open(&db).expect("metadb"));
    let signer: Arc<dyn Signer> = Arc::new(LocalSigner::new(
        key(PRIMARY_SEED),
        key(PRIMARY_SEED + 100),
        chain.clone(),
    ));
    let peers = Arc::new(PeerDirectory::new());
    let secondary_addresses: Vec<String> = secondaries.iter().map(|s| s.operator.to_lowercase()).collect();
    peers.update_sp(&secondary_addresses);
    let primary_approvals = Arc::new(ApprovalService::new(peers, chain.clone(), signer.clone(), 900));

    let approvals = Arc::new(LoopbackApprovals {
        primary: primary_approvals,
        responders: secondaries
            .iter()
            .take(opts.responders)
            .map(|s| s.approvals.clone())
            .collect(),
    });
    let client = Arc::new(LoopbackClient {
        receivers: secondaries
            .iter()
            .map(|s| (s.endpoint.clone(), s.receiver.clone()))
            .collect(),
        tampered: opts.tampered.iter().map(|i| format!("sp-{i}")).collect(),
    });

    let mut limiter = Limiter::default();
    if let Some(limit) = opts.executor_limit {
        limiter.service_limits.insert("executor".into(), limit);
    }
    let rcmgr = ResourceManager::new(limiter);
    let scope = rcmgr.open_service("replicator").expect("scope");
    let mut replicator_options = ReplicatorOptions::default();
    replicator_options.approval_factor = opts.approval_factor;
    replicator_options.approval_timeout = opts.approval_timeout;
    let replicator = Arc::new(Replicator::new(
        store.clone(),
        metadb.clone(),
        chain.clone(),
        signer.clone(),
        approvals,
        client,
        scope.clone(),
        replicator_options,
    ));
    let manager = Arc::new(Manager::new(ManagerOptions::default(), metadb.clone(), chain.clone()));
    let gc = Arc::new(GcDriver::new(
        manager.clone(),
        store.clone(),
        metadb.clone(),
        signer.operator_address(),
    ));
    let executor = Executor::new(
        manager.clone(),
        replicator,
        gc,
        rcmgr.open_service("executor").expect("scope"),
        ExecutorOptions::default(),
    );
    Cluster {
        chain,
        metadb,
        store,
        manager,
        executor,
        scope,
        secondaries,
    }
}

impl Cluster {
    async fn init(&self) {
        self.manager.refresh_sp_info().await.expect("sp info");
        self.manager.refresh_storage_params().await.expect("params");
    }

    /// Stores the payload's segments on the primary and returns the object with
    /// the expected per-index integrity hashes.
    async fn upload(&self, id: u64, payload: &[u8]) -> ObjectInfo {
        let params = params();
        let encoder = ErasureEncoder::from_params(&params).expect("encoder");
        let redundancy = params.redundancy_count() as usize;
        let mut segment_sums = Vec::new();
        let mut shard_sums: Vec<Vec<Vec<u8>>> = vec![Vec::new(); redundancy];
        let info_id = ObjectId::from(id);
        for (seg, data) in payload.chunks(params.max_segment_size as usize).enumerate() {
            self.store
                .put_piece(&segment_piece_key(info_id, seg as u32), data.to_vec())
                .await
                .expect("put segment");
            segment_sums.push(checksum(data));
            for (idx, shard) in encoder.encode(data).expect("encode").iter().enumerate() {
                shard_sums[idx].push(checksum(shard));
            }
        }
        let mut checksums = vec![integrity_hash(&segment_sums)];
        checksums.extend(shard_sums.iter().map(|sums| integrity_hash(sums)));
        let info = ObjectInfo {
            id: info_id,
            bucket_name: "bucket".into(),
            object_name: format!("object-{id}"),
            payload_size: payload.len() as u64,
            checksums,
            ..Default::default()
        };
        self.metadb.create_upload_job(&info).await.expect("job");
        info
    }

    fn push_replicate(&self, info: &ObjectInfo) {
        self.manager
            .queue()
            .push(self.manager.task_config().replicate_task(info.clone(), params()))
            .expect("push replicate");
    }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[tokio::test]
async fn replicate_and_seal_three_segments() {
    let c = cluster(ClusterOptions::default());
    c.init().await;
    let info = c.upload(1, &payload(3 * 1024 * 1024)).await;
    c.push_replicate(&info);

    assert!(c.executor.run_once().await);

    let sealed = c.chain.sealed("bucket", "object-1").expect("sealed on chain");
    assert_eq!(sealed.secondary_sp_addresses.len(), 6);
    let distinct: HashSet<String> = sealed.secondary_sp_addresses.iter().map(|a| a.to_lowercase()).collect();
    assert_eq!(distinct.len(), 6);
    assert!(sealed.secondary_sp_signatures.iter().all(|s| !s.is_empty()));

    for (idx, operator) in sealed.secondary_sp_addresses.iter().enumerate() {
        let sp = c.secondaries.iter().find(|s| &s.operator == operator).expect("known sp");
        let seed = 10 + c.secondaries.iter().position(|s| &s.operator == operator).expect("pos") as u8;
        let doc = SecondarySpSealDoc {
            sp_operator_address: operator.clone(),
            object_id: info.id,
            integrity_hash: info.checksums[idx + 1].clone(),
        };
        verify_signature(&address(seed + 100), &doc.sign_bytes(), &sealed.secondary_sp_signatures[idx])
            .expect("seal signature over the expected hash");
        for seg in 0..3 {
            assert!(sp.store.get_piece(&ec_piece_key(info.id, idx as u32, seg), 0, 0).await.is_ok());
        }
    }

    let job = c.metadb.get_job(info.id).await.expect("job");
    assert_eq!(job.state, JobState::SealObjectDone);
    assert!(c.manager.queue().is_empty());
    assert_eq!(c.scope.stat().memory, 0);
}

#[tokio::test]
async fn hostile_peer_is_replaced() {
    let c = cluster(ClusterOptions {
        secondaries: 7,
        responders: 7,
        tampered: vec![3],
        approval_factor: 1.15,
        ..ClusterOptions::default()
    });
    c.init().await;
    let baseline = c.scope.stat().memory;
    let info = c.upload(2, &payload(3 * 1024 * 1024)).await;
    c.push_replicate(&info);

    assert!(c.executor.run_once().await);

    let sealed = c.chain.sealed("bucket", "object-2").expect("sealed on chain");
    assert_eq!(sealed.secondary_sp_addresses.len(), 6);
    assert!(!sealed.secondary_sp_addresses.contains(&c.secondaries[3].operator));
    assert!(sealed.secondary_sp_addresses.contains(&c.secondaries[6].operator));
    let distinct: HashSet<&String> = sealed.secondary_sp_addresses.iter().collect();
    assert_eq!(distinct.len(), 6);
    assert_eq!(c.scope.stat().memory, baseline);
}

#[tokio::test]
async fn approval_timeout_requeues_with_retry() {
    let c = cluster(ClusterOptions {
        responders: 4,
        approval_timeout: Duration::from_secs(2),
        ..ClusterOptions::default()
    });
    c.init().await;
    let info = c.upload(3, &payload(64 * 1024)).await;
    c.push_replicate(&info);
    let key = info.id.to_string();
    let created = c.manager.queue().get(&key).expect("queued").update_time;

    let started = Instant::now();
    assert!(c.executor.run_once().await);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(1950), "returned after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(2500), "returned after {elapsed:?}");

    let task = c.manager.queue().get(&key).expect("still queued");
    assert_eq!(task.retry, 1);
    assert!(task.update_time >= created);
    assert_eq!(task.error.as_deref(), Some(SpError::ExhaustedSecondarySp.to_string().as_str()));
    assert!(c.chain.sealed("bucket", "object-3").is_none());
    let job = c.metadb.get_job(info.id).await.expect("job");
    assert_eq!(job.state, JobState::ReplicateObjectError);
}

#[tokio::test]
async fn failed_inline_seal_moves_to_seal_task() {
    let c = cluster(ClusterOptions::default());
    c.init().await;
    let info = c.upload(4, &payload(128 * 1024)).await;
    c.push_replicate(&info);
    c.chain.fail_next_seals(3);

    assert!(c.executor.run_once().await);
    assert!(c.chain.sealed("bucket", "object-4").is_none());
    let task = c.manager.queue().get(&info.id.to_string()).expect("seal task");
    let TaskKind::SealObject(seal) = &task.kind else {
        panic!("expected a seal task, got {:?}", task.kind);
    };
    assert_eq!(seal.secondary_addresses.len(), 6);

    assert!(c.executor.run_once().await);
    assert!(c.chain.sealed("bucket", "object-4").is_some());
    assert_eq!(c.metadb.get_job(info.id).await.expect("job").state, JobState::SealObjectDone);
}

#[tokio::test]
async fn gc_window_runs_through_the_executor() {
    let c = cluster(ClusterOptions::default());
    c.init().await;
    let info = c.upload(5, &payload(3 * 1024 * 1024)).await;
    c.metadb
        .mark_object_deleted(&DeletedObject {
            object_info: info.clone(),
            storage_params: params(),
            delete_block: 40,
        })
        .expect("deleted");
    c.metadb
        .set_synced_block(c.chain.current_height().await.expect("height"))
        .expect("synced");

    let window = c.manager.task_config().gc_object_task(1, 50);
    c.manager.queue().push(window.clone()).expect("push");
    assert!(c.executor.run_once().await);

    for seg in 0..3 {
        assert!(c.store.get_piece(&segment_piece_key(info.id, seg), 0, 0).await.is_err());
    }
    assert!(!c.manager.queue().has(&window.key));
}

#[tokio::test]
async fn idle_executor_backs_off() {
    let c = cluster(ClusterOptions::default());
    assert!(!c.executor.run_once().await);
}

#[tokio::test]
async fn busy_executor_leaves_the_next_task_untouched() {
    let c = cluster(ClusterOptions {
        executor_limit: Some(ResourceLimit {
            tasks_high: 1,
            ..ResourceLimit::infinite()
        }),
        ..ClusterOptions::default()
    });
    c.init().await;
    let first = c.upload(6, &payload(128 * 1024)).await;
    let second = c.upload(7, &payload(128 * 1024)).await;
    c.push_replicate(&first);
    c.push_replicate(&second);

    let (a, b) = tokio::join!(c.executor.run_once(), c.executor.run_once());
    assert!(a != b, "exactly one worker should get the single high slot");

    let waiting: Vec<_> = [&first, &second]
        .into_iter()
        .filter_map(|info| c.manager.queue().get(&info.id.to_string()))
        .filter(|task| matches!(task.kind, TaskKind::ReplicatePiece(_)))
        .collect();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].retry, 0);

    assert!(c.executor.run_once().await);
    assert!(c.chain.sealed("bucket", "object-6").is_some());
    assert!(c.chain.sealed("bucket", "object-7").is_some());
}
