//! Primary side of replication: fans one object's segments out to N secondary SPs
//! as erasure shards (or whole-segment replicas), verifies what each secondary
//! signs for, and seals the object on chain.

use crate::config::{ReplicateConfig, SealConfig};
use crate::erasure::ErasureEncoder;
use crate::error::{SpError, SpResult};
use crate::interfaces::{
    ApprovalCollector, Chain, JobState, MetadataDb, PieceStore, SecondaryClient, Signer,
};
use crate::piece::segment_piece_key;
use crate::rcmgr::{ResourceScope, RESERVATION_PRIORITY_HIGH};
use crate::stream::PayloadStream;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strata_protocol::signature::verify_signature;
use strata_protocol::{
    DonePieceRequest, ObjectId, ObjectInfo, PutPieceRequest, RedundancyType,
    ReplicatePieceApproval, ReplicatePieceHeader, SealObjectMessage, SecondarySpSealDoc,
    StorageParams,
};
use tracing::{debug, error, info, warn};

/// Secondary addresses and seal signatures, one per redundancy index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Replication {
    pub secondary_addresses: Vec<String>,
    pub secondary_signatures: Vec<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct ReplicatorOptions {
    pub approval_factor: f64,
    pub approval_timeout: Duration,
    pub seal: SealConfig,
}

impl Default for ReplicatorOptions {
    fn default() -> Self {
        Self::new(&ReplicateConfig::default(), &SealConfig::default())
    }
}

impl ReplicatorOptions {
    pub fn new(replicate: &ReplicateConfig, seal: &SealConfig) -> Self {
        Self {
            approval_factor: replicate.approval_factor.max(1.0),
            approval_timeout: Duration::from_secs(replicate.approval_timeout_seconds),
            seal: seal.clone(),
        }
    }
}

/// An approved secondary with the addresses needed to reach and check it.
#[derive(Debug, Clone)]
struct Candidate {
    operator_address: String,
    approval_address: String,
    endpoint: String,
    approval: ReplicatePieceApproval,
}

/// Ends a resource span on every exit path.
struct SpanGuard(Arc<ResourceScope>);

impl Drop for SpanGuard {
    fn drop(&mut self) {
        self.0.done();
    }
}

/// Per-object facts fixed for the whole replication.
struct Plan {
    object_info: ObjectInfo,
    params: StorageParams,
    redundancy: u32,
    segments: u32,
    piece_size: u64,
    data_size: u64,
}

impl Plan {
    fn header(&self, redundancy_index: u32, approval: ReplicatePieceApproval) -> ReplicatePieceHeader {
        ReplicatePieceHeader {
            object_info: self.object_info.clone(),
            storage_params: self.params,
            redundancy_index,
            piece_size: self.piece_size,
            data_size: self.data_size,
            approval,
        }
    }
}

pub struct Replicator {
    store: Arc<dyn PieceStore>,
    metadb: Arc<dyn MetadataDb>,
    chain: Arc<dyn Chain>,
    signer: Arc<dyn Signer>,
    approvals: Arc<dyn ApprovalCollector>,
    client: Arc<dyn SecondaryClient>,
    scope: Arc<ResourceScope>,
    options: ReplicatorOptions,
}

impl Replicator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn PieceStore>,
        metadb: Arc<dyn MetadataDb>,
        chain: Arc<dyn Chain>,
        signer: Arc<dyn Signer>,
        approvals: Arc<dyn ApprovalCollector>,
        client: Arc<dyn SecondaryClient>,
        scope: Arc<ResourceScope>,
        options: ReplicatorOptions,
    ) -> Self {
        Self {
            store,
            metadb,
            chain,
            signer,
            approvals,
            client,
            scope,
            options,
        }
    }

    pub fn scope(&self) -> &Arc<ResourceScope> {
        &self.scope
    }

    async fn update_state(&self, object_id: ObjectId, state: JobState) {
        if let Err(err) = self.metadb.update_job_state(object_id, state).await {
            debug!(object_id = %object_id, state = state.as_str(), error = %err, "Failed to update job state");
        }
    }

    async fn storage_params(&self, fallback: StorageParams) -> SpResult<StorageParams> {
        match self.metadb.get_storage_params().await {
            Ok(params) => Ok(params),
            Err(SpError::RecordNotFound(_)) => Ok(fallback),
            Err(err) => Err(err),
        }
    }

    /// Replicates every redundancy index of `object_info` and returns who holds
    /// each one together with their seal signatures.
    pub async fn replicate(
        &self,
        object_info: &ObjectInfo,
        storage_params: StorageParams,
    ) -> SpResult<Replication> {
        let object_id = object_info.id;
        self.update_state(object_id, JobState::ReplicateObjectDoing).await;
        match self.replicate_inner(object_info, storage_params).await {
            Ok(replication) => {
                self.update_state(object_id, JobState::ReplicateObjectDone).await;
                Ok(replication)
            }
            Err(err) => {
                self.update_state(object_id, JobState::ReplicateObjectError).await;
                error!(object_id = %object_id, error = %err, "Failed to replicate object data to sp");
                Err(err)
            }
        }
    }

    async fn replicate_inner(
        &self,
        object_info: &ObjectInfo,
        storage_params: StorageParams,
    ) -> SpResult<Replication> {
        let params = self.storage_params(storage_params).await?;
        let redundancy = params.redundancy_count();
        if params.data_chunk_num == 0 || redundancy == 0 {
            return Err(SpError::InvalidParameters("storage params have no chunks".into()));
        }
        if object_info.checksums.len() != redundancy as usize + 1 {
            return Err(SpError::InvalidParameters(format!(
                "{} checksums for redundancy {redundancy}",
                object_info.checksums.len()
            )));
        }
        let segments = params.segment_count(object_info.payload_size);
        if segments == 0 {
            return Err(SpError::InvalidParameters("object has no segments".into()));
        }
        let (piece_size, data_size) = match object_info.redundancy_type {
            RedundancyType::ErasureCode => (
                params.ec_piece_size(object_info.payload_size, 0),
                (0..segments)
                    .map(|seg| params.ec_piece_size(object_info.payload_size, seg))
                    .sum(),
            ),
            RedundancyType::Replica => (
                params.segment_size(object_info.payload_size, 0),
                object_info.payload_size,
            ),
        };
        let plan = Arc::new(Plan {
            object_info: object_info.clone(),
            params,
            redundancy,
            segments,
            piece_size,
            data_size,
        });

        let candidates = self.candidates(&plan).await?;
        if candidates.len() < redundancy as usize {
            warn!(
                object_id = %object_info.id,
                approvals = candidates.len(),
                needed = redundancy,
                "Not enough secondary approvals"
            );
            return Err(SpError::ExhaustedSecondarySp);
        }

        let span = self.scope.begin_span()?;
        let _span = SpanGuard(span.clone());
        let memory = approximate_memory(&params, object_info.payload_size);
        span.reserve_memory(memory, RESERVATION_PRIORITY_HIGH)?;
        debug!(object_id = %object_info.id, reserve_size = memory, scope = %span.name(), "Reserved replicate memory");

        let candidates = Mutex::new(candidates);
        let mut done: BTreeMap<u32, (String, Vec<u8>)> = BTreeMap::new();
        let mut object = object_info.clone();
        object.secondary_sp_addresses = vec![String::new(); redundancy as usize];

        while done.len() < redundancy as usize {
            let needed: Vec<u32> = (0..redundancy).filter(|idx| !done.contains_key(idx)).collect();
            let remaining = candidates.lock().unwrap_or_else(|e| e.into_inner()).len();
            if needed.len() > remaining {
                error!(
                    object_id = %object_info.id,
                    needed = needed.len(),
                    remaining,
                    "Failed to replicate due to sp is not enough"
                );
                return Err(SpError::ExhaustedSecondarySp);
            }

            let streams = self.produce(plan.clone(), &needed)?;
            let rounds = streams
                .into_iter()
                .map(|(idx, stream)| self.replicate_index(&plan, idx, stream, &candidates));
            for outcome in futures::future::join_all(rounds).await {
                match outcome {
                    Ok((idx, candidate, signature)) => {
                        info!(
                            object_id = %object_info.id,
                            sp = %candidate.operator_address,
                            endpoint = %candidate.endpoint,
                            redundancy_index = idx,
                            "Succeed to replicate object piece stream to the target sp"
                        );
                        object.secondary_sp_addresses[idx as usize] = candidate.operator_address.clone();
                        done.insert(idx, (candidate.operator_address, signature));
                    }
                    Err((idx, err)) => {
                        warn!(object_id = %object_info.id, redundancy_index = idx, error = %err, "Failed to replicate piece stream");
                    }
                }
            }
            if let Err(err) = self.metadb.set_object_info(&object).await {
                warn!(object_id = %object_info.id, error = %err, "Failed to record secondary sps");
            }
        }

        let (secondary_addresses, secondary_signatures) = done.into_values().unzip();
        Ok(Replication {
            secondary_addresses,
            secondary_signatures,
        })
    }

    /// Approvals from distinct SPs, enriched from the metadata store and ordered
    /// by endpoint.
    async fn candidates(&self, plan: &Plan) -> SpResult<VecDeque<Candidate>> {
        let expected = (f64::from(plan.redundancy) * self.options.approval_factor).ceil() as usize;
        let request = ReplicatePieceApproval::new(
            plan.object_info.clone(),
            plan.params,
            &self.signer.operator_address(),
        );
        let approvals = self
            .approvals
            .get_secondary_replicate_piece_approval(request, expected, self.options.approval_timeout)
            .await?;

        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(approvals.len());
        for mut approval in approvals {
            let operator = approval.approved_sp_operator_address.to_lowercase();
            if !seen.insert(operator.clone()) {
                continue;
            }
            let sp = match self.metadb.get_sp_by_address(&operator).await {
                Ok(sp) => sp,
                Err(err) => {
                    warn!(sp = %operator, error = %err, "Skipping approval from unknown sp");
                    continue;
                }
            };
            approval.approved_sp_approval_address = sp.approval_address.clone();
            approval.approved_sp_endpoint = sp.endpoint.clone();
            out.push(Candidate {
                operator_address: approval.approved_sp_operator_address.clone(),
                approval_address: sp.approval_address,
                endpoint: sp.endpoint,
                approval,
            });
        }
        out.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        Ok(out.into())
    }

    /// Starts the producer writing shard `k` of every segment into stream `k`.
    fn produce(&self, plan: Arc<Plan>, needed: &[u32]) -> SpResult<Vec<(u32, Arc<PayloadStream>)>> {
        let chunk = plan.piece_size.max(1);
        let mut streams = Vec::with_capacity(needed.len());
        for &idx in needed {
            let stream = Arc::new(PayloadStream::new());
            stream.init(plan.object_info.id, idx as i32, chunk, plan.object_info.redundancy_type)?;
            streams.push((idx, stream));
        }
        let encoder = match plan.object_info.redundancy_type {
            RedundancyType::ErasureCode => Some(ErasureEncoder::from_params(&plan.params)?),
            RedundancyType::Replica => None,
        };
        let store = self.store.clone();
        let pipes = streams.clone();
        tokio::spawn(async move {
            let mut dead: HashSet<u32> = HashSet::new();
            for seg in 0..plan.segments {
                let key = segment_piece_key(plan.object_info.id, seg);
                let shards = match store.get_piece(&key, 0, 0).await {
                    Ok(data) => match &encoder {
                        Some(encoder) => encoder.encode(&data),
                        None => Ok(vec![data; plan.redundancy as usize]),
                    },
                    Err(err) => Err(err),
                };
                let shards = match shards {
                    Ok(shards) => shards,
                    Err(err) => {
                        error!(piece_key = %key, error = %err, "Failed to produce piece data");
                        for (idx, stream) in &pipes {
                            if let Err(close_err) = stream.close_with_error(err.clone()).await {
                                warn!(redundancy_index = idx, error = %close_err, "Failed to close piece stream with error");
                            }
                        }
                        return;
                    }
                };
                for (idx, stream) in &pipes {
                    if dead.contains(idx) {
                        continue;
                    }
                    let Some(shard) = shards.get(*idx as usize) else {
                        continue;
                    };
                    if stream.write(shard).await.is_err() {
                        debug!(redundancy_index = idx, "Piece consumer went away");
                        dead.insert(*idx);
                    }
                }
            }
            for (idx, stream) in &pipes {
                if dead.contains(idx) {
                    continue;
                }
                if let Err(err) = stream.close().await {
                    warn!(redundancy_index = idx, error = %err, "Failed to close piece stream");
                }
            }
        });
        Ok(streams)
    }

    fn pick(candidates: &Mutex<VecDeque<Candidate>>) -> SpResult<Candidate> {
        candidates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .ok_or(SpError::ExhaustedSecondarySp)
    }

    /// Streams one index to the next unused candidate and checks its answer.
    async fn replicate_index(
        &self,
        plan: &Plan,
        idx: u32,
        stream: Arc<PayloadStream>,
        candidates: &Mutex<VecDeque<Candidate>>,
    ) -> Result<(u32, Candidate, Vec<u8>), (u32, SpError)> {
        let Some(mut entries) = stream.entries() else {
            return Err((idx, SpError::Stream("stream already consumed".into())));
        };
        let candidate = Self::pick(candidates).map_err(|e| (idx, e))?;
        let header = plan.header(idx, candidate.approval.clone());

        while let Some(entry) = entries.recv().await {
            if let Some(err) = entry.error {
                return Err((idx, err));
            }
            if entry.eof {
                break;
            }
            self.client
                .put_piece(
                    &candidate.endpoint,
                    PutPieceRequest {
                        header: header.clone(),
                        segment_index: entry.segment_idx,
                        data: entry.data,
                    },
                )
                .await
                .map_err(|e| (idx, e))?;
        }
        drop(entries);

        let resp = self
            .client
            .done_piece(&candidate.endpoint, DonePieceRequest { header })
            .await
            .map_err(|e| (idx, e))?;
        let expected = &plan.object_info.checksums[idx as usize + 1];
        if &resp.integrity_hash != expected {
            error!(
                expected = %hex::encode(expected),
                actual = %hex::encode(&resp.integrity_hash),
                endpoint = %candidate.endpoint,
                "Failed to check root hash"
            );
            return Err((idx, SpError::MismatchIntegrityHash(idx)));
        }
        let doc = SecondarySpSealDoc {
            sp_operator_address: candidate.operator_address.clone(),
            object_id: plan.object_info.id,
            integrity_hash: resp.integrity_hash,
        };
        verify_signature(&candidate.approval_address, &doc.sign_bytes(), &resp.signature)
            .map_err(|e| (idx, e.into()))?;
        Ok((idx, candidate, resp.signature))
    }

    /// Submits the seal and waits for it to land, resubmitting on failure.
    pub async fn seal(&self, object_info: &ObjectInfo, replication: &Replication) -> SpResult<()> {
        let msg = SealObjectMessage {
            operator: self.signer.operator_address(),
            bucket_name: object_info.bucket_name.clone(),
            object_name: object_info.object_name.clone(),
            secondary_sp_addresses: replication.secondary_addresses.clone(),
            secondary_sp_signatures: replication.secondary_signatures.clone(),
        };
        let seal = &self.options.seal;
        let mut last = SpError::ChainTimeout("seal was never submitted".into());
        for retry in 1..=seal.max_retries.max(1) {
            self.update_state(object_info.id, JobState::SealObjectDoing).await;
            if let Err(err) = self.signer.seal_object_on_chain(&msg).await {
                warn!(object_id = %object_info.id, retry, error = %err, "Failed to sign object by signer");
                last = err;
                continue;
            }
            for attempt in 1..=seal.max_listen_retries.max(1) {
                match self.chain.listen_object_seal(object_info, seal.listen_window_blocks).await {
                    Ok(true) => {
                        self.update_state(object_info.id, JobState::SealObjectDone).await;
                        info!(object_id = %object_info.id, retry, "Succeed to seal object on chain");
                        return Ok(());
                    }
                    Ok(false) => {
                        debug!(object_id = %object_info.id, attempt, "Seal not observed yet");
                        last = SpError::ChainTimeout(format!(
                            "object not sealed within {} blocks",
                            seal.listen_window_blocks
                        ));
                    }
                    Err(err) => {
                        warn!(object_id = %object_info.id, attempt, error = %err, "Failed to listen object seal");
                        last = err;
                    }
                }
            }
        }
        self.update_state(object_info.id, JobState::SealObjectError).await;
        error!(object_id = %object_info.id, error = %last, "Failed to seal object");
        Err(last)
    }
}

/// Memory held while one segment and its shards are in flight.
pub fn approximate_memory(params: &StorageParams, payload_size: u64) -> i64 {
    if params.data_chunk_num == 0 {
        return 0;
    }
    let base = params.max_segment_size.min(payload_size) as f64;
    let factor = f64::from(params.redundancy_count()) / f64::from(params.data_chunk_num) + 1.0;
    (base * factor) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_estimate_caps_at_payload() {
        let params = StorageParams {
            max_segment_size: 16,
            data_chunk_num: 4,
            parity_chunk_num: 2,
            max_payload_size: 1024,
        };
        assert_eq!(approximate_memory(&params, 1000), 40);
        assert_eq!(approximate_memory(&params, 8), 20);
    }
}
