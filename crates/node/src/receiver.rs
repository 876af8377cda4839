//! Secondary side of replication: accepts pieces pushed under an approval this SP
//! issued, and on completion answers with the integrity hash and a seal signature.

use crate::error::{SpError, SpResult};
use crate::interfaces::{Chain, MetadataDb, ObjectIntegrity, PieceStore, Signer};
use crate::piece::{ec_piece_key, segment_piece_key};
use crate::task::{Task, TaskConfig, TaskKind};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use strata_protocol::signature::verify_signature;
use strata_protocol::{
    checksum, integrity_hash, DonePieceRequest, DonePieceResponse, ObjectId, PutPieceRequest,
    PutPieceResponse, RedundancyType, ReplicatePieceHeader, SecondarySpSealDoc,
};
use tracing::{debug, info, warn};

struct ReceiveSession {
    task: Task,
    checksums: BTreeMap<u32, Vec<u8>>,
}

pub struct PieceReceiver {
    store: Arc<dyn PieceStore>,
    metadb: Arc<dyn MetadataDb>,
    chain: Arc<dyn Chain>,
    signer: Arc<dyn Signer>,
    task_config: TaskConfig,
    sessions: Mutex<HashMap<(ObjectId, u32), ReceiveSession>>,
}

impl PieceReceiver {
    pub fn new(
        store: Arc<dyn PieceStore>,
        metadb: Arc<dyn MetadataDb>,
        chain: Arc<dyn Chain>,
        signer: Arc<dyn Signer>,
        task_config: TaskConfig,
    ) -> Self {
        Self {
            store,
            metadb,
            chain,
            signer,
            task_config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// The approval in the header must be one this SP signed, for this object,
    /// and not yet expired.
    async fn validate(&self, header: &ReplicatePieceHeader) -> SpResult<()> {
        let approval = &header.approval;
        let own = self.signer.operator_address();
        if !approval.approved_sp_operator_address.eq_ignore_ascii_case(&own) {
            return Err(SpError::InvalidParameters(format!(
                "approval issued by {} not {own}",
                approval.approved_sp_operator_address
            )));
        }
        verify_signature(&own, &approval.approved_sign_bytes(), &approval.approved_signature)?;
        if approval.object_id() != Some(header.object_info.id) {
            return Err(SpError::InvalidParameters("approval is for another object".into()));
        }
        let height = self.chain.current_height().await?;
        if approval.expired_height < height {
            return Err(SpError::InvalidParameters(format!(
                "approval expired at {} current {height}",
                approval.expired_height
            )));
        }
        if header.redundancy_index >= header.storage_params.redundancy_count() {
            return Err(SpError::InvalidParameters(format!(
                "redundancy index {} out of range",
                header.redundancy_index
            )));
        }
        Ok(())
    }

    fn piece_key(header: &ReplicatePieceHeader, segment_idx: u32) -> String {
        match header.object_info.redundancy_type {
            RedundancyType::ErasureCode => {
                ec_piece_key(header.object_info.id, header.redundancy_index, segment_idx)
            }
            RedundancyType::Replica => segment_piece_key(header.object_info.id, segment_idx),
        }
    }

    async fn put(&self, req: PutPieceRequest) -> SpResult<()> {
        self.validate(&req.header).await?;
        let header = &req.header;
        let segments = header.storage_params.segment_count(header.object_info.payload_size);
        if req.segment_index >= segments {
            return Err(SpError::InvalidParameters(format!(
                "segment {} beyond {segments} segments",
                req.segment_index
            )));
        }
        let sum = checksum(&req.data);
        let size = req.data.len() as u64;
        self.store
            .put_piece(&Self::piece_key(header, req.segment_index), req.data)
            .await?;

        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.retain(|key, s| {
            let keep = !s.task.expired();
            if !keep {
                warn!(object_id = %key.0, replicate_idx = key.1, "Dropping stale receive session");
            }
            keep
        });
        let key = (header.object_info.id, header.redundancy_index);
        let session = sessions.entry(key).or_insert_with(|| ReceiveSession {
            task: self.task_config.receive_task(
                header.object_info.clone(),
                header.storage_params,
                header.redundancy_index,
                -1,
                header.piece_size,
            ),
            checksums: BTreeMap::new(),
        });
        session.task.touch();
        session.checksums.insert(req.segment_index, sum);
        debug!(
            task = %session.task.key,
            segment = req.segment_index,
            size,
            "Received piece"
        );
        Ok(())
    }

    pub async fn handle_put(&self, req: PutPieceRequest) -> PutPieceResponse {
        let object_id = req.header.object_info.id;
        match self.put(req).await {
            Ok(()) => PutPieceResponse {
                accepted: true,
                error: String::new(),
            },
            Err(err) => {
                warn!(object_id = %object_id, error = %err, "Rejected piece");
                PutPieceResponse {
                    accepted: false,
                    error: err.to_string(),
                }
            }
        }
    }

    async fn done(&self, req: DonePieceRequest) -> SpResult<DonePieceResponse> {
        self.validate(&req.header).await?;
        let header = req.header;
        let key = (header.object_info.id, header.redundancy_index);
        let session = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
        let expected = header.storage_params.segment_count(header.object_info.payload_size) as usize;
        let session = match session {
            Some(s) => s,
            None if expected == 0 => ReceiveSession {
                task: self.task_config.receive_task(
                    header.object_info.clone(),
                    header.storage_params,
                    header.redundancy_index,
                    -1,
                    header.piece_size,
                ),
                checksums: BTreeMap::new(),
            },
            None => {
                return Err(SpError::RecordNotFound(format!(
                    "no pieces received for object {} index {}",
                    key.0, key.1
                )))
            }
        };
        if session.checksums.len() != expected {
            return Err(SpError::InvalidParameters(format!(
                "received {} of {expected} pieces",
                session.checksums.len()
            )));
        }
        let checksums: Vec<Vec<u8>> = session.checksums.into_values().collect();
        let hash = integrity_hash(&checksums);
        let doc = SecondarySpSealDoc {
            sp_operator_address: self.signer.operator_address(),
            object_id: header.object_info.id,
            integrity_hash: hash.clone(),
        };
        let signature = self.signer.sign_secondary_seal(&doc).await?;
        self.metadb.set_object_info(&header.object_info).await?;
        self.metadb
            .set_object_integrity(&ObjectIntegrity {
                object_id: header.object_info.id,
                replicate_idx: header.redundancy_index as i32,
                checksums,
                integrity_hash: hash.clone(),
                signature: signature.clone(),
            })
            .await?;
        if let TaskKind::ReceivePiece(t) = &session.task.kind {
            info!(
                object_id = %t.object_info.id,
                replicate_idx = t.replicate_idx,
                pieces = expected,
                "Finished receiving pieces"
            );
        }
        Ok(DonePieceResponse {
            integrity_hash: hash,
            signature,
            error: String::new(),
        })
    }

    pub async fn handle_done(&self, req: DonePieceRequest) -> DonePieceResponse {
        let object_id = req.header.object_info.id;
        match self.done(req).await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(object_id = %object_id, error = %err, "Failed to finish receiving");
                DonePieceResponse {
                    integrity_hash: Vec::new(),
                    signature: Vec::new(),
                    error: err.to_string(),
                }
            }
        }
    }
}
