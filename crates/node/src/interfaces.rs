//! Seams to the collaborators the node drives but does not own.

use crate::error::SpResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strata_protocol::{
    DonePieceRequest, DonePieceResponse, ObjectId, ObjectInfo, Ping, Pong, PutPieceRequest,
    ReplicatePieceApproval, SealObjectMessage, SecondarySpSealDoc, StorageParams,
    StorageProvider,
};

#[async_trait]
pub trait Chain: Send + Sync {
    async fn current_height(&self) -> SpResult<u64>;
    async fn storage_params(&self) -> SpResult<StorageParams>;
    async fn sp_list(&self) -> SpResult<Vec<StorageProvider>>;
    /// Broadcasts a signed seal. `signature` is the operator's over the message.
    async fn seal_object_on_chain(&self, msg: &SealObjectMessage, signature: &[u8]) -> SpResult<()>;
    /// Waits until the object is sealed or `timeout_blocks` more blocks pass.
    async fn listen_object_seal(&self, object: &ObjectInfo, timeout_blocks: u64) -> SpResult<bool>;
}

#[async_trait]
pub trait Signer: Send + Sync {
    fn operator_address(&self) -> String;
    fn approval_address(&self) -> String;
    /// Signs the asking side of an approval.
    async fn sign_replicate_approval_request(&self, approval: &ReplicatePieceApproval) -> SpResult<Vec<u8>>;
    /// Signs the approving side of an approval.
    async fn sign_replicate_approval(&self, approval: &ReplicatePieceApproval) -> SpResult<Vec<u8>>;
    async fn sign_p2p_ping(&self, ping: &Ping) -> SpResult<Vec<u8>>;
    async fn sign_p2p_pong(&self, pong: &Pong) -> SpResult<Vec<u8>>;
    async fn sign_secondary_seal(&self, doc: &SecondarySpSealDoc) -> SpResult<Vec<u8>>;
    /// Signs and submits the seal through the chain.
    async fn seal_object_on_chain(&self, msg: &SealObjectMessage) -> SpResult<()>;
}

#[async_trait]
pub trait PieceStore: Send + Sync {
    /// Reads `len` bytes from `offset`; `len == 0` reads to the end.
    async fn get_piece(&self, key: &str, offset: u64, len: u64) -> SpResult<Vec<u8>>;
    async fn put_piece(&self, key: &str, data: Vec<u8>) -> SpResult<()>;
    async fn delete_piece(&self, key: &str) -> SpResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    UploadObjectDoing,
    UploadObjectDone,
    UploadObjectError,
    ReplicateObjectDoing,
    ReplicateObjectDone,
    ReplicateObjectError,
    SealObjectDoing,
    SealObjectDone,
    SealObjectError,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::UploadObjectDoing => "upload_object_doing",
            JobState::UploadObjectDone => "upload_object_done",
            JobState::UploadObjectError => "upload_object_error",
            JobState::ReplicateObjectDoing => "replicate_object_doing",
            JobState::ReplicateObjectDone => "replicate_object_done",
            JobState::ReplicateObjectError => "replicate_object_error",
            JobState::SealObjectDoing => "seal_object_doing",
            JobState::SealObjectDone => "seal_object_done",
            JobState::SealObjectError => "seal_object_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub object_id: ObjectId,
    pub state: JobState,
    pub create_time: i64,
    pub update_time: i64,
}

/// Integrity of the pieces one SP holds for an object. `replicate_idx` is -1 on
/// the primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectIntegrity {
    pub object_id: ObjectId,
    pub replicate_idx: i32,
    pub checksums: Vec<Vec<u8>>,
    pub integrity_hash: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedObject {
    pub object_info: ObjectInfo,
    pub storage_params: StorageParams,
    pub delete_block: u64,
}

/// Deleted objects in a block window plus the highest block the metadata
/// store has caught up to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeletedObjects {
    pub objects: Vec<DeletedObject>,
    pub end_block: u64,
}

#[async_trait]
pub trait MetadataDb: Send + Sync {
    async fn create_upload_job(&self, object: &ObjectInfo) -> SpResult<()>;
    async fn update_job_state(&self, object_id: ObjectId, state: JobState) -> SpResult<()>;
    async fn get_job(&self, object_id: ObjectId) -> SpResult<JobRecord>;
    async fn set_object_info(&self, object: &ObjectInfo) -> SpResult<()>;
    async fn get_object_info(&self, object_id: ObjectId) -> SpResult<ObjectInfo>;
    async fn set_object_integrity(&self, integrity: &ObjectIntegrity) -> SpResult<()>;
    async fn get_object_integrity(&self, object_id: ObjectId, replicate_idx: i32) -> SpResult<ObjectIntegrity>;
    async fn update_all_sp(&self, sps: &[StorageProvider]) -> SpResult<()>;
    async fn get_sp_by_address(&self, operator_address: &str) -> SpResult<StorageProvider>;
    async fn get_storage_params(&self) -> SpResult<StorageParams>;
    async fn set_storage_params(&self, params: &StorageParams) -> SpResult<()>;
    async fn list_deleted_objects(&self, start_block: u64, end_block: u64) -> SpResult<DeletedObjects>;
}

/// Gathers signed replicate approvals from other SPs.
#[async_trait]
pub trait ApprovalCollector: Send + Sync {
    async fn get_secondary_replicate_piece_approval(
        &self,
        approval: ReplicatePieceApproval,
        expected: usize,
        timeout: Duration,
    ) -> SpResult<Vec<ReplicatePieceApproval>>;
}

/// Pushes pieces to a secondary SP reachable at `endpoint`.
#[async_trait]
pub trait SecondaryClient: Send + Sync {
    async fn put_piece(&self, endpoint: &str, req: PutPieceRequest) -> SpResult<()>;
    async fn done_piece(&self, endpoint: &str, req: DonePieceRequest) -> SpResult<DonePieceResponse>;
}
