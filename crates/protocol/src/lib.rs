mod object;
pub mod signature;

pub use object::{
    ObjectId, ObjectInfo, ObjectStatus, ParseObjectIdError, RedundancyType, SpStatus,
    StorageParams, StorageProvider, Visibility,
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// pattern: /protocol-name/request-or-response-message/version
pub const PING_PROTOCOL: &str = "/ping/0.0.1";
pub const PONG_PROTOCOL: &str = "/pong/0.0.1";
pub const APPROVAL_REQUEST_PROTOCOL: &str = "/approval/request/0.0.1";
pub const APPROVAL_RESPONSE_PROTOCOL: &str = "/approval/response/0.0.1";
pub const REPLICATE_PIECE_PROTOCOL: &str = "/replicate/piece/0.0.1";

/// Canonical JSON of a message; struct field order makes it deterministic.
fn canonical_json<T: Serialize>(msg: &T) -> Vec<u8> {
    serde_json::to_vec(msg).unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NodeInfo {
    pub node_id: String,
    pub multi_addr: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Ping {
    pub sp_operator_address: String,
    pub signature: Vec<u8>,
}

impl Ping {
    pub fn sign_bytes(&self) -> Vec<u8> {
        canonical_json(&Ping {
            signature: Vec::new(),
            ..self.clone()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Pong {
    pub sp_operator_address: String,
    pub signature: Vec<u8>,
    pub nodes: Vec<NodeInfo>,
}

impl Pong {
    pub fn sign_bytes(&self) -> Vec<u8> {
        canonical_json(&Pong {
            signature: Vec::new(),
            ..self.clone()
        })
    }
}

/// Request and response share one shape: the asking SP fills the `ask_*` fields,
/// the approving SP fills the `approved_*` fields and the expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReplicatePieceApproval {
    pub object_info: Option<ObjectInfo>,
    pub storage_params: StorageParams,
    pub ask_sp_operator_address: String,
    pub ask_signature: Vec<u8>,
    pub approved_sp_operator_address: String,
    pub approved_sp_approval_address: String,
    pub approved_sp_endpoint: String,
    pub approved_signature: Vec<u8>,
    pub expired_height: u64,
}

impl ReplicatePieceApproval {
    pub fn new(object_info: ObjectInfo, storage_params: StorageParams, ask_sp: &str) -> Self {
        Self {
            object_info: Some(object_info),
            storage_params,
            ask_sp_operator_address: ask_sp.to_string(),
            ..Default::default()
        }
    }

    pub fn object_id(&self) -> Option<ObjectId> {
        self.object_info.as_ref().map(|o| o.id)
    }

    /// Bytes covered by `ask_signature`: the request with every approval field empty.
    pub fn ask_sign_bytes(&self) -> Vec<u8> {
        canonical_json(&ReplicatePieceApproval {
            object_info: self.object_info.clone(),
            storage_params: self.storage_params,
            ask_sp_operator_address: self.ask_sp_operator_address.clone(),
            ..Default::default()
        })
    }

    /// Bytes covered by `approved_signature`. The approval address and endpoint are
    /// filled in locally by the asking SP and are not part of the signed document.
    pub fn approved_sign_bytes(&self) -> Vec<u8> {
        canonical_json(&ReplicatePieceApproval {
            approved_signature: Vec::new(),
            approved_sp_approval_address: String::new(),
            approved_sp_endpoint: String::new(),
            ..self.clone()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondarySpSealDoc {
    pub sp_operator_address: String,
    pub object_id: ObjectId,
    pub integrity_hash: Vec<u8>,
}

impl SecondarySpSealDoc {
    pub fn sign_bytes(&self) -> Vec<u8> {
        canonical_json(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SealObjectMessage {
    pub operator: String,
    pub bucket_name: String,
    pub object_name: String,
    pub secondary_sp_addresses: Vec<String>,
    pub secondary_sp_signatures: Vec<Vec<u8>>,
}

/// Frame sent on `/approval/request/0.0.1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest(pub ReplicatePieceApproval);

/// Frame sent on `/approval/response/0.0.1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalResponse(pub ReplicatePieceApproval);

/// Closes a one-way overlay exchange. Receivers that drop a message send nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Ack;

/// Describes the shard set a primary SP pushes to one secondary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatePieceHeader {
    pub object_info: ObjectInfo,
    pub storage_params: StorageParams,
    pub redundancy_index: u32,
    /// Size of a full piece for this index.
    pub piece_size: u64,
    /// Total bytes this index will receive.
    pub data_size: u64,
    pub approval: ReplicatePieceApproval,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutPieceRequest {
    pub header: ReplicatePieceHeader,
    pub segment_index: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DonePieceRequest {
    pub header: ReplicatePieceHeader,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PieceCommand {
    Put(PutPieceRequest),
    Done(DonePieceRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutPieceResponse {
    pub accepted: bool,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonePieceResponse {
    pub integrity_hash: Vec<u8>,
    pub signature: Vec<u8>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PieceReply {
    Put(PutPieceResponse),
    Done(DonePieceResponse),
}

pub fn checksum(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// sha256 over the concatenated per-piece checksums.
pub fn integrity_hash(checksums: &[Vec<u8>]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for c in checksums {
        hasher.update(c);
    }
    hasher.finalize().to_vec()
}
