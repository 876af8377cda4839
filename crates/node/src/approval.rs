//! Secondary replicate approvals: the in-memory registry of outstanding requests,
//! the collector that gathers accepted approvals and the responder checks.

use crate::error::{SpError, SpResult};
use crate::interfaces::{Chain, Signer};
use crate::peers::PeerDirectory;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use strata_protocol::signature::verify_signature;
use strata_protocol::{ObjectId, ReplicatePieceApproval};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const RESPONSE_CHANNEL_SIZE: usize = 12;
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const MIN_SECONDARY_EXPIRED_HEIGHT: u64 = 900;

/// Decides whether this SP accepts to hold pieces of an object.
pub trait ApprovalPolicy: Send + Sync {
    fn accept(&self, request: &ReplicatePieceApproval) -> bool;
}

pub struct AcceptAll;

impl ApprovalPolicy for AcceptAll {
    fn accept(&self, _request: &ReplicatePieceApproval) -> bool {
        true
    }
}

/// One response channel per object with an outstanding request.
#[derive(Default)]
pub struct ApprovalRegistry {
    pending: Mutex<HashMap<ObjectId, mpsc::Sender<ReplicatePieceApproval>>>,
}

impl ApprovalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ObjectId, mpsc::Sender<ReplicatePieceApproval>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a request for `object_id`. Only one may be outstanding per object.
    pub fn hang_request(&self, object_id: ObjectId) -> SpResult<mpsc::Receiver<ReplicatePieceApproval>> {
        let mut pending = self.lock();
        if pending.contains_key(&object_id) {
            return Err(SpError::InvalidParameters(format!(
                "approval request for object {object_id} is running"
            )));
        }
        let (tx, rx) = mpsc::channel(RESPONSE_CHANNEL_SIZE);
        pending.insert(object_id, tx);
        Ok(rx)
    }

    pub fn cancel_request(&self, object_id: ObjectId) {
        self.lock().remove(&object_id);
    }

    pub fn is_pending(&self, object_id: ObjectId) -> bool {
        self.lock().contains_key(&object_id)
    }

    /// Hands a response to the collector waiting on its object. A full channel
    /// drops the response.
    pub fn notify_response(&self, response: ReplicatePieceApproval) -> SpResult<()> {
        let object_id = response
            .object_id()
            .ok_or_else(|| SpError::InvalidParameters("approval response missing object info".into()))?;
        let pending = self.lock();
        let Some(tx) = pending.get(&object_id) else {
            return Err(SpError::RecordNotFound(format!(
                "approval request for object {object_id} has been canceled"
            )));
        };
        match tx.try_send(response) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(object_id = %object_id, "Approval channel full, dropping response");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SpError::RecordNotFound(format!(
                "approval request for object {object_id} has been canceled"
            ))),
        }
    }

    /// Hangs a request whose registration is removed when the guard drops.
    pub fn hang_scoped(self: &Arc<Self>, object_id: ObjectId) -> SpResult<PendingApproval> {
        let rx = self.hang_request(object_id)?;
        Ok(PendingApproval {
            registry: self.clone(),
            object_id,
            rx,
        })
    }
}

pub struct PendingApproval {
    registry: Arc<ApprovalRegistry>,
    object_id: ObjectId,
    rx: mpsc::Receiver<ReplicatePieceApproval>,
}

impl PendingApproval {
    pub async fn recv(&mut self) -> Option<ReplicatePieceApproval> {
        self.rx.recv().await
    }
}

impl Drop for PendingApproval {
    fn drop(&mut self) {
        self.registry.cancel_request(self.object_id);
    }
}

fn same_address(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Approval logic shared by the overlay node: validating what arrives, building
/// responses and collecting accepted approvals for a local request.
pub struct ApprovalService {
    registry: Arc<ApprovalRegistry>,
    peers: Arc<PeerDirectory>,
    chain: Arc<dyn Chain>,
    signer: Arc<dyn Signer>,
    policy: Arc<dyn ApprovalPolicy>,
    expired_height: u64,
}

impl ApprovalService {
    pub fn new(
        peers: Arc<PeerDirectory>,
        chain: Arc<dyn Chain>,
        signer: Arc<dyn Signer>,
        expired_height: u64,
    ) -> Self {
        Self {
            registry: Arc::new(ApprovalRegistry::new()),
            peers,
            chain,
            signer,
            policy: Arc::new(AcceptAll),
            expired_height: expired_height.max(MIN_SECONDARY_EXPIRED_HEIGHT),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn ApprovalPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn registry(&self) -> &Arc<ApprovalRegistry> {
        &self.registry
    }

    pub fn operator_address(&self) -> String {
        self.signer.operator_address()
    }

    fn check_remote_sp(&self, sp: &str) -> SpResult<()> {
        if same_address(sp, &self.signer.operator_address()) {
            return Err(SpError::InvalidParameters(format!("message from self sp {sp}")));
        }
        if !self.peers.check_sp(&sp.to_lowercase()) {
            return Err(SpError::InvalidParameters(format!("unknown sp {sp}")));
        }
        Ok(())
    }

    /// Validates an incoming request and returns the signed approval to send
    /// back, or `None` when the policy refuses it.
    pub async fn on_request(&self, request: ReplicatePieceApproval) -> SpResult<Option<ReplicatePieceApproval>> {
        if request.object_info.is_none() {
            return Err(SpError::InvalidParameters("approval request missing object info".into()));
        }
        verify_signature(
            &request.ask_sp_operator_address,
            &request.ask_sign_bytes(),
            &request.ask_signature,
        )?;
        self.check_remote_sp(&request.ask_sp_operator_address)?;
        if !self.policy.accept(&request) {
            info!(
                object_id = ?request.object_id(),
                sp = %request.ask_sp_operator_address,
                "Refused approval request"
            );
            return Ok(None);
        }
        let height = self.chain.current_height().await?;
        let mut response = request;
        response.approved_sp_operator_address = self.signer.operator_address();
        response.approved_sp_approval_address = self.signer.approval_address();
        response.expired_height = height + self.expired_height;
        response.approved_signature = self.signer.sign_replicate_approval(&response).await?;
        Ok(Some(response))
    }

    /// Validates an incoming response and routes it to the waiting collector.
    pub fn on_response(&self, response: ReplicatePieceApproval) -> SpResult<()> {
        verify_signature(
            &response.approved_sp_operator_address,
            &response.approved_sign_bytes(),
            &response.approved_signature,
        )?;
        self.check_remote_sp(&response.approved_sp_operator_address)?;
        self.registry.notify_response(response)
    }

    /// Signs `approval` as the asking SP, hands it to `broadcast` and gathers
    /// unexpired approvals from distinct SPs until `expected` arrive or `timeout`
    /// passes. The request is always deregistered on return.
    pub async fn collect<F, Fut>(
        &self,
        mut approval: ReplicatePieceApproval,
        expected: usize,
        timeout: Duration,
        broadcast: F,
    ) -> SpResult<Vec<ReplicatePieceApproval>>
    where
        F: FnOnce(ReplicatePieceApproval) -> Fut,
        Fut: Future<Output = SpResult<()>>,
    {
        let object_id = approval
            .object_id()
            .ok_or_else(|| SpError::InvalidParameters("approval missing object info".into()))?;
        let mut pending = self.registry.hang_scoped(object_id)?;
        approval.ask_sp_operator_address = self.signer.operator_address();
        approval.ask_signature = self.signer.sign_replicate_approval_request(&approval).await?;
        broadcast(approval).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        let mut accepted: Vec<ReplicatePieceApproval> = Vec::new();
        let mut seen = HashSet::new();
        let mut last_height: Option<u64> = None;
        while accepted.len() < expected {
            let next = match tokio::time::timeout_at(deadline, pending.recv()).await {
                Ok(Some(next)) => next,
                Ok(None) => break,
                Err(_) => {
                    debug!(object_id = %object_id, accepted = accepted.len(), expected, "Approval collection timed out");
                    break;
                }
            };
            let height = match tokio::time::timeout_at(deadline, self.chain.current_height()).await {
                Ok(Ok(height)) => {
                    last_height = Some(height);
                    height
                }
                Ok(Err(err)) => match last_height {
                    Some(height) => {
                        warn!(object_id = %object_id, error = %err, height, "Failed to query chain height, using the last one");
                        height
                    }
                    None => {
                        warn!(object_id = %object_id, error = %err, "Failed to query chain height, skipping approval");
                        continue;
                    }
                },
                Err(_) => {
                    debug!(object_id = %object_id, accepted = accepted.len(), expected, "Approval collection timed out");
                    break;
                }
            };
            if next.expired_height < height {
                warn!(
                    object_id = %object_id,
                    sp = %next.approved_sp_operator_address,
                    expired_height = next.expired_height,
                    height,
                    "Discarding expired approval"
                );
                continue;
            }
            if !seen.insert(next.approved_sp_operator_address.to_lowercase()) {
                continue;
            }
            accepted.push(next);
        }
        info!(object_id = %object_id, accepted = accepted.len(), expected, "Collected approvals");
        Ok(accepted)
    }
}
