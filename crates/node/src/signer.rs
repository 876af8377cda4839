use crate::error::SpResult;
use crate::interfaces::{Chain, Signer};
use async_trait::async_trait;
use k256::ecdsa::SigningKey;
use std::sync::Arc;
use strata_protocol::signature::{address_of_signer, format_address, sign, signing_key_from_hex};
use strata_protocol::{Ping, Pong, ReplicatePieceApproval, SealObjectMessage, SecondarySpSealDoc};
use tracing::info;

/// Signs with keys held in process. The operator key covers overlay messages,
/// approvals and seal transactions; the approval key covers secondary seal docs.
pub struct LocalSigner {
    operator_key: SigningKey,
    approval_key: SigningKey,
    chain: Arc<dyn Chain>,
}

impl LocalSigner {
    pub fn new(operator_key: SigningKey, approval_key: SigningKey, chain: Arc<dyn Chain>) -> Self {
        Self {
            operator_key,
            approval_key,
            chain,
        }
    }

    pub fn from_hex(operator_key: &str, approval_key: &str, chain: Arc<dyn Chain>) -> SpResult<Self> {
        Ok(Self::new(
            signing_key_from_hex(operator_key)?,
            signing_key_from_hex(approval_key)?,
            chain,
        ))
    }
}

#[async_trait]
impl Signer for LocalSigner {
    fn operator_address(&self) -> String {
        format_address(&address_of_signer(&self.operator_key))
    }

    fn approval_address(&self) -> String {
        format_address(&address_of_signer(&self.approval_key))
    }

    async fn sign_replicate_approval_request(&self, approval: &ReplicatePieceApproval) -> SpResult<Vec<u8>> {
        Ok(sign(&self.operator_key, &approval.ask_sign_bytes())?)
    }

    async fn sign_replicate_approval(&self, approval: &ReplicatePieceApproval) -> SpResult<Vec<u8>> {
        Ok(sign(&self.operator_key, &approval.approved_sign_bytes())?)
    }

    async fn sign_p2p_ping(&self, ping: &Ping) -> SpResult<Vec<u8>> {
        Ok(sign(&self.operator_key, &ping.sign_bytes())?)
    }

    async fn sign_p2p_pong(&self, pong: &Pong) -> SpResult<Vec<u8>> {
        Ok(sign(&self.operator_key, &pong.sign_bytes())?)
    }

    async fn sign_secondary_seal(&self, doc: &SecondarySpSealDoc) -> SpResult<Vec<u8>> {
        Ok(sign(&self.approval_key, &doc.sign_bytes())?)
    }

    async fn seal_object_on_chain(&self, msg: &SealObjectMessage) -> SpResult<()> {
        let body = serde_json::to_vec(msg).unwrap_or_default();
        let signature = sign(&self.operator_key, &body)?;
        self.chain.seal_object_on_chain(msg, &signature).await?;
        info!(bucket = %msg.bucket_name, object = %msg.object_name, "Submitted seal object");
        Ok(())
    }
}
