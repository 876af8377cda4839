use k256::ecdsa::{signature::hazmat::PrehashVerifier, RecoveryId, Signature, SigningKey, VerifyingKey};
use sha3::{Digest, Keccak256};

/// [R || S || V]
pub const SIGNATURE_LENGTH: usize = 65;
pub const RECOVERY_ID_OFFSET: usize = 64;

pub type Address = [u8; 20];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("invalid operator address '{0}'")]
    InvalidAddress(String),
    #[error("signature length (actual: {0}) doesn't match typical [R||S||V] signature 65 bytes")]
    InvalidLength(usize),
    #[error("invalid recovery id {0}")]
    InvalidRecoveryId(u8),
    #[error("malformed signature")]
    Malformed,
    #[error("failed to recover public key from signature")]
    Recover,
    #[error("signer {recovered} is different from expected {expected}")]
    SignerMismatch { recovered: String, expected: String },
    #[error("signature does not verify against the recovered key")]
    Verify,
    #[error("invalid secp256k1 private key")]
    InvalidKey,
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Parses a hex encoded 20 byte address, with or without the `0x` prefix.
pub fn parse_address(address: &str) -> Result<Address, SignatureError> {
    let trimmed = address.trim();
    let raw = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let bytes = hex::decode(raw).map_err(|_| SignatureError::InvalidAddress(address.to_string()))?;
    Address::try_from(bytes.as_slice()).map_err(|_| SignatureError::InvalidAddress(address.to_string()))
}

pub fn format_address(address: &Address) -> String {
    format!("0x{}", hex::encode(address))
}

/// Ethereum style address: the last 20 bytes of keccak256 over the uncompressed point.
pub fn address_of(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[12..]);
    address
}

pub fn address_of_signer(key: &SigningKey) -> Address {
    address_of(key.verifying_key())
}

pub fn signing_key_from_hex(private_key: &str) -> Result<SigningKey, SignatureError> {
    let trimmed = private_key.trim();
    let raw = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let bytes = hex::decode(raw).map_err(|_| SignatureError::InvalidKey)?;
    SigningKey::from_slice(&bytes).map_err(|_| SignatureError::InvalidKey)
}

/// Signs keccak256(sign_bytes) and returns the 65 byte [R || S || V] form with V in {0, 1}.
pub fn sign(key: &SigningKey, sign_bytes: &[u8]) -> Result<Vec<u8>, SignatureError> {
    let digest = keccak256(sign_bytes);
    let (signature, recovery_id) = key
        .sign_prehash_recoverable(&digest)
        .map_err(|_| SignatureError::Malformed)?;
    let mut out = signature.to_bytes().to_vec();
    out.push(recovery_id.to_byte());
    Ok(out)
}

fn split_signature(signature: &[u8]) -> Result<(Signature, RecoveryId), SignatureError> {
    if signature.len() != SIGNATURE_LENGTH {
        return Err(SignatureError::InvalidLength(signature.len()));
    }
    let mut v = signature[RECOVERY_ID_OFFSET];
    if v == 27 || v == 28 {
        v -= 27;
    }
    let recovery_id = RecoveryId::from_byte(v).ok_or(SignatureError::InvalidRecoveryId(v))?;
    let rs = Signature::from_slice(&signature[..RECOVERY_ID_OFFSET])
        .map_err(|_| SignatureError::Malformed)?;
    Ok((rs, recovery_id))
}

/// Recovers the signer address of keccak256(sign_bytes).
pub fn recover_address(sign_bytes: &[u8], signature: &[u8]) -> Result<Address, SignatureError> {
    let (rs, recovery_id) = split_signature(signature)?;
    let digest = keccak256(sign_bytes);
    let key = VerifyingKey::recover_from_prehash(&digest, &rs, recovery_id)
        .map_err(|_| SignatureError::Recover)?;
    key.verify_prehash(&digest, &rs)
        .map_err(|_| SignatureError::Verify)?;
    Ok(address_of(&key))
}

/// Checks that `signature` over `sign_bytes` was produced by the key behind `operator_address`.
pub fn verify_signature(
    operator_address: &str,
    sign_bytes: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    let expected = parse_address(operator_address)?;
    let (rs, recovery_id) = split_signature(signature)?;
    let digest = keccak256(sign_bytes);
    let key = VerifyingKey::recover_from_prehash(&digest, &rs, recovery_id)
        .map_err(|_| SignatureError::Recover)?;
    let recovered = address_of(&key);
    if recovered != expected {
        return Err(SignatureError::SignerMismatch {
            recovered: format_address(&recovered),
            expected: format_address(&expected),
        });
    }
    // [R || S] only, V is not part of the curve check
    key.verify_prehash(&digest, &rs)
        .map_err(|_| SignatureError::Verify)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_slice(&[seed; 32]).expect("valid scalar")
    }

    #[test]
    fn keccak_of_empty_input_matches_known_vector() {
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn address_of_well_known_key() {
        // private key 0x...01 maps to this address on every EVM chain
        let mut raw = [0u8; 32];
        raw[31] = 1;
        let key = SigningKey::from_slice(&raw).expect("valid scalar");
        assert_eq!(
            format_address(&address_of_signer(&key)),
            "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf"
        );
    }

    #[test]
    fn signed_message_verifies_against_signer_address() {
        let signer = key(7);
        let address = format_address(&address_of_signer(&signer));
        let sig = sign(&signer, b"ping").expect("sign");
        assert_eq!(sig.len(), SIGNATURE_LENGTH);
        assert!(verify_signature(&address, b"ping", &sig).is_ok());
        assert_eq!(recover_address(b"ping", &sig), Ok(address_of_signer(&signer)));
    }

    #[test]
    fn legacy_v_values_are_normalized() {
        let signer = key(9);
        let address = format_address(&address_of_signer(&signer));
        let mut sig = sign(&signer, b"approval").expect("sign");
        sig[RECOVERY_ID_OFFSET] += 27;
        assert!(verify_signature(&address, b"approval", &sig).is_ok());
    }

    #[test]
    fn other_signer_is_rejected() {
        let signer = key(3);
        let other = format_address(&address_of_signer(&key(4)));
        let sig = sign(&signer, b"pong").expect("sign");
        assert!(matches!(
            verify_signature(&other, b"pong", &sig),
            Err(SignatureError::SignerMismatch { .. })
        ));
    }

    #[test]
    fn tampered_payload_or_bad_shape_is_rejected() {
        let signer = key(5);
        let address = format_address(&address_of_signer(&signer));
        let sig = sign(&signer, b"payload").expect("sign");
        assert!(verify_signature(&address, b"payload!", &sig).is_err());
        assert_eq!(
            verify_signature(&address, b"payload", &sig[..64]),
            Err(SignatureError::InvalidLength(64))
        );
        assert!(verify_signature("0x1234", b"payload", &sig).is_err());
    }

    #[test]
    fn address_parsing_accepts_optional_prefix() {
        let raw = "7e5f4552091a69125d5dfcb7b8c2659029395bdf";
        assert_eq!(parse_address(raw), parse_address(&format!("0x{raw}")));
        assert!(parse_address("not-hex").is_err());
    }
}
