//! Flattened-JWS ES256 signing and verification over `secp256k1`,
//! backing the dispatcher's `requestSignature` operation.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bitcoin::secp256k1::{ecdsa, Message, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{GatewayError, GatewayResult};

const JWS_HEADER: &str = r#"{"alg":"ES256","typ":"JWT"}"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignaturePayload {
    pub addr: String,
    pub orgname: String,
    pub url: String,
    pub iat: u64,
}

/// A canonical three-field flattened JWS: `{protected, payload, signature}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlattenedJws {
    pub protected: String,
    pub payload: String,
    pub signature: String,
}

/// Signs `payload` with `secret`, producing a flattened JWS whose
/// `signature` covers `protected.payload` under ES256.
pub fn sign(payload: &SignaturePayload, secret: &[u8]) -> GatewayResult<FlattenedJws> {
    let secret_key = SecretKey::from_slice(secret)
        .map_err(|e| GatewayError::Sign(format!("invalid signing key: {e}")))?;

    let protected = URL_SAFE_NO_PAD.encode(JWS_HEADER);
    let payload_json = serde_json::to_vec(payload)
        .map_err(|e| GatewayError::Sign(format!("could not encode payload: {e}")))?;
    let payload_b64 = URL_SAFE_NO_PAD.encode(payload_json);

    let signing_input = format!("{protected}.{payload_b64}");
    let digest = Sha256::digest(signing_input.as_bytes());
    let message = Message::from_digest_slice(&digest)
        .map_err(|e| GatewayError::Sign(format!("invalid digest: {e}")))?;

    let secp = Secp256k1::new();
    let sig: ecdsa::Signature = secp.sign_ecdsa(&message, &secret_key);
    let signature = URL_SAFE_NO_PAD.encode(compact_signature(&sig));

    Ok(FlattenedJws {
        protected,
        payload: payload_b64,
        signature,
    })
}

/// Verifies a flattened JWS against `public_key` (33-byte compressed
/// `secp256k1` point). Returns `Ok(())` on a valid signature, a `Sign`
/// error otherwise.
pub fn verify(jws: &FlattenedJws, public_key: &[u8]) -> GatewayResult<()> {
    let signing_input = format!("{}.{}", jws.protected, jws.payload);
    let digest = Sha256::digest(signing_input.as_bytes());
    let message = Message::from_digest_slice(&digest)
        .map_err(|e| GatewayError::Sign(format!("invalid digest: {e}")))?;

    let sig_bytes = URL_SAFE_NO_PAD
        .decode(&jws.signature)
        .map_err(|e| GatewayError::Sign(format!("invalid signature encoding: {e}")))?;
    let sig = ecdsa::Signature::from_compact(&sig_bytes)
        .map_err(|e| GatewayError::Sign(format!("malformed signature: {e}")))?;

    let pubkey = bitcoin::secp256k1::PublicKey::from_slice(public_key)
        .map_err(|e| GatewayError::Sign(format!("invalid public key: {e}")))?;

    let secp = Secp256k1::new();
    secp.verify_ecdsa(&message, &sig, &pubkey)
        .map_err(|_| GatewayError::Sign("signature verification failed".to_string()))
}

fn compact_signature(sig: &ecdsa::Signature) -> [u8; 64] {
    sig.serialize_compact()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::rand;

    fn keypair() -> (SecretKey, bitcoin::secp256k1::PublicKey) {
        let secp = Secp256k1::new();
        let secret_key = SecretKey::new(&mut rand::thread_rng());
        let public_key = SecretKey::public_key(&secret_key, &secp);
        (secret_key, public_key)
    }

    fn payload() -> SignaturePayload {
        SignaturePayload {
            addr: "mAddrX".into(),
            orgname: "example-org".into(),
            url: "https://example.org".into(),
            iat: 1_700_000_000,
        }
    }

    #[test]
    fn signs_and_verifies_round_trip() {
        let (secret_key, public_key) = keypair();
        let jws = sign(&payload(), &secret_key.secret_bytes()).unwrap();

        assert!(jws.protected.len() > 0);
        verify(&jws, &public_key.serialize()).unwrap();
    }

    #[test]
    fn rejects_tampered_payload() {
        let (secret_key, public_key) = keypair();
        let mut jws = sign(&payload(), &secret_key.secret_bytes()).unwrap();
        jws.payload = URL_SAFE_NO_PAD.encode(b"{\"addr\":\"tampered\"}");

        let err = verify(&jws, &public_key.serialize()).unwrap_err();
        assert!(matches!(err, GatewayError::Sign(_)));
    }

    #[test]
    fn rejects_signature_from_wrong_key() {
        let (secret_key, _public_key) = keypair();
        let (_other_secret, other_public) = keypair();
        let jws = sign(&payload(), &secret_key.secret_bytes()).unwrap();

        let err = verify(&jws, &other_public.serialize()).unwrap_err();
        assert!(matches!(err, GatewayError::Sign(_)));
    }
}
