use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

/// An Ed25519 keypair plus the DID derived from it.
///
/// The DID is `did:ensemble:` followed by the first 20 characters of the
/// base64-encoded public key: stable for a keypair, statistically unique
/// across a mesh, and short enough to log.
pub struct NodeIdentity {
    signing_key: SigningKey,
    did: String,
}

impl NodeIdentity {
    /// Generate a fresh keypair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let did = did_for(&signing_key.verifying_key());
        Self { signing_key, did }
    }

    pub fn did(&self) -> &str {
        &self.did
    }

    /// Base64-encoded public key, as peers verify against.
    pub fn public_key_b64(&self) -> String {
        BASE64.encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign a message, returning the base64-encoded signature.
    pub fn sign(&self, message: &[u8]) -> String {
        BASE64.encode(self.signing_key.sign(message).to_bytes())
    }
}

fn did_for(verifying_key: &VerifyingKey) -> String {
    let encoded = BASE64.encode(verifying_key.to_bytes());
    format!("did:ensemble:{}", &encoded[..20])
}

/// Verify a base64 signature over `message` against a base64 public key.
/// Any decoding failure verifies as false.
pub fn verify_signature(public_key_b64: &str, message: &[u8], signature_b64: &str) -> bool {
    let Ok(key_bytes) = BASE64.decode(public_key_b64) else {
        return false;
    };
    let Ok(key_bytes) = <[u8; 32]>::try_from(key_bytes) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = BASE64.decode(signature_b64) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&sig_bytes) else {
        return false;
    };
    verifying_key.verify(message, &signature).is_ok()
}
