//! Cryptographic helpers shared across the Crewline backend.

use anyhow::Result;
use ed25519_dalek::Signer;
use rand::rngs::OsRng;

pub use ed25519_dalek::{Signature, SigningKey, VerifyingKey};

pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

pub fn verifying_key_from(signing_key: &SigningKey) -> VerifyingKey {
    signing_key.verifying_key()
}

pub fn sign_message(signing_key: &SigningKey, message: &[u8]) -> Signature {
    signing_key.sign(message)
}

pub fn verify_signature(
    verifying_key: &VerifyingKey,
    message: &[u8],
    signature: &Signature,
) -> Result<()> {
    verifying_key
        .verify_strict(message, signature)
        .map_err(|err| anyhow::anyhow!(err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_verify_against_the_derived_key() {
        let signing = generate_signing_key();
        let verifying = verifying_key_from(&signing);
        let signature = sign_message(&signing, b"crew token");

        assert!(verify_signature(&verifying, b"crew token", &signature).is_ok());
        assert!(verify_signature(&verifying, b"tampered", &signature).is_err());
    }
}
