//! Pairing-code pairing (spec.md §4.E second path): a PBKDF2-derived key
//! wraps the companion's ephemeral public key for the `link_code_companion_reg`
//! iq, and an HKDF over the completed ECDH exchange derives `advSecretKey`
//! the same way QR pairing's `pair-success` verification expects it.

use crate::error::{Error, PairingError};
use crate::Result;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

/// Salt fixed by the wire protocol (spec.md §4.E).
const LINK_CODE_SALT: &[u8] = b"Link Code Pairing Key Bundle";
/// PBKDF2 iteration count (2^17, spec.md §4.E).
const LINK_CODE_ITERATIONS: u32 = 1 << 17;
const PAIRING_KEY_LEN: usize = 32;

/// Derives the 32-byte `pairingCode` key from the short code the user typed
/// in, via PBKDF2-HMAC-SHA256 with the fixed salt and iteration count.
pub fn derive_pairing_code_key(pairing_code: &str) -> [u8; PAIRING_KEY_LEN] {
    let mut key = [0u8; PAIRING_KEY_LEN];
    pbkdf2_hmac::<Sha256>(pairing_code.as_bytes(), LINK_CODE_SALT, LINK_CODE_ITERATIONS, &mut key);
    key
}

/// Wraps `ephemeral_pub` with the pairing-code key (AES-256-GCM, zero
/// nonce — a single value is ever wrapped under a freshly derived key) for
/// the `link_code_companion_reg` iq's `ephemeralPub` field.
pub fn wrap_ephemeral_key(pairing_code_key: &[u8; PAIRING_KEY_LEN], ephemeral_pub: &[u8; 32]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(pairing_code_key.into());
    let nonce = Nonce::from_slice(&[0u8; 12]);
    cipher
        .encrypt(nonce, Payload { msg: ephemeral_pub, aad: b"" })
        .map_err(|_| Error::Pairing(PairingError::Protocol("ephemeral key wrap failed".into())))
}

/// Inverse of [`wrap_ephemeral_key`], used by tests and by any future
/// companion-side simulation.
pub fn unwrap_ephemeral_key(pairing_code_key: &[u8; PAIRING_KEY_LEN], wrapped: &[u8]) -> Result<[u8; 32]> {
    let cipher = Aes256Gcm::new(pairing_code_key.into());
    let nonce = Nonce::from_slice(&[0u8; 12]);
    let plaintext = cipher
        .decrypt(nonce, Payload { msg: wrapped, aad: b"" })
        .map_err(|_| Error::Pairing(PairingError::Protocol("ephemeral key unwrap failed".into())))?;
    plaintext
        .try_into()
        .map_err(|_| Error::Pairing(PairingError::Protocol("unwrapped ephemeral key has wrong length".into())))
}

/// Derives `advSecretKey` from the completed exchange: HKDF-SHA256 over
/// `companion_shared || identity_shared || random` (spec.md §4.E), no
/// salt, info string fixed to match the server's derivation.
pub fn derive_adv_secret(companion_shared: &[u8; 32], identity_shared: &[u8; 32], random: &[u8; 32]) -> [u8; 32] {
    let mut ikm = Vec::with_capacity(96);
    ikm.extend_from_slice(companion_shared);
    ikm.extend_from_slice(identity_shared);
    ikm.extend_from_slice(random);

    let hk = Hkdf::<Sha256>::new(None, &ikm);
    let mut adv_secret = [0u8; 32];
    hk.expand(b"adv_secret", &mut adv_secret)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    adv_secret
}

/// Generates the random component mixed into `derive_adv_secret`.
pub fn generate_random_component() -> [u8; 32] {
    let mut random = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut random);
    random
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairing_code_key_is_deterministic() {
        let a = derive_pairing_code_key("ABCD-1234");
        let b = derive_pairing_code_key("ABCD-1234");
        assert_eq!(a, b);
    }

    #[test]
    fn pairing_code_key_differs_per_code() {
        let a = derive_pairing_code_key("ABCD-1234");
        let b = derive_pairing_code_key("WXYZ-5678");
        assert_ne!(a, b);
    }

    #[test]
    fn wrap_unwrap_roundtrip() {
        let key = derive_pairing_code_key("ABCD-1234");
        let ephemeral = [7u8; 32];
        let wrapped = wrap_ephemeral_key(&key, &ephemeral).unwrap();
        let unwrapped = unwrap_ephemeral_key(&key, &wrapped).unwrap();
        assert_eq!(unwrapped, ephemeral);
    }

    #[test]
    fn unwrap_fails_with_wrong_key() {
        let key = derive_pairing_code_key("ABCD-1234");
        let other_key = derive_pairing_code_key("WXYZ-5678");
        let wrapped = wrap_ephemeral_key(&key, &[7u8; 32]).unwrap();
        assert!(unwrap_ephemeral_key(&other_key, &wrapped).is_err());
    }

    #[test]
    fn adv_secret_is_deterministic_given_same_inputs() {
        let companion = [1u8; 32];
        let identity = [2u8; 32];
        let random = [3u8; 32];
        let a = derive_adv_secret(&companion, &identity, &random);
        let b = derive_adv_secret(&companion, &identity, &random);
        assert_eq!(a, b);
    }

    #[test]
    fn adv_secret_changes_with_random_component() {
        let companion = [1u8; 32];
        let identity = [2u8; 32];
        let a = derive_adv_secret(&companion, &identity, &[3u8; 32]);
        let b = derive_adv_secret(&companion, &identity, &[4u8; 32]);
        assert_ne!(a, b);
    }
}
