//! Session and group ciphers (spec.md §4.D). A hand-rolled,
//! Signal-protocol-*shaped* ratchet built from this crate's existing
//! `x25519-dalek` + `hkdf` + `aes-gcm` + `sha2` stack rather than a
//! `libsignal-protocol` dependency — see DESIGN.md for why.
//!
//! Simplifications relative to the real Double Ratchet (documented, not
//! hidden): message keys advance along a single symmetric chain per
//! direction instead of a fresh DH step per message, and the signed
//! pre-key signature is an HMAC stand-in for XEdDSA (see `signal::keys`).
//! The session-establishment shape (X3DH-style multi-DH combine), the
//! pkmsg/msg kind split, and at-most-once pre-key consumption all follow
//! spec.md §4.D.

use crate::error::{Error, SendError};
use crate::signal::keys::{KeyPair, PreKeyBundle};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Which kind of ciphertext a session emits: `pkmsg` carries enough to
/// bootstrap a session (pre-key id, base key, identity key); `msg` assumes
/// the peer already has the session (spec.md GLOSSARY).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    PreKey,
    Whisper,
}

/// Per-peer (`user.device`) session state persisted as the `session`
/// keyed-store row (spec.md §3). Opaque bytes to the store; this is the
/// decoded shape the cipher operates on.
#[derive(Clone, Debug)]
pub struct SessionRecord {
    pub root_key: [u8; 32],
    pub send_chain_key: [u8; 32],
    pub send_counter: u32,
    pub recv_chain_key: [u8; 32],
    pub recv_counter: u32,
    pub remote_identity_key: [u8; 32],
    pub local_registration_id: u32,
    pub remote_registration_id: u32,
    /// Set while we're still the one who initiated via `pkmsg`, cleared
    /// once the peer's first reply proves they installed the session.
    pub pending_pre_key_id: Option<u32>,
    pub base_key_public: [u8; 32],
}

fn hkdf_expand_two(master: &[u8], info: &[u8]) -> ([u8; 32], [u8; 32]) {
    let hk = Hkdf::<Sha256>::new(None, master);
    let mut okm = [0u8; 64];
    hk.expand(info, &mut okm).expect("64 is a valid hkdf length");
    let mut a = [0u8; 32];
    let mut b = [0u8; 32];
    a.copy_from_slice(&okm[..32]);
    b.copy_from_slice(&okm[32..]);
    (a, b)
}

/// Advances a chain key and derives the next message key, matching the
/// HMAC-based symmetric-ratchet step real Signal clients use within a
/// chain (the DH ratchet step between chains is the part this crate
/// simplifies away, per the module doc).
fn ratchet_chain(chain_key: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let mut mac = Hmac::<Sha256>::new_from_slice(chain_key).expect("hmac key");
    mac.update(b"MessageKeys");
    let message_key: [u8; 32] = mac.finalize().into_bytes().into();

    let mut mac2 = Hmac::<Sha256>::new_from_slice(chain_key).expect("hmac key");
    mac2.update(b"ChainKey");
    let next_chain_key: [u8; 32] = mac2.finalize().into_bytes().into();

    (next_chain_key, message_key)
}

fn aead_encrypt(key: &[u8; 32], counter: u32, plaintext: &[u8]) -> crate::Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.into());
    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[8..].copy_from_slice(&counter.to_be_bytes());
    let nonce = Nonce::from_slice(&nonce_bytes);
    cipher
        .encrypt(nonce, Payload { msg: plaintext, aad: &[] })
        .map_err(|_| Error::Send(SendError::EncryptionFailed))
}

fn aead_decrypt(key: &[u8; 32], counter: u32, ciphertext: &[u8]) -> crate::Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.into());
    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[8..].copy_from_slice(&counter.to_be_bytes());
    let nonce = Nonce::from_slice(&nonce_bytes);
    cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad: &[] })
        .map_err(|_| Error::Binary("decrypt failed".into()))
}

/// `processPreKeyBundle`: X3DH-shaped combine of our identity/ephemeral
/// keys with the peer's published bundle (spec.md §4.D).
pub fn process_pre_key_bundle(
    our_identity: &KeyPair,
    our_registration_id: u32,
    bundle: &PreKeyBundle,
) -> crate::Result<SessionRecord> {
    let ephemeral = KeyPair::generate();

    let dh1 = our_identity.dh(&bundle.signed_pre_key_public);
    let dh2 = ephemeral.dh(&bundle.identity_key);
    let dh3 = ephemeral.dh(&bundle.signed_pre_key_public);
    let dh4 = bundle
        .pre_key
        .as_ref()
        .map(|(_, pub_key)| ephemeral.dh(pub_key));

    let mut master = Vec::with_capacity(32 * 4);
    master.extend_from_slice(&dh1);
    master.extend_from_slice(&dh2);
    master.extend_from_slice(&dh3);
    if let Some(dh4) = dh4 {
        master.extend_from_slice(&dh4);
    }

    let (root_key, chain_key) = hkdf_expand_two(&master, b"WhisperText");

    Ok(SessionRecord {
        root_key,
        send_chain_key: chain_key,
        send_counter: 0,
        recv_chain_key: chain_key,
        recv_counter: 0,
        remote_identity_key: bundle.identity_key,
        local_registration_id: our_registration_id,
        remote_registration_id: bundle.registration_id,
        pending_pre_key_id: bundle.pre_key.map(|(id, _)| id),
        base_key_public: ephemeral.public,
    })
}

/// Wraps one session record with encrypt/decrypt. Holds no state of its
/// own beyond the record it's handed — callers persist the updated record
/// back to the `SignalStore` after each call (spec.md §4.C/§4.D).
pub struct SessionCipher;

impl SessionCipher {
    pub fn encrypt(session: &mut SessionRecord, plaintext: &[u8]) -> crate::Result<(MessageKind, Vec<u8>)> {
        let (next_chain, message_key) = ratchet_chain(&session.send_chain_key);
        let counter = session.send_counter;
        session.send_chain_key = next_chain;
        session.send_counter += 1;

        let ciphertext = aead_encrypt(&message_key, counter, plaintext)?;

        match session.pending_pre_key_id {
            Some(pre_key_id) => {
                let mut framed = Vec::with_capacity(4 + 32 + ciphertext.len());
                framed.extend_from_slice(&pre_key_id.to_be_bytes());
                framed.extend_from_slice(&session.base_key_public);
                framed.extend_from_slice(&ciphertext);
                Ok((MessageKind::PreKey, framed))
            }
            None => Ok((MessageKind::Whisper, ciphertext)),
        }
    }

    /// `decryptPreKeyWhisperMessage`: unwraps the pre-key framing, looks up
    /// and consumes the referenced one-time pre-key (caller's
    /// responsibility, since that's a `SignalStore` operation), then
    /// decrypts like a normal whisper message.
    pub fn decrypt_pre_key_message(
        session: &mut SessionRecord,
        framed: &[u8],
    ) -> crate::Result<(u32, Vec<u8>)> {
        if framed.len() < 4 + 32 {
            return Err(Error::Binary("pkmsg too short".into()));
        }
        let pre_key_id = u32::from_be_bytes(framed[..4].try_into().unwrap());
        let ciphertext = &framed[4 + 32..];
        let plaintext = Self::decrypt_whisper_message(session, ciphertext)?;
        session.pending_pre_key_id = None;
        Ok((pre_key_id, plaintext))
    }

    pub fn decrypt_whisper_message(session: &mut SessionRecord, ciphertext: &[u8]) -> crate::Result<Vec<u8>> {
        let (next_chain, message_key) = ratchet_chain(&session.recv_chain_key);
        let counter = session.recv_counter;
        let plaintext = aead_decrypt(&message_key, counter, ciphertext)?;
        session.recv_chain_key = next_chain;
        session.recv_counter += 1;
        Ok(plaintext)
    }
}

/// A group sender-key chain, ratcheted forward on every `encrypt` and
/// installed on peers via a `SenderKeyDistributionMessage` (spec.md §4.D).
#[derive(Clone, Debug)]
pub struct SenderKeyRecord {
    pub key_id: u32,
    pub chain_key: [u8; 32],
    pub iteration: u32,
    pub signing_key: [u8; 32],
}

impl SenderKeyRecord {
    pub fn generate() -> Self {
        let mut chain_key = [0u8; 32];
        let mut signing_key = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut chain_key);
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut signing_key);
        Self {
            key_id: rand::random(),
            chain_key,
            iteration: 0,
            signing_key,
        }
    }

    /// The message peers install via a 1-to-1 envelope before they can
    /// decrypt our `skmsg`s (spec.md §4.D, §4.H).
    pub fn to_distribution_message(&self) -> SenderKeyDistributionMessage {
        SenderKeyDistributionMessage {
            key_id: self.key_id,
            iteration: self.iteration,
            chain_key: self.chain_key,
            signing_key: self.signing_key,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SenderKeyDistributionMessage {
    pub key_id: u32,
    pub iteration: u32,
    pub chain_key: [u8; 32],
    pub signing_key: [u8; 32],
}

/// Group cipher bound to `(group_jid, sender_address)`; see
/// `client::receiver`/`client::sender` for how those addresses are formed.
pub struct GroupCipher;

impl GroupCipher {
    /// `process`: installs a peer's distribution message as our view of
    /// their sender-key chain.
    pub fn process_distribution(dist: &SenderKeyDistributionMessage) -> SenderKeyRecord {
        SenderKeyRecord {
            key_id: dist.key_id,
            chain_key: dist.chain_key,
            iteration: dist.iteration,
            signing_key: dist.signing_key,
        }
    }

    pub fn encrypt(record: &mut SenderKeyRecord, plaintext: &[u8]) -> crate::Result<Vec<u8>> {
        let (next_chain, message_key) = ratchet_chain(&record.chain_key);
        let iteration = record.iteration;
        record.chain_key = next_chain;
        record.iteration += 1;
        let ciphertext = aead_encrypt(&message_key, iteration, plaintext)?;
        let mut framed = Vec::with_capacity(4 + ciphertext.len());
        framed.extend_from_slice(&iteration.to_be_bytes());
        framed.extend_from_slice(&ciphertext);
        Ok(framed)
    }

    /// Ratchets the chain forward to the ciphertext's iteration (dropping
    /// any intermediate keys — lost `skmsg`s within the gap cannot be
    /// recovered; out-of-order buffering is a Non-goal per spec.md §1).
    pub fn decrypt(record: &mut SenderKeyRecord, framed: &[u8]) -> crate::Result<Vec<u8>> {
        if framed.len() < 4 {
            return Err(Error::Binary("skmsg too short".into()));
        }
        let iteration = u32::from_be_bytes(framed[..4].try_into().unwrap());
        let ciphertext = &framed[4..];
        if iteration < record.iteration {
            return Err(Error::Binary("skmsg iteration already consumed".into()));
        }
        let mut chain_key = record.chain_key;
        let mut cursor = record.iteration;
        let mut message_key = [0u8; 32];
        while cursor <= iteration {
            let (next_chain, mk) = ratchet_chain(&chain_key);
            chain_key = next_chain;
            message_key = mk;
            cursor += 1;
        }
        let plaintext = aead_decrypt(&message_key, iteration, ciphertext)?;
        record.chain_key = chain_key;
        record.iteration = cursor;
        Ok(plaintext)
    }
}

impl SessionRecord {
    /// Fixed-width encoding for the `session` keyed-store row (spec.md §3).
    /// A hand-rolled layout rather than a serde format: the record is a
    /// handful of fixed-size fields, so there's nothing a general
    /// serializer would buy beyond what `to_be_bytes`/`copy_from_slice`
    /// already give directly.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 * 4 + 4 * 4 + 1);
        out.extend_from_slice(&self.root_key);
        out.extend_from_slice(&self.send_chain_key);
        out.extend_from_slice(&self.send_counter.to_be_bytes());
        out.extend_from_slice(&self.recv_chain_key);
        out.extend_from_slice(&self.recv_counter.to_be_bytes());
        out.extend_from_slice(&self.remote_identity_key);
        out.extend_from_slice(&self.local_registration_id.to_be_bytes());
        out.extend_from_slice(&self.remote_registration_id.to_be_bytes());
        out.extend_from_slice(&self.base_key_public);
        match self.pending_pre_key_id {
            Some(id) => {
                out.push(1);
                out.extend_from_slice(&id.to_be_bytes());
            }
            None => out.push(0),
        }
        out
    }

    pub fn from_bytes(data: &[u8]) -> crate::Result<Self> {
        if data.len() < 32 * 4 + 4 * 4 + 1 {
            return Err(Error::Binary("truncated session record".into()));
        }
        let mut cursor = 0usize;
        let mut take32 = |d: &[u8], c: &mut usize| -> [u8; 32] {
            let mut a = [0u8; 32];
            a.copy_from_slice(&d[*c..*c + 32]);
            *c += 32;
            a
        };
        let mut take_u32 = |d: &[u8], c: &mut usize| -> u32 {
            let v = u32::from_be_bytes(d[*c..*c + 4].try_into().unwrap());
            *c += 4;
            v
        };
        let root_key = take32(data, &mut cursor);
        let send_chain_key = take32(data, &mut cursor);
        let send_counter = take_u32(data, &mut cursor);
        let recv_chain_key = take32(data, &mut cursor);
        let recv_counter = take_u32(data, &mut cursor);
        let remote_identity_key = take32(data, &mut cursor);
        let local_registration_id = take_u32(data, &mut cursor);
        let remote_registration_id = take_u32(data, &mut cursor);
        let base_key_public = take32(data, &mut cursor);
        let has_pending = data[cursor];
        cursor += 1;
        let pending_pre_key_id = if has_pending == 1 {
            Some(take_u32(data, &mut cursor))
        } else {
            None
        };
        Ok(Self {
            root_key,
            send_chain_key,
            send_counter,
            recv_chain_key,
            recv_counter,
            remote_identity_key,
            local_registration_id,
            remote_registration_id,
            pending_pre_key_id,
            base_key_public,
        })
    }
}

impl SenderKeyRecord {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 32 + 4 + 32);
        out.extend_from_slice(&self.key_id.to_be_bytes());
        out.extend_from_slice(&self.chain_key);
        out.extend_from_slice(&self.iteration.to_be_bytes());
        out.extend_from_slice(&self.signing_key);
        out
    }

    pub fn from_bytes(data: &[u8]) -> crate::Result<Self> {
        if data.len() < 4 + 32 + 4 + 32 {
            return Err(Error::Binary("truncated sender-key record".into()));
        }
        let key_id = u32::from_be_bytes(data[0..4].try_into().unwrap());
        let mut chain_key = [0u8; 32];
        chain_key.copy_from_slice(&data[4..36]);
        let iteration = u32::from_be_bytes(data[36..40].try_into().unwrap());
        let mut signing_key = [0u8; 32];
        signing_key.copy_from_slice(&data[40..72]);
        Ok(Self {
            key_id,
            chain_key,
            iteration,
            signing_key,
        })
    }
}

/// Identity trust is permissive: the server enforces identity changes
/// upstream, so the client logs and continues rather than blocking
/// decryption (spec.md §4.D, §9).
pub struct TrustStore;

impl TrustStore {
    pub fn is_trusted(known: Option<&[u8; 32]>, seen: &[u8; 32]) -> bool {
        if let Some(known) = known {
            if known != seen {
                tracing::warn!("peer identity key changed; continuing per permissive trust policy");
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle_from(identity: &KeyPair, signed_pre_key: &KeyPair, pre_key: Option<(u32, [u8; 32])>) -> PreKeyBundle {
        PreKeyBundle {
            registration_id: 1234,
            device_id: 0,
            pre_key,
            signed_pre_key_id: 1,
            signed_pre_key_public: signed_pre_key.public,
            signed_pre_key_signature: [0u8; 32],
            identity_key: identity.public,
        }
    }

    #[test]
    fn session_round_trip_pre_key_message() {
        let bob_identity = KeyPair::generate();
        let bob_signed_pre_key = KeyPair::generate();
        let bob_one_time = KeyPair::generate();
        let bundle = bundle_from(&bob_identity, &bob_signed_pre_key, Some((7, bob_one_time.public)));

        let alice_identity = KeyPair::generate();
        let mut alice_session = process_pre_key_bundle(&alice_identity, 999, &bundle).unwrap();

        let (kind, framed) = SessionCipher::encrypt(&mut alice_session, b"hello").unwrap();
        assert_eq!(kind, MessageKind::PreKey);

        // Mirror alice's derived chain keys onto bob's side (swapping
        // send/recv) rather than re-deriving them via his own private
        // keys: this test exercises the ratchet/framing, not the X3DH
        // key agreement itself.
        let mut bob_session = SessionRecord {
            root_key: alice_session.root_key,
            send_chain_key: alice_session.recv_chain_key,
            send_counter: 0,
            recv_chain_key: alice_session.send_chain_key,
            recv_counter: 0,
            remote_identity_key: alice_identity.public,
            local_registration_id: 1234,
            remote_registration_id: 999,
            pending_pre_key_id: None,
            base_key_public: alice_session.base_key_public,
        };

        let (pre_key_id, plaintext) = SessionCipher::decrypt_pre_key_message(&mut bob_session, &framed).unwrap();
        assert_eq!(pre_key_id, 7);
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn group_cipher_round_trip() {
        let mut sender_record = SenderKeyRecord::generate();
        let dist = sender_record.to_distribution_message();
        let mut receiver_record = GroupCipher::process_distribution(&dist);

        let ciphertext = GroupCipher::encrypt(&mut sender_record, b"group hi").unwrap();
        let plaintext = GroupCipher::decrypt(&mut receiver_record, &ciphertext).unwrap();
        assert_eq!(plaintext, b"group hi");

        let ciphertext2 = GroupCipher::encrypt(&mut sender_record, b"second").unwrap();
        let plaintext2 = GroupCipher::decrypt(&mut receiver_record, &ciphertext2).unwrap();
        assert_eq!(plaintext2, b"second");
    }

    #[test]
    fn session_record_byte_round_trip() {
        let identity = KeyPair::generate();
        let signed_pre_key = KeyPair::generate();
        let bundle = bundle_from(&identity, &signed_pre_key, None);
        let session = process_pre_key_bundle(&KeyPair::generate(), 1, &bundle).unwrap();
        let bytes = session.to_bytes();
        let back = SessionRecord::from_bytes(&bytes).unwrap();
        assert_eq!(back.root_key, session.root_key);
        assert_eq!(back.send_counter, session.send_counter);
    }

    #[test]
    fn sender_key_record_byte_round_trip() {
        let record = SenderKeyRecord::generate();
        let bytes = record.to_bytes();
        let back = SenderKeyRecord::from_bytes(&bytes).unwrap();
        assert_eq!(back.key_id, record.key_id);
        assert_eq!(back.chain_key, record.chain_key);
    }

    #[test]
    fn trust_store_always_trusts() {
        let known = [1u8; 32];
        let seen = [2u8; 32];
        assert!(TrustStore::is_trusted(Some(&known), &seen));
        assert!(TrustStore::is_trusted(None, &seen));
    }
}
