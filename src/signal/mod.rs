//! Signal-protocol-shaped session/group cryptography (spec.md §4.C, §4.D).
//!
//! `keys` holds identity/pre-key/signed-pre-key material, `store` owns the
//! keyed rows and transactional commit discipline, `cipher` wraps
//! encrypt/decrypt for both one-to-one sessions and group sender-keys.

pub mod cipher;
pub mod keys;
pub mod store;

pub use cipher::{GroupCipher, MessageKind, SenderKeyDistributionMessage, SenderKeyRecord, SessionCipher, SessionRecord, TrustStore};
pub use keys::{KeyPair, PreKey, PreKeyBundle, SignedPreKey};
pub use store::{AuthenticationCreds, KeyKind, MemorySignalStore, SignalStore, StoreMutation};
