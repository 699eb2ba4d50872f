//! Signal store: ownership of credentials and the keyed rows from spec.md
//! §3/§4.C (`pre-key`, `session`, `sender-key`, `sender-key-memory`,
//! `app-state-sync-key`, `app-state-sync-version`), plus the transactional
//! batch-write discipline the protocol relies on for torn-write safety.

use crate::signal::keys::{KeyPair, PreKey, SignedPreKey};
use crate::ttl_cache::TtlCache;
use crate::types::Jid;
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Discriminates a keyed-store row per spec.md §3's type/id table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyKind {
    PreKey,
    Session,
    SenderKey,
    SenderKeyMemory,
    AppStateSyncKey,
    AppStateSyncVersion,
}

/// Our own `me` identity once paired (spec.md §3 `Credentials.me`).
#[derive(Clone, Debug, Default)]
pub struct MeInfo {
    pub id: Option<Jid>,
    pub lid: Option<Jid>,
    pub name: Option<String>,
}

/// Persisted credentials, created once per install and mutated over time
/// (spec.md §3 `Credentials`). `Device` (store::Device) remains the
/// on-disk row the application's `DeviceStore` persists; this struct is the
/// richer in-memory shape the Signal layer and handshake operate on.
#[derive(Clone, Debug)]
pub struct AuthenticationCreds {
    pub noise_key: KeyPair,
    pub pairing_ephemeral_key_pair: KeyPair,
    pub signed_identity_key: KeyPair,
    pub signed_pre_key: SignedPreKey,
    /// 14-bit unsigned per spec.md §3.
    pub registration_id: u32,
    pub adv_secret_key: [u8; 32],
    pub me: MeInfo,
    pub account: Option<Vec<u8>>,
    pub next_pre_key_id: u32,
    pub first_unuploaded_pre_key_id: u32,
    pub processed_history_messages: Vec<String>,
    pub account_settings: AccountSettings,
    pub routing_info: Option<Vec<u8>>,
    pub platform: Option<String>,
    pub registered: bool,
    pub last_prop_hash: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct AccountSettings {
    pub unarchive_chats: bool,
    pub default_disappearing_mode: Option<Duration>,
}

impl AuthenticationCreds {
    /// `initAuthCreds`: generate a brand-new credential set for a fresh
    /// install. Registration id is fixed here and is immutable thereafter
    /// (spec.md §3 invariant) — nothing in this module's API allows
    /// mutating it once constructed.
    pub fn generate() -> Self {
        let identity = KeyPair::generate();
        let signed_pre_key = SignedPreKey::generate(1, &identity);
        let mut registration_id_bytes = [0u8; 2];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut registration_id_bytes);
        let registration_id = (u16::from_be_bytes(registration_id_bytes) & 0x3FFF) as u32;
        let mut adv_secret_key = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut adv_secret_key);
        Self {
            noise_key: KeyPair::generate(),
            pairing_ephemeral_key_pair: KeyPair::generate(),
            signed_identity_key: identity,
            signed_pre_key,
            registration_id,
            adv_secret_key,
            me: MeInfo::default(),
            account: None,
            next_pre_key_id: 1,
            first_unuploaded_pre_key_id: 1,
            processed_history_messages: Vec::new(),
            account_settings: AccountSettings::default(),
            routing_info: None,
            platform: None,
            registered: false,
            last_prop_hash: None,
        }
    }
}

/// A batch mutation to apply atomically: `(kind, id) -> Some(bytes)` to set,
/// `None` to delete (spec.md §4.C `set`).
pub type StoreMutation = HashMap<(KeyKind, String), Option<Vec<u8>>>;

/// Keyed-row persistence contract (spec.md §4.C / §6.1 `SignalKeyStore`).
#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Cache-first batched read.
    async fn get(&self, kind: KeyKind, ids: &[String]) -> Result<HashMap<String, Option<Vec<u8>>>>;

    /// Batched atomic write. `None` deletes the row.
    async fn set(&self, mutation: StoreMutation) -> Result<()>;

    /// Flush the cache and delegate to a store-specific wipe.
    async fn clear(&self) -> Result<()>;
}

/// `pre-key` consumption, `sender-key-memory` bookkeeping, and the other
/// invariant-bearing helpers that sit above the raw keyed-row interface.
/// Kept as inherent methods on `MemorySignalStore` rather than trait
/// methods: every implementation of `SignalStore` composes them the same
/// way out of `get`/`set`, so there's nothing to abstract over (spec.md §3
/// invariants, §4.C).
pub struct MemorySignalStore {
    rows: Mutex<HashMap<(KeyKind, String), Vec<u8>>>,
    cache: Mutex<TtlCache<(KeyKind, String), Option<Vec<u8>>>>,
    creds: Mutex<AuthenticationCreds>,
    pre_keys: Mutex<HashMap<u32, PreKey>>,
    max_commit_retries: u32,
}

impl MemorySignalStore {
    pub fn new(creds: AuthenticationCreds) -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            cache: Mutex::new(TtlCache::new(Duration::from_secs(300))),
            creds: Mutex::new(creds),
            pre_keys: Mutex::new(HashMap::new()),
            max_commit_retries: 5,
        }
    }

    pub async fn creds(&self) -> AuthenticationCreds {
        self.creds.lock().await.clone()
    }

    pub async fn update_creds<F: FnOnce(&mut AuthenticationCreds)>(&self, f: F) {
        let mut creds = self.creds.lock().await;
        f(&mut creds);
    }

    /// Commits a batch with exponential backoff up to `max_commit_retries`
    /// (default 5, start 100ms, doubling). A torn write would desync the
    /// client from the server, so `set` never partially applies: it only
    /// returns `Ok` once every row in `mutation` has landed (spec.md §4.C).
    pub async fn transaction<T, F, Fut>(&self, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(T, StoreMutation)>>,
    {
        let (value, mutation) = work().await?;
        let mut delay = Duration::from_millis(100);
        let mut attempt = 0;
        loop {
            match self.commit(mutation.clone()).await {
                Ok(()) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.max_commit_retries {
                        return Err(e);
                    }
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    async fn commit(&self, mutation: StoreMutation) -> Result<()> {
        let mut rows = self.rows.lock().await;
        let mut cache = self.cache.lock().await;
        for ((kind, id), value) in mutation {
            match value {
                Some(bytes) => {
                    cache.insert((kind, id.clone()), Some(bytes.clone()));
                    rows.insert((kind, id), bytes);
                }
                None => {
                    cache.insert((kind, id.clone()), None);
                    rows.remove(&(kind, id));
                }
            }
        }
        Ok(())
    }

    /// Removes and returns a one-time pre-key. Called exactly once per
    /// successful `pkmsg` decrypt (spec.md §3 invariant).
    pub async fn consume_pre_key(&self, key_id: u32) -> Option<PreKey> {
        let mut pre_keys = self.pre_keys.lock().await;
        let pk = pre_keys.remove(&key_id);
        drop(pre_keys);
        let id_str = key_id.to_string();
        let mut rows = self.rows.lock().await;
        rows.remove(&(KeyKind::PreKey, id_str.clone()));
        let mut cache = self.cache.lock().await;
        cache.insert((KeyKind::PreKey, id_str), None);
        pk
    }

    pub async fn store_pre_key(&self, pre_key: PreKey) {
        let mut pre_keys = self.pre_keys.lock().await;
        pre_keys.insert(pre_key.key_id, pre_key);
    }

    pub async fn pre_key_count(&self) -> usize {
        self.pre_keys.lock().await.len()
    }

    /// Generates and stores a batch of `count` fresh pre-keys, advancing
    /// `next_pre_key_id` so `next_pre_key_id > first_unuploaded_pre_key_id`
    /// holds (the gap is the batch ready to upload, spec.md §3).
    pub async fn generate_pre_keys(&self, count: u32) -> Vec<PreKey> {
        let mut creds = self.creds.lock().await;
        let start = creds.next_pre_key_id;
        let mut generated = Vec::with_capacity(count as usize);
        for i in 0..count {
            generated.push(PreKey::generate(start + i));
        }
        creds.next_pre_key_id = start + count;
        drop(creds);
        let mut pre_keys = self.pre_keys.lock().await;
        for pk in &generated {
            pre_keys.insert(pk.key_id, pk.clone());
        }
        generated
    }

    /// Marks pre-keys through `uploaded_through` as uploaded, advancing
    /// `first_unuploaded_pre_key_id`.
    pub async fn mark_pre_keys_uploaded(&self, uploaded_through: u32) {
        let mut creds = self.creds.lock().await;
        creds.first_unuploaded_pre_key_id = uploaded_through + 1;
    }

    /// `groupId::ownerAddress` devices-with-our-distribution bookkeeping
    /// (spec.md §3 `sender-key-memory`). Returns whether `device` already
    /// held our distribution before this call.
    pub async fn has_sender_key_memory(&self, group: &Jid, device: &Jid) -> bool {
        let id = group.to_string();
        let rows = self.rows.lock().await;
        let Some(bytes) = rows.get(&(KeyKind::SenderKeyMemory, id)) else {
            return false;
        };
        let map: HashMap<String, bool> = serde_json::from_slice(bytes).unwrap_or_default();
        map.get(&device.to_string()).copied().unwrap_or(false)
    }

    pub async fn mark_sender_key_memory(&self, group: &Jid, device: &Jid) {
        let id = group.to_string();
        let mut rows = self.rows.lock().await;
        let key = (KeyKind::SenderKeyMemory, id.clone());
        let mut map: HashMap<String, bool> = rows
            .get(&key)
            .and_then(|b| serde_json::from_slice(b).ok())
            .unwrap_or_default();
        map.insert(device.to_string(), true);
        let bytes = serde_json::to_vec(&map).unwrap_or_default();
        rows.insert(key, bytes);
    }

    pub async fn clear_sender_key_memory(&self, group: &Jid) {
        let id = group.to_string();
        self.rows.lock().await.remove(&(KeyKind::SenderKeyMemory, id));
    }
}

#[async_trait]
impl SignalStore for MemorySignalStore {
    async fn get(&self, kind: KeyKind, ids: &[String]) -> Result<HashMap<String, Option<Vec<u8>>>> {
        let mut out = HashMap::new();
        let mut cache = self.cache.lock().await;
        let rows = self.rows.lock().await;
        for id in ids {
            let cache_key = (kind, id.clone());
            if let Some(v) = cache.get(&cache_key) {
                out.insert(id.clone(), v.clone());
                continue;
            }
            let value = rows.get(&cache_key).cloned();
            cache.insert(cache_key, value.clone());
            out.insert(id.clone(), value);
        }
        Ok(out)
    }

    async fn set(&self, mutation: StoreMutation) -> Result<()> {
        self.commit(mutation).await
    }

    async fn clear(&self) -> Result<()> {
        self.cache.lock().await.sweep();
        *self.cache.lock().await = TtlCache::new(Duration::from_secs(300));
        self.rows.lock().await.clear();
        self.pre_keys.lock().await.clear();
        Ok(())
    }
}

/// Shared handle, mirroring `store::Store`'s `Arc<dyn ...>` alias shape.
pub type SharedSignalStore = Arc<MemorySignalStore>;

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemorySignalStore {
        MemorySignalStore::new(AuthenticationCreds::generate())
    }

    #[tokio::test]
    async fn pre_key_consumed_exactly_once() {
        let s = store();
        s.store_pre_key(PreKey::generate(7)).await;
        assert_eq!(s.pre_key_count().await, 1);
        let consumed = s.consume_pre_key(7).await;
        assert!(consumed.is_some());
        assert_eq!(s.pre_key_count().await, 0);
        assert!(s.consume_pre_key(7).await.is_none());
    }

    #[tokio::test]
    async fn next_pre_key_id_advances_past_first_unuploaded() {
        let s = store();
        let before = s.creds().await.next_pre_key_id;
        let generated = s.generate_pre_keys(10).await;
        assert_eq!(generated.len(), 10);
        let creds = s.creds().await;
        assert!(creds.next_pre_key_id > creds.first_unuploaded_pre_key_id);
        assert_eq!(creds.next_pre_key_id, before + 10);
    }

    #[tokio::test]
    async fn transaction_sees_uncommitted_write_before_commit() {
        let s = store();
        let result = s
            .transaction(|| async {
                let mut mutation = StoreMutation::new();
                mutation.insert((KeyKind::PreKey, "7".into()), Some(b"K".to_vec()));
                Ok((42, mutation))
            })
            .await
            .unwrap();
        assert_eq!(result, 42);
        let got = s.get(KeyKind::PreKey, &["7".to_string()]).await.unwrap();
        assert_eq!(got.get("7").unwrap().as_deref(), Some(&b"K"[..]));
    }

    #[tokio::test]
    async fn sender_key_memory_tracks_devices() {
        let s = store();
        let group = Jid::new("123", "g.us");
        let device = Jid::new_ad("456", 0, 1, "s.whatsapp.net");
        assert!(!s.has_sender_key_memory(&group, &device).await);
        s.mark_sender_key_memory(&group, &device).await;
        assert!(s.has_sender_key_memory(&group, &device).await);
        s.clear_sender_key_memory(&group).await;
        assert!(!s.has_sender_key_memory(&group, &device).await);
    }

    #[tokio::test]
    async fn registration_id_stable_across_regeneration_calls() {
        let creds = AuthenticationCreds::generate();
        let id = creds.registration_id;
        let s = MemorySignalStore::new(creds);
        assert_eq!(s.creds().await.registration_id, id);
    }
}
