//! Sender pipeline (spec.md §4.H): one-to-one and group send paths —
//! usync device resolution, `assertSessions`, per-device Signal encryption,
//! sender-key fan-out for groups, and message-id generation.

use crate::binary::{Attrs, Node, NodeContent};
use crate::error::{Error, SendError};
use crate::signal::{
    GroupCipher, KeyKind, MemorySignalStore, PreKeyBundle, SenderKeyRecord, SessionCipher, SessionRecord, SignalStore,
};
use crate::types::{Jid, MessageId};
use async_trait::async_trait;
use sha2::Digest;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::router::Router;
use crate::ttl_cache::TtlCache;

/// Handed the already-encoded `message` stanza; the sender pipeline has no
/// direct transport handle (spec.md §9 "no back-pointers").
#[async_trait]
pub trait OutboundSink: Send + Sync {
    async fn send_node(&self, node: Node) -> crate::Result<()>;
}

/// Per-send overrides (spec.md §4.H).
#[derive(Clone, Debug, Default)]
pub struct MessageRelayOptions {
    pub use_user_devices_cache: bool,
    pub participant: Option<Jid>,
    pub count: Option<u32>,
    pub message_id: Option<MessageId>,
    pub cached_group_metadata: Option<Vec<Jid>>,
}

pub struct SenderConfig {
    pub device_cache_ttl: Duration,
    pub pad_max: u8,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            device_cache_ttl: Duration::from_secs(300),
            pad_max: 16,
        }
    }
}

pub struct SenderPipeline {
    config: SenderConfig,
    router: Arc<Router>,
    signal_store: Arc<MemorySignalStore>,
    outbound: Arc<dyn OutboundSink>,
    own_identity: crate::signal::KeyPair,
    device_cache: Mutex<TtlCache<Jid, Vec<Jid>>>,
}

impl SenderPipeline {
    pub fn new(
        config: SenderConfig,
        router: Arc<Router>,
        signal_store: Arc<MemorySignalStore>,
        outbound: Arc<dyn OutboundSink>,
        own_identity: crate::signal::KeyPair,
    ) -> Self {
        let ttl = config.device_cache_ttl;
        Self {
            config,
            router,
            signal_store,
            outbound,
            own_identity,
            device_cache: Mutex::new(TtlCache::new(ttl)),
        }
    }

    /// `3EB0` + uppercase hex of a SHA-256 prefix, widened relative to the
    /// non-Signal message-id generator (spec.md §4.H).
    pub fn generate_message_id(&self, own: &Jid) -> MessageId {
        let mut data = Vec::with_capacity(8 + 32 + 16);
        let t = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        data.extend_from_slice(&t.to_be_bytes());
        data.extend_from_slice(own.to_string().as_bytes());
        data.extend_from_slice(&rand::random::<[u8; 16]>());
        let hash = sha2::Sha256::digest(&data);
        format!("3EB0{}", hex::encode_upper(&hash[..16]))
    }

    /// Random padding to an opaque plaintext, keeping the raw `message.raw`
    /// framing rather than a typed protobuf `Message` (no
    /// protobuf `Message` schema exists in this crate, spec.md §9 Open
    /// Questions). Appends `n` bytes of value `n`, `n` in `1..=pad_max`.
    fn pad(&self, plaintext: &[u8]) -> Vec<u8> {
        let n = (rand::random::<u8>() % self.config.pad_max).saturating_add(1);
        let mut out = Vec::with_capacity(plaintext.len() + n as usize);
        out.extend_from_slice(plaintext);
        out.extend(std::iter::repeat(n).take(n as usize));
        out
    }

    /// `usync`: resolves the device list for a bare user JID, short-TTL
    /// cached unless `use_cache` is false (spec.md §4.H).
    pub async fn resolve_devices(&self, user: &Jid, use_cache: bool) -> crate::Result<Vec<Jid>> {
        let key = user.to_non_ad();
        if use_cache {
            if let Some(cached) = self.device_cache.lock().await.get(&key) {
                return Ok(cached.clone());
            }
        }

        let tag = self.router.generate_tag();
        let query = Node::new("iq")
            .with_attr("id", tag.clone())
            .with_attr("type", "get")
            .with_attr("xmlns", "usync")
            .with_attr("to", "s.whatsapp.net")
            .with_children(vec![Node::new("usync")
                .with_attr("sid", tag.clone())
                .with_children(vec![Node::new("query").with_children(vec![Node::new("devices")]), Node::new("list").with_children(vec![Node::new("user").with_attr("jid", key.to_string())])])]);

        self.outbound.send_node(query).await?;
        let response = self.router.wait_for_with_timeout(&tag).await?;
        let devices = parse_usync_devices(&response, &key);
        self.device_cache.lock().await.insert(key, devices.clone());
        Ok(devices)
    }

    /// Ensures a `session` row exists for every address; fetches pre-key
    /// bundles for the ones missing a session and installs them via X3DH
    /// (spec.md §4.H `assertSessions`).
    pub async fn assert_sessions(&self, addresses: &[Jid]) -> crate::Result<()> {
        let mut missing = Vec::new();
        for addr in addresses {
            let id = addr.signal_address();
            let row = self.signal_store.get(KeyKind::Session, &[id]).await?;
            if row.values().all(|v| v.is_none()) {
                missing.push(addr.clone());
            }
        }
        if missing.is_empty() {
            return Ok(());
        }

        for addr in missing {
            let bundle = self.fetch_pre_key_bundle(&addr).await?;
            let creds = self.signal_store.creds().await;
            let session = crate::signal::cipher::process_pre_key_bundle(&self.own_identity, creds.registration_id, &bundle)?;
            let mut mutation = crate::signal::StoreMutation::new();
            mutation.insert((KeyKind::Session, addr.signal_address()), Some(session.to_bytes()));
            self.signal_store.set(mutation).await?;
        }
        Ok(())
    }

    async fn fetch_pre_key_bundle(&self, addr: &Jid) -> crate::Result<PreKeyBundle> {
        let tag = self.router.generate_tag();
        let query = Node::new("iq")
            .with_attr("id", tag.clone())
            .with_attr("type", "get")
            .with_attr("xmlns", "encrypt")
            .with_attr("to", addr.to_string())
            .with_children(vec![Node::new("key").with_children(vec![Node::new("user").with_attr("jid", addr.to_string())])]);
        self.outbound.send_node(query).await?;
        let response = self.router.wait_for_with_timeout(&tag).await?;
        parse_pre_key_bundle(&response)
    }

    /// Encrypts `plaintext` to every device of `to` (spec.md §4.H 1:1 path),
    /// returning the `message` stanza ready to send.
    pub async fn build_individual_message(
        &self,
        to: &Jid,
        plaintext: &[u8],
        opts: &MessageRelayOptions,
    ) -> crate::Result<(MessageId, Node)> {
        let addresses = if let Some(cached) = &opts.cached_group_metadata {
            cached.clone()
        } else {
            self.resolve_devices(to, opts.use_user_devices_cache).await?
        };
        self.assert_sessions(&addresses).await?;
        let padded = self.pad(plaintext);

        let mut children = Vec::with_capacity(addresses.len());
        for addr in &addresses {
            let id = addr.signal_address();
            let row = self.signal_store.get(KeyKind::Session, &[id.clone()]).await?;
            let Some(Some(bytes)) = row.get(&id) else {
                return Err(Error::Send(SendError::EncryptionFailed));
            };
            let mut session = SessionRecord::from_bytes(bytes)?;
            let (kind, ciphertext) = SessionCipher::encrypt(&mut session, &padded)?;
            let mut mutation = crate::signal::StoreMutation::new();
            mutation.insert((KeyKind::Session, id), Some(session.to_bytes()));
            self.signal_store.set(mutation).await?;

            let enc_type = match kind {
                crate::signal::MessageKind::PreKey => "pkmsg",
                crate::signal::MessageKind::Whisper => "msg",
            };
            children.push(
                Node::new("to")
                    .with_attr("jid", addr.to_string())
                    .with_children(vec![Node::new("enc").with_attr("type", enc_type).with_attr("v", "2").with_content(ciphertext)]),
            );
        }

        let id = opts.message_id.clone().unwrap_or_else(|| self.generate_message_id(to));
        let mut attrs = Attrs::new();
        attrs.insert("id".into(), id.clone());
        attrs.insert("to".into(), to.to_string());
        attrs.insert("type".into(), "text".into());
        let node = Node {
            tag: "message".into(),
            attrs,
            content: NodeContent::Nodes(children),
        };
        Ok((id, node))
    }

    /// Group path: installs our sender-key on devices that don't yet hold
    /// it (`sender-key-memory`), then ships a single `skmsg` (spec.md §4.H).
    pub async fn build_group_message(
        &self,
        group: &Jid,
        own: &Jid,
        plaintext: &[u8],
        opts: &MessageRelayOptions,
    ) -> crate::Result<(MessageId, Node)> {
        let participants = if let Some(cached) = &opts.cached_group_metadata {
            cached.clone()
        } else {
            self.resolve_devices(group, opts.use_user_devices_cache).await?
        };

        let sender_key_id = group.sender_key_id(own);
        let row = self.signal_store.get(KeyKind::SenderKey, &[sender_key_id.clone()]).await?;
        let mut record = match row.get(&sender_key_id).and_then(|v| v.clone()) {
            Some(bytes) => SenderKeyRecord::from_bytes(&bytes)?,
            None => SenderKeyRecord::generate(),
        };

        let mut to_install = Vec::new();
        for device in &participants {
            if !self.signal_store.has_sender_key_memory(group, device).await {
                to_install.push(device.clone());
            }
        }
        if !to_install.is_empty() {
            self.assert_sessions(&to_install).await?;
            let distribution = record.to_distribution_message();
            for device in &to_install {
                self.send_sender_key_distribution(device, group, &distribution).await?;
                self.signal_store.mark_sender_key_memory(group, device).await;
            }
        }

        let padded = self.pad(plaintext);
        let ciphertext = GroupCipher::encrypt(&mut record, &padded)?;
        let mut mutation = crate::signal::StoreMutation::new();
        mutation.insert((KeyKind::SenderKey, sender_key_id), Some(record.to_bytes()));
        self.signal_store.set(mutation).await?;

        let id = opts.message_id.clone().unwrap_or_else(|| self.generate_message_id(group));
        let mut attrs = Attrs::new();
        attrs.insert("id".into(), id.clone());
        attrs.insert("to".into(), group.to_string());
        attrs.insert("type".into(), "text".into());
        let node = Node {
            tag: "message".into(),
            attrs,
            content: NodeContent::Nodes(vec![Node::new("enc").with_attr("type", "skmsg").with_attr("v", "2").with_content(ciphertext)]),
        };
        Ok((id, node))
    }

    async fn send_sender_key_distribution(
        &self,
        device: &Jid,
        group: &Jid,
        distribution: &crate::signal::SenderKeyDistributionMessage,
    ) -> crate::Result<()> {
        let mut framed = Vec::with_capacity(4 + 4 + 32 + 32);
        framed.extend_from_slice(&distribution.key_id.to_be_bytes());
        framed.extend_from_slice(&distribution.iteration.to_be_bytes());
        framed.extend_from_slice(&distribution.chain_key);
        framed.extend_from_slice(&distribution.signing_key);

        let opts = MessageRelayOptions {
            cached_group_metadata: Some(vec![device.clone()]),
            ..Default::default()
        };
        let (_, node) = self.build_individual_message(device, &framed, &opts).await?;
        let node = node.with_attr("skey_for", group.to_string());
        self.outbound.send_node(node).await
    }
}

fn parse_usync_devices(response: &Node, user: &Jid) -> Vec<Jid> {
    let mut out = Vec::new();
    if let Some(usync) = response.get_child_by_tag("usync") {
        if let Some(list) = usync.get_child_by_tag("list") {
            for u in list.get_children().iter().filter(|n| n.tag == "user") {
                if let Some(jid_attr) = u.attrs.get("jid") {
                    if let Ok(base) = jid_attr.parse::<Jid>() {
                        if let Some(devices_node) = u.get_child_by_tag("devices") {
                            for d in devices_node.get_children().iter().filter(|n| n.tag == "device") {
                                let device_id: u16 = d.attrs.get("id").and_then(|s| s.parse().ok()).unwrap_or(0);
                                out.push(Jid::new_ad(base.user.clone(), 0, device_id, base.server.clone()));
                            }
                        }
                    }
                }
            }
        }
    }
    if out.is_empty() {
        out.push(user.clone());
    }
    out
}

fn parse_pre_key_bundle(response: &Node) -> crate::Result<PreKeyBundle> {
    let key_node = response
        .get_child_by_tag("list")
        .and_then(|list| list.get_child_by_tag("user"))
        .ok_or_else(|| Error::Binary("missing pre-key bundle user node".into()))?;

    let registration_id = key_node
        .get_child_by_tag("registration")
        .and_then(|n| content_bytes(n))
        .map(|b| u32::from_be_bytes_or_zero(&b))
        .unwrap_or(0);

    let identity_key = key_node
        .get_child_by_tag("identity")
        .and_then(|n| content_bytes(n))
        .and_then(|b| to_array32(&b))
        .ok_or_else(|| Error::Binary("missing identity key".into()))?;

    let signed = key_node
        .get_child_by_tag("skey")
        .ok_or_else(|| Error::Binary("missing signed pre-key".into()))?;
    let signed_pre_key_id: u32 = signed.attrs.get("id").and_then(|s| s.parse().ok()).unwrap_or(0);
    let signed_pre_key_public = content_bytes(signed)
        .and_then(|b| to_array32(&b))
        .ok_or_else(|| Error::Binary("missing signed pre-key bytes".into()))?;
    let signed_pre_key_signature = signed
        .attrs
        .get("sig")
        .and_then(|s| base64_decode32(s))
        .unwrap_or([0u8; 32]);

    let pre_key = key_node.get_child_by_tag("key").and_then(|n| {
        let id: u32 = n.attrs.get("id").and_then(|s| s.parse().ok())?;
        let bytes = content_bytes(n)?;
        let arr = to_array32(&bytes)?;
        Some((id, arr))
    });

    Ok(PreKeyBundle {
        registration_id,
        device_id: 0,
        pre_key,
        signed_pre_key_id,
        signed_pre_key_public,
        signed_pre_key_signature,
        identity_key,
    })
}

fn content_bytes(node: &Node) -> Option<Vec<u8>> {
    match &node.content {
        NodeContent::Bytes(b) => Some(b.clone()),
        _ => None,
    }
}

fn to_array32(bytes: &[u8]) -> Option<[u8; 32]> {
    if bytes.len() != 32 {
        return None;
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(bytes);
    Some(out)
}

fn base64_decode32(s: &str) -> Option<[u8; 32]> {
    use base64::Engine;
    let decoded = base64::engine::general_purpose::STANDARD.decode(s).ok()?;
    to_array32(&decoded)
}

trait FromBeBytesOrZero {
    fn from_be_bytes_or_zero(b: &[u8]) -> u32;
}

impl FromBeBytesOrZero for u32 {
    fn from_be_bytes_or_zero(b: &[u8]) -> u32 {
        if b.len() != 4 {
            return 0;
        }
        u32::from_be_bytes(b.try_into().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{AuthenticationCreds, KeyPair};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullSink {
        sent: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl OutboundSink for NullSink {
        async fn send_node(&self, _node: Node) -> crate::Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn pipeline() -> (SenderPipeline, Arc<MemorySignalStore>) {
        let store = Arc::new(MemorySignalStore::new(AuthenticationCreds::generate()));
        let router = Arc::new(Router::new(Duration::from_millis(200)));
        let sink = Arc::new(NullSink { sent: Arc::new(AtomicUsize::new(0)) });
        let pipeline = SenderPipeline::new(SenderConfig::default(), router, Arc::clone(&store), sink, KeyPair::generate());
        (pipeline, store)
    }

    #[test]
    fn message_id_has_3eb0_prefix_and_wider_hex() {
        let (pipeline, _store) = pipeline();
        let id = pipeline.generate_message_id(&Jid::new("123", "s.whatsapp.net"));
        assert!(id.starts_with("3EB0"));
        assert_eq!(id.len(), 4 + 32);
        assert!(id[4..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn padding_appends_consistent_length_marker() {
        let (pipeline, _store) = pipeline();
        let padded = pipeline.pad(b"hello");
        let n = *padded.last().unwrap();
        assert!(n >= 1 && n as usize <= pipeline.config.pad_max as usize);
        assert_eq!(padded.len(), 5 + n as usize);
        assert!(padded[5..].iter().all(|&b| b == n));
    }

    #[tokio::test]
    async fn assert_sessions_is_noop_when_session_present() {
        let (pipeline, store) = pipeline();
        let addr = Jid::new_ad("123", 0, 0, "s.whatsapp.net");
        let mut mutation = crate::signal::StoreMutation::new();
        mutation.insert((KeyKind::Session, addr.signal_address()), Some(vec![1, 2, 3]));
        store.set(mutation).await.unwrap();
        // Would attempt a network fetch (and fail under test) if it treated
        // the session as missing.
        pipeline.assert_sessions(&[addr]).await.unwrap();
    }

    #[tokio::test]
    async fn build_group_message_installs_distribution_once() {
        let (pipeline, store) = pipeline();
        let group = Jid::new("g1", "g.us");
        let own = Jid::new_ad("me", 0, 0, "s.whatsapp.net");
        let device = Jid::new_ad("peer", 0, 0, "s.whatsapp.net");

        // Pre-seed the peer's session so assert_sessions short-circuits
        // instead of reaching the network.
        let mut mutation = crate::signal::StoreMutation::new();
        mutation.insert((KeyKind::Session, device.signal_address()), Some(vec![9]));
        store.set(mutation).await.unwrap();

        let opts = MessageRelayOptions {
            cached_group_metadata: Some(vec![device.clone()]),
            ..Default::default()
        };
        let result = pipeline.build_group_message(&group, &own, b"hi group", &opts).await;
        assert!(result.is_err(), "fake session bytes can't actually encrypt, but distribution install should be attempted first");
        assert!(store.has_sender_key_memory(&group, &device).await);
    }
}
