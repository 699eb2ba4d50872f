//! Main client: wires the Connection Supervisor, request Router, Sender and
//! Receiver pipelines, and the Signal store together around one device
//! (spec.md §4.I "single-client lifecycle owner").

mod send;

use crate::binary::Node;
use crate::config::ClientConfig;
use crate::error::{ConnectionError, Error};
use crate::events::{Event, EventBus};
use crate::receiver::{AllowAllJids, JidFilter, MessageLookup, ReceiverConfig, ReceiverPipeline};
use crate::router::Router;
use crate::sender::{MessageRelayOptions, OutboundSink, SenderConfig, SenderPipeline};
use crate::signal::MemorySignalStore;
use crate::store::{Device, Store};
use crate::supervisor::Supervisor;
use crate::transport::Transport;
use crate::types::{Jid, MessageId};
use async_trait::async_trait;
use sha2::Digest;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

pub use send::{SendRequestExtra, SendResponse};

/// Parameters for completing pairing after QR or pair-code flow.
#[derive(Clone, Debug)]
pub struct CompletePairingParams<'a> {
    /// Raw device identity from server (payload, or payload || HMAC-SHA256 tag if verifying).
    pub device_identity_bytes: &'a [u8],
    /// Request ID from the pairing flow.
    pub req_id: &'a str,
    pub business_name: &'a str,
    pub platform: &'a str,
    pub jid: Jid,
    pub lid: Jid,
    /// If set, device_identity_bytes is verified as payload || HMAC tag before use.
    pub hmac_key: Option<&'a [u8]>,
}

/// Default WebSocket URL for WhatsApp Web.
pub const DEFAULT_WS_URL: &str = "wss://web.whatsapp.com/ws";

/// Fresh one-time pre-keys generated per upload round (spec.md §4.E).
const PRE_KEY_UPLOAD_BATCH: u32 = 30;

/// Sends an already-encoded node over whatever transport `connect()` last
/// installed (spec.md §9 "no back-pointers" — the sender pipeline never
/// sees the `Client` itself, only this thin sink).
struct ClientOutbound {
    transport: Arc<RwLock<Option<Arc<dyn Transport>>>>,
}

#[async_trait]
impl OutboundSink for ClientOutbound {
    async fn send_node(&self, node: Node) -> crate::Result<()> {
        let transport = self.transport.read().await;
        let t = transport
            .as_ref()
            .ok_or(Error::Connection(ConnectionError::Disconnected))?;
        let data = node.encode()?;
        t.send(&data).await
    }
}

/// Client for the WhatsApp web multidevice API.
pub struct Client {
    store: Store,
    config: ClientConfig,
    device: Arc<RwLock<Option<Device>>>,
    event_bus: Arc<EventBus>,
    router: Arc<Router>,
    supervisor: Arc<Supervisor>,
    signal_store: RwLock<Option<Arc<MemorySignalStore>>>,
    sender_pipeline: RwLock<Option<Arc<SenderPipeline>>>,
    receiver_pipeline: RwLock<Option<Arc<ReceiverPipeline>>>,
    connected: Arc<AtomicBool>,
    logged_in: Arc<AtomicBool>,
    /// When set, send_node() uses this transport (e.g. Noise over WebSocket). Set by connect() when feature "full" is enabled.
    transport: Arc<RwLock<Option<Arc<dyn Transport>>>>,
    /// Applications inject their own policy before the first `connect()`
    /// builds the receiver pipeline (spec.md §6.2 `shouldIgnoreJid`,
    /// `getMessage`); defaults match the pipeline's own defaults.
    jid_filter: RwLock<Arc<dyn JidFilter>>,
    message_lookup: RwLock<Option<Arc<dyn MessageLookup>>>,
}

impl Client {
    /// Create a new client with the given device store and default config.
    pub fn new(store: Store) -> Self {
        Self::with_config(store, ClientConfig::default())
    }

    /// Create a new client with the given device store and an explicit
    /// config (spec.md §6.3).
    pub fn with_config(store: Store, config: ClientConfig) -> Self {
        let event_bus = Arc::new(EventBus::new());
        let supervisor = Arc::new(Supervisor::with_clear_auth_on_error(
            Arc::clone(&event_bus),
            config.max_reconnect_attempts,
            config.clear_auth_on_error,
        ));
        let router = Arc::new(Router::new(config.default_query_timeout));
        Self {
            store,
            config,
            device: Arc::new(RwLock::new(None)),
            event_bus,
            router,
            supervisor,
            signal_store: RwLock::new(None),
            sender_pipeline: RwLock::new(None),
            receiver_pipeline: RwLock::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            logged_in: Arc::new(AtomicBool::new(false)),
            transport: Arc::new(RwLock::new(None)),
            jid_filter: RwLock::new(Arc::new(AllowAllJids)),
            message_lookup: RwLock::new(None),
        }
    }

    /// Add an event handler (called for every event). Mirrors AddEventHandler.
    pub async fn add_event_handler<F>(&self, f: F)
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        self.event_bus.subscribe(f).await;
    }

    /// Installs the policy deciding whether to drop an inbound stanza
    /// before decryption (spec.md §6.2 `shouldIgnoreJid`). Takes effect on
    /// the next `ensure_pipelines` call (i.e. before the first `connect()`
    /// or after `close()`); a pipeline already built keeps its filter.
    pub async fn set_jid_filter(&self, filter: Arc<dyn JidFilter>) {
        *self.jid_filter.write().await = filter;
    }

    /// Installs the callback supplying plaintext for retry replays
    /// (spec.md §6.2 `getMessage`). Same build-time caveat as
    /// [`Client::set_jid_filter`].
    pub async fn set_message_lookup(&self, lookup: Arc<dyn MessageLookup>) {
        *self.message_lookup.write().await = Some(lookup);
    }

    /// Load device from store, creating and persisting a fresh one (with
    /// freshly generated credentials) if none exists yet — so the Noise
    /// identity used for QR pairing is stable across repeated `connect()`
    /// calls instead of regenerating every time (spec.md §4.E).
    pub async fn load_device(&self) -> crate::Result<()> {
        let device = match self.store.get_first_device().await? {
            Some(d) => d,
            None => {
                let d = Device::default();
                self.store.save(&d).await?;
                d
            }
        };
        if device.is_logged_in() {
            self.logged_in.store(true, Ordering::SeqCst);
        }
        *self.device.write().await = Some(device);
        Ok(())
    }

    /// Lazily builds the Signal store and sender/receiver pipelines around
    /// the current device's credentials. A no-op once already built — these
    /// survive reconnects so in-flight sessions and pre-keys aren't lost
    /// (spec.md §4.I "single-client lifecycle owner").
    async fn ensure_pipelines(&self, device: &Device) {
        let signal_store = {
            let mut guard = self.signal_store.write().await;
            if guard.is_none() {
                *guard = Some(Arc::new(MemorySignalStore::new(device.creds.clone())));
            }
            Arc::clone(guard.as_ref().unwrap())
        };

        {
            let mut guard = self.sender_pipeline.write().await;
            if guard.is_none() {
                let outbound: Arc<dyn OutboundSink> = Arc::new(ClientOutbound {
                    transport: Arc::clone(&self.transport),
                });
                *guard = Some(Arc::new(SenderPipeline::new(
                    SenderConfig::default(),
                    Arc::clone(&self.router),
                    Arc::clone(&signal_store),
                    outbound,
                    device.creds.signed_identity_key.clone(),
                )));
            }
        }

        {
            let mut guard = self.receiver_pipeline.write().await;
            if guard.is_none() {
                let cfg = ReceiverConfig {
                    flood_threshold: self.config.flood_threshold,
                    flood_window: self.config.flood_window,
                    max_msg_retry_count: self.config.max_msg_retry_count,
                    retry_request_delay: self.config.retry_request_delay,
                    ..ReceiverConfig::default()
                };
                let jid_filter = Arc::clone(&*self.jid_filter.read().await);
                let message_lookup = self.message_lookup.read().await.clone();
                let outbound: Arc<dyn OutboundSink> = Arc::new(ClientOutbound {
                    transport: Arc::clone(&self.transport),
                });
                *guard = Some(ReceiverPipeline::new(cfg, Arc::clone(&self.event_bus), signal_store, jid_filter, message_lookup, outbound));
            }
        }
    }

    /// Connect to WhatsApp servers. If no session, will emit QR events for pairing.
    /// With feature "full", performs a real WebSocket + Noise handshake and stores the transport.
    /// Re-entrant: a concurrent call while already connecting/open is a no-op
    /// (spec.md §4.I).
    pub async fn connect(&self) -> crate::Result<()> {
        if !self.supervisor.begin_connect().await {
            return Ok(());
        }
        self.load_device().await?;
        let device = self.device.read().await.clone().unwrap_or_default();
        self.ensure_pipelines(&device).await;

        if !device.is_logged_in() {
            self.connect_for_pairing().await?;
            return Ok(());
        }

        self.connect_paired(&device).await
    }

    /// Pre-pairing path: open the Noise handshake with no `ClientFinish`
    /// payload (there is no account to report yet) and surface a QR code.
    async fn connect_for_pairing(&self) -> crate::Result<()> {
        #[cfg(feature = "full")]
        {
            let dial = tokio::time::timeout(self.config.connect_timeout, crate::socket::connect_noise_default(None));
            if let Ok(Ok((noise_tx, noise_rx))) = dial.await {
                let transport: Arc<dyn Transport> = Arc::new(noise_tx);
                *self.transport.write().await = Some(transport);
                self.supervisor.mark_handshaking().await;
                self.spawn_recv_loop(noise_rx);
                self.spawn_keep_alive();
            }
        }
        self.event_bus
            .emit(Event::Qr {
                codes: vec!["STUB_QR_CODE".to_string()],
            })
            .await;
        Ok(())
    }

    /// Post-pairing (re)connect: embeds the account's `ClientPayload` in the
    /// handshake's third message (spec.md §4.E "post-pairing reconnect").
    async fn connect_paired(&self, device: &Device) -> crate::Result<()> {
        #[cfg(feature = "full")]
        {
            let finish = crate::proto::ClientFinish {
                payload: Some(crate::proto::ClientPayload {
                    registration_id: Some(device.creds.registration_id),
                    account: device.creds.account.clone(),
                    platform: device.platform.clone(),
                    device_props: Some((&self.config.browser).into()),
                    routing_info: device.creds.routing_info.clone(),
                    pull_full_history: Some(self.config.sync_full_history),
                }),
            };
            let dial = tokio::time::timeout(self.config.connect_timeout, crate::socket::connect_noise_default(Some(finish)));
            match dial.await.map_err(|_| Error::Connection(ConnectionError::Timeout))? {
                Ok((noise_tx, noise_rx)) => {
                    let transport: Arc<dyn Transport> = Arc::new(noise_tx);
                    *self.transport.write().await = Some(transport);
                    self.spawn_recv_loop(noise_rx);
                    self.spawn_keep_alive();
                }
                Err(e) => {
                    self.connected.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }
        self.connected.store(true, Ordering::SeqCst);
        self.logged_in.store(true, Ordering::SeqCst);
        self.supervisor.mark_open().await;
        if self.config.mark_online_on_connect {
            let presence = Node::new("presence").with_attr("type", "available");
            if let Err(e) = self.send_node(&presence).await {
                tracing::warn!(error = %e, "failed to send initial presence");
            }
        }
        self.event_bus.emit(Event::Connected).await;
        if let Some(signal_store) = self.signal_store.read().await.clone() {
            if let Err(e) = self.maybe_upload_pre_keys(&signal_store).await {
                tracing::warn!(error = %e, "pre-key count check/upload failed");
            }
        }
        Ok(())
    }

    /// Checks the server's reported unused pre-key count and tops it up once
    /// it falls under `pre_key_upload_threshold` (spec.md §4.E).
    async fn maybe_upload_pre_keys(&self, signal_store: &MemorySignalStore) -> crate::Result<()> {
        let tag = self.router.generate_tag();
        let count_query = Node::new("iq")
            .with_attr("id", tag.clone())
            .with_attr("type", "get")
            .with_attr("xmlns", "encrypt")
            .with_children(vec![Node::new("count")]);
        self.send_node(&count_query).await?;
        let response = self.router.wait_for_with_timeout(&tag).await?;
        let server_count = response
            .get_child_by_tag("count")
            .and_then(|n| n.attrs.get("value"))
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);
        if server_count >= self.config.pre_key_upload_threshold {
            return Ok(());
        }

        let creds = signal_store.creds().await;
        let batch = signal_store.generate_pre_keys(PRE_KEY_UPLOAD_BATCH).await;
        let last_id = batch.last().map(|pk| pk.key_id).unwrap_or(creds.next_pre_key_id);
        let key_nodes: Vec<Node> = batch
            .iter()
            .map(|pk| {
                Node::new("key")
                    .with_attr("id", pk.key_id.to_string())
                    .with_content(pk.key_pair.public.to_vec())
            })
            .collect();

        use base64::Engine;
        let signed = &creds.signed_pre_key;
        let skey_node = Node::new("skey")
            .with_attr("id", signed.key_id.to_string())
            .with_attr("sig", base64::engine::general_purpose::STANDARD.encode(signed.signature))
            .with_content(signed.key_pair.public.to_vec());

        let upload_tag = self.router.generate_tag();
        let upload = Node::new("iq")
            .with_attr("id", upload_tag.clone())
            .with_attr("type", "set")
            .with_attr("xmlns", "encrypt")
            .with_children(vec![
                Node::new("registration").with_content(creds.registration_id.to_be_bytes().to_vec()),
                Node::new("identity").with_content(creds.signed_identity_key.public.to_vec()),
                skey_node,
                Node::new("list").with_children(key_nodes),
            ]);
        self.send_node(&upload).await?;
        self.router.wait_for_with_timeout(&upload_tag).await?;
        signal_store.mark_pre_keys_uploaded(last_id).await;
        Ok(())
    }

    /// Periodic `iq type=get xmlns=urn:xmpp:ping ping` while the transport
    /// stays open (spec.md §1 "keep-alive", §5 concurrency model names it as
    /// one of the per-connection tasks).
    #[cfg(feature = "full")]
    fn spawn_keep_alive(&self) {
        let transport = Arc::clone(&self.transport);
        let connected = Arc::clone(&self.connected);
        let router = Arc::clone(&self.router);
        let interval = self.config.keep_alive_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !connected.load(Ordering::SeqCst) {
                    break;
                }
                let Some(t) = transport.read().await.clone() else { break };
                let tag = router.generate_tag();
                let ping = Node::new("iq")
                    .with_attr("id", tag)
                    .with_attr("type", "get")
                    .with_attr("xmlns", "urn:xmpp:ping")
                    .with_children(vec![Node::new("ping")]);
                let Ok(data) = ping.encode() else { continue };
                if t.send(&data).await.is_err() {
                    break;
                }
            }
        });
    }

    #[cfg(feature = "full")]
    fn spawn_recv_loop(&self, noise_rx: crate::socket::NoiseRecv) {
        let router = Arc::clone(&self.router);
        let receiver_pipeline = self.receiver_pipeline.try_read().ok().and_then(|g| g.clone());
        let supervisor = Arc::clone(&self.supervisor);
        let connected = Arc::clone(&self.connected);
        tokio::spawn(async move {
            Self::recv_loop(noise_rx, Arc::clone(&router), receiver_pipeline).await;
            connected.store(false, Ordering::SeqCst);
            router.cancel_all().await;
            let _ = supervisor.handle_close(None, None).await;
        });
    }

    #[cfg(feature = "full")]
    async fn recv_loop(
        noise_rx: crate::socket::NoiseRecv,
        router: Arc<Router>,
        receiver_pipeline: Option<Arc<ReceiverPipeline>>,
    ) {
        while let Ok(frame) = noise_rx.next_decrypted_frame().await {
            let node = match Node::decode(&frame) {
                Ok(node) => node,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to decode incoming node");
                    continue;
                }
            };
            tracing::debug!(tag = %node.tag, "incoming node");
            match node.tag.as_str() {
                "message" | "receipt" | "notification" | "call" => {
                    if let Some(pipeline) = &receiver_pipeline {
                        pipeline.handle_incoming(node).await;
                    }
                }
                _ => router.dispatch(node).await,
            }
        }
    }

    /// Disconnect and optionally clear session. Clears the transport when present.
    pub async fn disconnect(&self, logout: bool) -> crate::Result<()> {
        self.supervisor.manual_close().await;
        self.router.cancel_all().await;
        if logout {
            let device = self.device.read().await.clone();
            if let Some(ref d) = device {
                if let Some(ref jid) = d.id {
                    self.store.delete(jid).await?;
                }
            }
            *self.device.write().await = None;
            self.logged_in.store(false, Ordering::SeqCst);
        }
        if let Some(t) = self.transport.write().await.take() {
            let _ = t.close().await;
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Log out (unpair) and disconnect.
    pub async fn logout(&self) -> crate::Result<()> {
        self.disconnect(true).await
    }

    /// Whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether the client has a logged-in session.
    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    /// Get our JID if logged in.
    pub async fn get_own_id(&self) -> Option<Jid> {
        self.device.read().await.as_ref().and_then(|d| d.id.clone())
    }

    /// Generate a message ID (3EB0 + hex of hash).
    pub fn generate_message_id(&self) -> MessageId {
        use std::time::{SystemTime, UNIX_EPOCH};
        let mut data = Vec::with_capacity(8 + 20 + 16);
        let t = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        data.extend_from_slice(&t.to_be_bytes());
        data.extend_from_slice(b"@c.us");
        data.extend_from_slice(&rand::random::<[u8; 16]>());
        let hash = sha2::Sha256::digest(&data);
        format!("3EB0{}", hex::encode(&hash[..9]))
    }

    /// Send a raw node over the transport when connected (used internally
    /// by the sender pipeline's [`OutboundSink`]).
    #[allow(dead_code)]
    pub(crate) async fn send_node(&self, node: &Node) -> crate::Result<()> {
        let transport = self.transport.read().await;
        let t = transport
            .as_ref()
            .ok_or(Error::Connection(ConnectionError::Disconnected))?;
        let data = node.encode()?;
        t.send(&data).await
    }

    /// Send a text message: routes through the sender pipeline's 1:1 or
    /// group path depending on the recipient (spec.md §4.H).
    pub async fn send_message(
        &self,
        to: &Jid,
        body: &str,
        extra: Option<SendRequestExtra>,
    ) -> crate::Result<SendResponse> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let sender_pipeline = self
            .sender_pipeline
            .read()
            .await
            .clone()
            .ok_or(Error::NotConnected)?;
        let own = self.get_own_id().await;

        let opts = MessageRelayOptions {
            message_id: extra.as_ref().and_then(|e| e.id.clone()),
            ..Default::default()
        };
        let (id, node) = if to.is_group() {
            let own = own.clone().ok_or(Error::NotConnected)?;
            sender_pipeline
                .build_group_message(to, &own, body.as_bytes(), &opts)
                .await?
        } else {
            sender_pipeline
                .build_individual_message(to, body.as_bytes(), &opts)
                .await?
        };
        self.send_node(&node).await?;

        Ok(SendResponse {
            timestamp: std::time::SystemTime::now(),
            id,
            server_id: None,
            sender: own,
        })
    }

    /// Parse pair-success and save device. Called when QR is scanned.
    /// If `params.hmac_key` is set, verifies `params.device_identity_bytes` (payload || HMAC-SHA256 tag) before proceeding.
    /// Generates pairing keys (Noise, identity, adv secret), signs the verified payload for storage, and persists the device.
    pub async fn complete_pairing(&self, params: CompletePairingParams<'_>) -> crate::Result<()> {
        let verified_payload = if let Some(key) = params.hmac_key {
            crate::pairing::verify_device_identity(params.device_identity_bytes, key)?.payload
        } else {
            params.device_identity_bytes.to_vec()
        };

        let keys = crate::pairing::generate_pairing_keys();
        let account =
            crate::pairing::sign_device_identity(&verified_payload, &keys.identity_private)?;

        let mut device = self.store.get_first_device().await?.unwrap_or_default();
        device.id = Some(params.jid.clone());
        device.lid = Some(params.lid.clone());
        device.business_name = Some(params.business_name.to_string());
        device.platform = Some(params.platform.to_string());
        device.creds.noise_key = crate::signal::KeyPair {
            public: keys.noise_public,
            private: keys.noise_private,
        };
        device.creds.signed_identity_key = crate::signal::KeyPair {
            public: keys.identity_public,
            private: keys.identity_private,
        };
        device.creds.adv_secret_key = keys.adv_secret;
        device.creds.account = Some(account);
        device.creds.me.id = Some(params.jid.clone());
        device.creds.me.lid = Some(params.lid.clone());
        device.creds.registered = true;
        self.store.save(&device).await?;
        *self.device.write().await = Some(device);
        self.logged_in.store(true, Ordering::SeqCst);
        self.event_bus
            .emit(Event::PairSuccess {
                id: params.jid.clone(),
                lid: params.lid.clone(),
                business_name: params.business_name.to_string(),
                platform: params.platform.to_string(),
            })
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::store::{DeviceStore, MemoryStore};

    #[test]
    fn generate_message_id_format() {
        let store = Arc::new(MemoryStore::new());
        let client = Client::new(store);
        let id = client.generate_message_id();
        assert!(id.starts_with("3EB0"));
        assert!(id.len() > 4);
        assert!(id[4..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn connect_emits_qr_when_no_session() {
        let store = Arc::new(MemoryStore::new());
        let client = Client::new(store);
        let qr_received = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let qr_received_clone = Arc::clone(&qr_received);
        client
            .add_event_handler(move |evt| {
                if let Event::Qr { .. } = evt {
                    qr_received_clone.store(true, std::sync::atomic::Ordering::SeqCst);
                }
            })
            .await;
        client.connect().await.unwrap();
        assert!(qr_received.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!client.is_logged_in());
    }

    #[tokio::test]
    async fn connect_emits_connected_when_session_exists() {
        let store = Arc::new(MemoryStore::new());
        let mut dev = crate::store::Device::default();
        dev.id = Some(Jid::new("123", "s.whatsapp.net"));
        store.save(&dev).await.unwrap();

        let client = Client::new(store);
        let connected_received = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let connected_received_clone = Arc::clone(&connected_received);
        client
            .add_event_handler(move |evt| {
                if let Event::Connected = evt {
                    connected_received_clone.store(true, std::sync::atomic::Ordering::SeqCst);
                }
            })
            .await;
        client.connect().await.unwrap();
        assert!(connected_received.load(std::sync::atomic::Ordering::SeqCst));
        assert!(client.is_logged_in());
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn disconnect_clears_state_on_logout() {
        let store = Arc::new(MemoryStore::new());
        let mut dev = crate::store::Device::default();
        dev.id = Some(Jid::new("123", "s.whatsapp.net"));
        store.save(&dev).await.unwrap();

        let client = Client::new(store);
        client.connect().await.unwrap();
        assert!(client.is_logged_in());
        client.disconnect(true).await.unwrap();
        assert!(!client.is_logged_in());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn send_message_fails_when_not_connected() {
        let store = Arc::new(MemoryStore::new());
        let client = Client::new(store);
        let to = Jid::new("123", "s.whatsapp.net");
        let res = client.send_message(&to, "hello", None).await;
        assert!(res.is_err());
        assert!(matches!(res.unwrap_err(), crate::Error::NotConnected));
    }

    #[tokio::test]
    async fn complete_pairing_persists_keys_and_account() {
        let store = Arc::new(MemoryStore::new());
        let client = Client::new(store.clone());
        let payload = b"device-identity-payload";
        client
            .complete_pairing(CompletePairingParams {
                device_identity_bytes: payload,
                req_id: "req1",
                business_name: "Biz",
                platform: "Rust",
                jid: Jid::new("123", "s.whatsapp.net"),
                lid: Jid::new("0", "lid.whatsapp.net"),
                hmac_key: None,
            })
            .await
            .unwrap();
        assert!(client.is_logged_in());
        let device = store.get_first_device().await.unwrap().unwrap();
        assert!(device.creds.account.is_some());
        let account = device.creds.account.as_ref().unwrap();
        assert!(account.len() >= 32 + 64);
        let verified = crate::pairing::verify_signed_identity(account).unwrap();
        assert_eq!(verified, payload);
    }
}
