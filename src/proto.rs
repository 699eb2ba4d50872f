//! Hand-written protobuf message shapes carried inside the Noise handshake
//! (spec.md §4.B) and the post-pairing reconnect payload. No `.proto` file
//! or `prost-build` step — plain structs deriving `prost::Message`, grounded
//! on the `ClientPayload`/device-pairing blob shape embedded in the Noise
//! `ClientFinish` payload in the whatsmeow-style ports in the retrieval
//! pack.

use prost::Message;

/// First handshake message's payload: empty for this crate (the Noise `e`
/// message itself carries no application payload over XX), kept as a named
/// type so the handshake's three messages are each self-describing.
#[derive(Clone, PartialEq, Message, Default)]
pub struct ClientHello {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub ephemeral: Option<Vec<u8>>,
}

/// Server's second handshake message payload: a signed static key plus
/// whatever pairing context the server wants to front-load (e.g. `pair-device`
/// refs, carried as raw bytes since this crate has no XML-in-protobuf bridge).
#[derive(Clone, PartialEq, Message, Default)]
pub struct ServerHello {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub static_public_key: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub payload: Option<Vec<u8>>,
}

/// Third handshake message's payload: the client's identity plus, once
/// paired, the full `ClientPayload` (spec.md §4.E "post-pairing reconnect").
#[derive(Clone, PartialEq, Message, Default)]
pub struct ClientFinish {
    #[prost(message, optional, tag = "1")]
    pub payload: Option<ClientPayload>,
}

/// Account + device props + routing info sent on every post-pairing
/// reconnect (spec.md §4.E).
#[derive(Clone, PartialEq, Message, Default)]
pub struct ClientPayload {
    #[prost(uint32, optional, tag = "1")]
    pub registration_id: Option<u32>,
    /// Signed device identity blob from `pairing::sign_device_identity`.
    #[prost(bytes = "vec", optional, tag = "2")]
    pub account: Option<Vec<u8>>,
    #[prost(string, optional, tag = "3")]
    pub platform: Option<String>,
    #[prost(message, optional, tag = "4")]
    pub device_props: Option<DeviceProps>,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub routing_info: Option<Vec<u8>>,
    /// Announces desire for full history on login (spec.md `syncFullHistory`).
    #[prost(bool, optional, tag = "6")]
    pub pull_full_history: Option<bool>,
}

/// `[platform, browser, version]` device props, mirroring
/// [`crate::config::BrowserInfo`].
#[derive(Clone, PartialEq, Message, Default)]
pub struct DeviceProps {
    #[prost(string, optional, tag = "1")]
    pub os: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub version: Option<String>,
}

impl From<&crate::config::BrowserInfo> for DeviceProps {
    fn from(b: &crate::config::BrowserInfo) -> Self {
        Self {
            os: Some(b.platform.clone()),
            version: Some(b.version.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_payload_round_trips_through_prost() {
        let payload = ClientPayload {
            registration_id: Some(42),
            account: Some(vec![1, 2, 3]),
            platform: Some("Rust".to_string()),
            device_props: Some(DeviceProps {
                os: Some("Mac OS".to_string()),
                version: Some("121.0.0".to_string()),
            }),
            routing_info: None,
            pull_full_history: Some(true),
        };
        let encoded = payload.encode_to_vec();
        let decoded = ClientPayload::decode(encoded.as_slice()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn client_finish_wraps_client_payload() {
        let finish = ClientFinish {
            payload: Some(ClientPayload {
                registration_id: Some(7),
                account: None,
                platform: None,
                device_props: None,
                routing_info: None,
                pull_full_history: None,
            }),
        };
        let encoded = finish.encode_to_vec();
        let decoded = ClientFinish::decode(encoded.as_slice()).unwrap();
        assert_eq!(decoded.payload.unwrap().registration_id, Some(7));
    }
}
