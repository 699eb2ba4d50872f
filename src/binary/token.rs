//! Token dictionary for the binary protocol's string compression.
//!
//! Grounded on the token table shape used by whatsmeow-style Rust ports
//! (`other_examples/RieGan-whatsmeow-rs/src/binary/token.rs`): a single-byte
//! dictionary for the most common stanza vocabulary, plus four "double-byte"
//! dictionaries (`DICTIONARY_0..3`) selected by a marker byte for a second
//! tier of common-but-less-frequent strings. This is a representative subset
//! of the real WhatsApp server dictionary, not the multi-thousand-entry
//! table — unknown strings always fall back to inline `BINARY_8`/`BINARY_20`,
//! which is what spec.md requires readers/writers to tolerate.

use once_cell::sync::Lazy;
use std::collections::HashMap;

#[allow(dead_code)]
pub const DICT_VERSION: u8 = 3;

pub const LIST_EMPTY: u8 = 0;
pub const DICTIONARY_0: u8 = 236;
pub const DICTIONARY_1: u8 = 237;
pub const DICTIONARY_2: u8 = 238;
pub const DICTIONARY_3: u8 = 239;
#[allow(dead_code)]
pub const INTEROP_JID: u8 = 245;
#[allow(dead_code)]
pub const FB_JID: u8 = 246;
pub const AD_JID: u8 = 247;
pub const LIST_8: u8 = 248;
pub const LIST_16: u8 = 249;
pub const JID_PAIR: u8 = 250;
pub const HEX_8: u8 = 251;
pub const BINARY_8: u8 = 252;
pub const BINARY_20: u8 = 253;
pub const BINARY_32: u8 = 254;
pub const NIBBLE_8: u8 = 255;

/// Single-byte tokens, indexed by position (index 0 is reserved/empty).
pub const SINGLE_BYTE_TOKENS: &[&str] = &[
    "",
    "xmlstreamstart",
    "xmlstreamend",
    "s.whatsapp.net",
    "type",
    "participant",
    "from",
    "receipt",
    "id",
    "notification",
    "disappearing_mode",
    "status",
    "jid",
    "broadcast",
    "user",
    "devices",
    "device_hash",
    "to",
    "offline",
    "message",
    "result",
    "class",
    "xmlns",
    "duration",
    "notify",
    "iq",
    "t",
    "ack",
    "g.us",
    "enc",
    "urn:xmpp:whatsapp:push",
    "presence",
    "config_value",
    "picture",
    "verified_name",
    "config_code",
    "key-index-list",
    "contact",
    "mediatype",
    "routing_info",
    "edge_routing",
    "get",
    "read",
    "urn:xmpp:ping",
    "fallback_hostname",
    "0",
    "chatstate",
    "business_hours_config",
    "unavailable",
    "download_buckets",
    "skmsg",
    "verified_level",
    "composing",
    "handshake",
    "device-list",
    "media",
    "text",
    "fallback_ip4",
    "media_conn",
    "device",
    "creation",
    "location",
    "config",
    "item",
    "fallback_ip6",
    "count",
    "w:profile:picture",
    "image",
    "business",
    "2",
    "hostname",
    "call-creator",
    "display_name",
    "relaylatency",
    "platform",
    "abprops",
    "success",
    "msg",
    "offline_preview",
    "prop",
    "key-index",
    "v",
    "day_of_week",
    "pkmsg",
    "version",
    "1",
    "ping",
    "w:p",
    "download",
    "video",
    "set",
    "specific_hours",
    "props",
    "primary",
    "unknown",
    "hash",
    "commerce_experience",
    "last",
    "subscribe",
    "max_buckets",
    "call",
    "profile",
    "member_since_text",
    "close_time",
    "call-id",
    "sticker",
    "mode",
    "participants",
    "value",
    "query",
    "profile_options",
    "open_time",
    "code",
    "list",
    "host",
    "ts",
    "contacts",
    "upload",
    "lid",
    "preview",
    "update",
    "usync",
    "w:stats",
    "delivery",
    "auth_ttl",
    "context",
    "fail",
    "retry",
    "error",
    "stream:error",
    "key",
    "identity",
    "registration",
    "signature",
    "account",
    "urn:xmpp:whatsapp:account",
    "w:sync:app:state",
];

/// Double-byte dictionaries, selected by `DICTIONARY_0..3` marker byte.
pub const DOUBLE_BYTE_TOKENS: &[&[&str]] = &[
    // Dictionary 0
    &[
        "read-self",
        "active",
        "fbns",
        "protocol",
        "reaction",
        "screen_width",
        "heartbeat",
        "deviceid",
        "2:47DEQpj8",
        "uploadfieldstat",
        "voip_settings",
        "priority",
        "longitude",
        "conflict",
        "false",
        "ig_professional",
        "replaced",
        "preaccept",
        "cover_photo",
        "uncompressed",
        "encopt",
        "ppic",
        "04",
        "passive",
        "status-revoke-drop",
    ],
    // Dictionary 1
    &[
        "reject",
        "dirty",
        "announcement",
        "020",
        "13",
        "9",
        "status_video_max_bitrate",
    ],
    // Dictionary 2
    &[
        "64",
        "ptt_playback_speed_enabled",
        "web_product_list_message_enabled",
    ],
    // Dictionary 3
    &["1724", "profile_picture", "1071", "1314", "1605", "407", "990", "1710"],
];

static SINGLE_BYTE_TOKEN_INDEX: Lazy<HashMap<&'static str, u8>> = Lazy::new(|| {
    let mut map = HashMap::new();
    for (index, &token) in SINGLE_BYTE_TOKENS.iter().enumerate() {
        if !token.is_empty() {
            map.insert(token, index as u8);
        }
    }
    map
});

static DOUBLE_BYTE_TOKEN_INDEX: Lazy<HashMap<&'static str, (u8, u8)>> = Lazy::new(|| {
    let mut map = HashMap::new();
    for (dict_index, &tokens) in DOUBLE_BYTE_TOKENS.iter().enumerate() {
        for (token_index, &token) in tokens.iter().enumerate() {
            map.insert(token, (dict_index as u8, token_index as u8));
        }
    }
    map
});

pub fn get_single_token(index: u8) -> Option<&'static str> {
    SINGLE_BYTE_TOKENS.get(index as usize).copied()
}

pub fn get_double_token(dict: u8, index: u8) -> Option<&'static str> {
    DOUBLE_BYTE_TOKENS
        .get(dict as usize)
        .and_then(|tokens| tokens.get(index as usize))
        .copied()
}

pub fn index_of_single_token(token: &str) -> Option<u8> {
    SINGLE_BYTE_TOKEN_INDEX.get(token).copied()
}

pub fn index_of_double_token(token: &str) -> Option<(u8, u8)> {
    DOUBLE_BYTE_TOKEN_INDEX.get(token).copied()
}

/// Marker byte for a `DICTIONARY_N` index, or `None` if `n` is out of range.
pub fn dictionary_marker(n: u8) -> Option<u8> {
    match n {
        0 => Some(DICTIONARY_0),
        1 => Some(DICTIONARY_1),
        2 => Some(DICTIONARY_2),
        3 => Some(DICTIONARY_3),
        _ => None,
    }
}

/// Dictionary index for a `DICTIONARY_N` marker byte, or `None` if not one.
pub fn dictionary_index(marker: u8) -> Option<u8> {
    match marker {
        DICTIONARY_0 => Some(0),
        DICTIONARY_1 => Some(1),
        DICTIONARY_2 => Some(2),
        DICTIONARY_3 => Some(3),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_token_roundtrip() {
        let idx = index_of_single_token("message").unwrap();
        assert_eq!(get_single_token(idx), Some("message"));
    }

    #[test]
    fn double_token_roundtrip() {
        let (dict, idx) = index_of_double_token("reject").unwrap();
        assert_eq!(get_double_token(dict, idx), Some("reject"));
    }

    #[test]
    fn unknown_token_absent() {
        assert_eq!(index_of_single_token("not-a-real-token-xyz"), None);
    }
}
