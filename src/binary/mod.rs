//! Binary protocol nodes (whatsmeow binary package).
//! WhatsApp uses a custom binary XML-like node format over the Noise socket.

pub mod consts;
pub mod decoder;
pub mod encoder;
pub mod token;

use crate::types::Jid;
use std::collections::HashMap;

/// Attributes on a node (key-value; values can be string, int, etc. in Go; we use string for simplicity).
pub type Attrs = HashMap<String, String>;

/// Content of a node: child nodes, raw bytes, or a single JID (spec.md §4.A —
/// the content slot can carry a JID directly via `JID_PAIR`/`AD_JID`, e.g.
/// `<usync>` participant lists).
#[derive(Clone, Debug, Default, PartialEq)]
pub enum NodeContent {
    #[default]
    Empty,
    Nodes(Vec<Node>),
    Bytes(Vec<u8>),
    Jid(Jid),
}

/// A single binary protocol node (mirrors waBinary.Node).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Node {
    pub tag: String,
    pub attrs: Attrs,
    pub content: NodeContent,
}

impl Node {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: Attrs::new(),
            content: NodeContent::Empty,
        }
    }

    pub fn with_attr(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.attrs.insert(k.into(), v.into());
        self
    }

    pub fn with_children(mut self, children: Vec<Node>) -> Self {
        self.content = NodeContent::Nodes(children);
        self
    }

    pub fn with_content(mut self, bytes: Vec<u8>) -> Self {
        self.content = NodeContent::Bytes(bytes);
        self
    }

    pub fn get_child_by_tag(&self, tag: &str) -> Option<&Node> {
        match &self.content {
            NodeContent::Nodes(nodes) => nodes.iter().find(|n| n.tag == tag),
            _ => None,
        }
    }

    pub fn get_children(&self) -> &[Node] {
        match &self.content {
            NodeContent::Nodes(n) => n,
            _ => &[],
        }
    }

    /// Encode to binary form (tokenized tree per spec.md §4.A).
    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        let mut out = Vec::new();
        encoder::encode_node(self, &mut out)?;
        Ok(out)
    }

    /// Decode from binary form. A malformed node fails the decode without
    /// consuming further bytes; callers fail just the frame, not the
    /// connection (spec.md §4.A), except during the handshake.
    pub fn decode(data: &[u8]) -> crate::Result<Self> {
        decoder::decode(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// spec.md §8: codec round-trip is the first testable property — encode
    /// then decode must reproduce the original node exactly, attrs included.
    #[test]
    fn codec_round_trips_a_node_with_attrs_and_children() {
        let node = Node::new("message")
            .with_attr("id", "3EB0")
            .with_attr("to", "1234567890@s.whatsapp.net")
            .with_children(vec![Node::new("enc")
                .with_attr("type", "pkmsg")
                .with_content(vec![1, 2, 3, 4, 5])]);

        let encoded = node.encode().unwrap();
        let decoded = Node::decode(&encoded).unwrap();
        assert_eq!(decoded, node);
    }

    /// spec.md §8: an unrecognized single-byte token must fail the decode
    /// for just that frame, not panic or silently substitute something else.
    #[test]
    fn decode_rejects_unknown_token() {
        // LIST_8 of size 1, tag byte 254 is BINARY_32 needing 4 length bytes
        // we don't supply — starved read, not a dictionary hit.
        let truncated = vec![token::LIST_8, 1, token::BINARY_32];
        let err = Node::decode(&truncated).unwrap_err();
        assert!(matches!(err, Error::Binary(_)));
    }

    /// spec.md §8: numeric JIDs (phone numbers) must round-trip through the
    /// `NIBBLE_8` packed encoding, not fall back to `BINARY_8`.
    #[test]
    fn codec_round_trips_numeric_jid_via_nibble_pack() {
        let jid = Jid::new("15551234567", crate::types::jid::DEFAULT_USER_SERVER);
        let node = Node {
            content: NodeContent::Jid(jid.clone()),
            ..Node::new("usync")
        };

        let encoded = node.encode().unwrap();
        // NIBBLE_8 marker must appear since the user part is all digits.
        assert!(encoded.contains(&token::NIBBLE_8));

        let decoded = Node::decode(&encoded).unwrap();
        assert_eq!(decoded, node);
        match decoded.content {
            NodeContent::Jid(got) => assert_eq!(got, jid),
            other => panic!("expected Jid content, got {:?}", other),
        }
    }
}
