//! Encoder for the binary node format.
//!
//! Strings get the cheapest applicable token: single-byte dictionary, then
//! double-byte dictionary, then `NIBBLE_8` for digit-only content (WhatsApp
//! phone numbers and message IDs), finally `BINARY_8`/`BINARY_20`/`BINARY_32`
//! as the fallback the decoder always understands (spec.md §4.A, grounded on
//! `other_examples/RieGan-whatsmeow-rs/src/binary/encoder.rs`).

use crate::binary::token;
use crate::types::Jid;
use crate::Error;
use std::io::Write;

fn write_u8(w: &mut impl Write, v: u8) -> Result<(), Error> {
    w.write_all(&[v]).map_err(|e| Error::Binary(e.to_string()))
}

fn write_u16_be(w: &mut impl Write, v: u16) -> Result<(), Error> {
    w.write_all(&v.to_be_bytes()).map_err(|e| Error::Binary(e.to_string()))
}

fn write_u20_be(w: &mut impl Write, v: u32) -> Result<(), Error> {
    let b = [((v >> 16) & 0x0F) as u8, (v >> 8) as u8, v as u8];
    w.write_all(&b).map_err(|e| Error::Binary(e.to_string()))
}

fn write_u32_be(w: &mut impl Write, v: u32) -> Result<(), Error> {
    w.write_all(&v.to_be_bytes()).map_err(|e| Error::Binary(e.to_string()))
}

const NIBBLE_CHARS: &str = "0123456789-.";

fn nibble_index(c: char) -> Option<u8> {
    NIBBLE_CHARS.find(c).map(|i| i as u8)
}

fn is_nibble_packable(s: &str) -> bool {
    !s.is_empty() && s.len() <= 127 * 2 && s.chars().all(|c| nibble_index(c).is_some())
}

fn write_packed(w: &mut impl Write, s: &str, marker: u8) -> Result<(), Error> {
    let chars: Vec<char> = s.chars().collect();
    let is_odd = chars.len() % 2 != 0;
    let num_bytes = (chars.len() + 1) / 2;
    write_u8(w, marker)?;
    write_u8(w, (num_bytes as u8) | if is_odd { 0x80 } else { 0x00 })?;
    let mut bytes = Vec::with_capacity(num_bytes);
    let mut iter = chars.chunks(2);
    for pair in &mut iter {
        let hi = nibble_index(pair[0]).unwrap();
        let lo = pair.get(1).and_then(|&c| nibble_index(c)).unwrap_or(0);
        bytes.push((hi << 4) | lo);
    }
    w.write_all(&bytes).map_err(|e| Error::Binary(e.to_string()))
}

fn write_plain_bytes(w: &mut impl Write, bytes: &[u8]) -> Result<(), Error> {
    let len = bytes.len();
    if len <= u8::MAX as usize {
        write_u8(w, token::BINARY_8)?;
        write_u8(w, len as u8)?;
    } else if len <= 0x0F_FFFF {
        write_u8(w, token::BINARY_20)?;
        write_u20_be(w, len as u32)?;
    } else if len <= u32::MAX as usize {
        write_u8(w, token::BINARY_32)?;
        write_u32_be(w, len as u32)?;
    } else {
        return Err(Error::Binary("content too long to encode".into()));
    }
    w.write_all(bytes).map_err(|e| Error::Binary(e.to_string()))
}

fn write_string(w: &mut impl Write, s: &str) -> Result<(), Error> {
    if s.is_empty() {
        return write_u8(w, token::LIST_EMPTY);
    }
    if let Some(index) = token::index_of_single_token(s) {
        return write_u8(w, index);
    }
    if let Some((dict, index)) = token::index_of_double_token(s) {
        let marker = token::dictionary_marker(dict).expect("dict index in range");
        write_u8(w, marker)?;
        return write_u8(w, index);
    }
    if is_nibble_packable(s) {
        return write_packed(w, s, token::NIBBLE_8);
    }
    write_plain_bytes(w, s.as_bytes())
}

fn write_jid(w: &mut impl Write, jid: &Jid) -> Result<(), Error> {
    if jid.raw_agent != 0 || jid.device != 0 {
        write_u8(w, token::AD_JID)?;
        write_u8(w, jid.raw_agent)?;
        write_u8(w, jid.device.min(u8::MAX as u16) as u8)?;
        write_string(w, &jid.user)
    } else {
        write_u8(w, token::JID_PAIR)?;
        write_string(w, &jid.user)?;
        write_string(w, &jid.server)
    }
}

/// Encode a node to the binary format.
pub fn encode_node(node: &super::Node, out: &mut Vec<u8>) -> Result<(), Error> {
    let attr_count = node.attrs.len();
    let has_content = !matches!(node.content, super::NodeContent::Empty);
    let list_size = 1 + 2 * attr_count + if has_content { 1 } else { 0 };

    if list_size <= u8::MAX as usize {
        write_u8(out, token::LIST_8)?;
        write_u8(out, list_size as u8)?;
    } else {
        write_u8(out, token::LIST_16)?;
        write_u16_be(out, list_size as u16)?;
    }

    write_string(out, &node.tag)?;
    for (k, v) in &node.attrs {
        write_string(out, k)?;
        write_string(out, v)?;
    }

    if has_content {
        encode_content(out, &node.content)?;
    }
    Ok(())
}

fn encode_content(out: &mut Vec<u8>, content: &super::NodeContent) -> Result<(), Error> {
    match content {
        super::NodeContent::Empty => {
            write_u8(out, token::LIST_EMPTY)?;
        }
        super::NodeContent::Bytes(b) => {
            write_plain_bytes(out, b)?;
        }
        super::NodeContent::Jid(jid) => {
            write_jid(out, jid)?;
        }
        super::NodeContent::Nodes(children) => {
            let n = children.len();
            if n <= u8::MAX as usize {
                write_u8(out, token::LIST_8)?;
                write_u8(out, n as u8)?;
            } else {
                write_u8(out, token::LIST_16)?;
                write_u16_be(out, n as u16)?;
            }
            for child in children {
                encode_node(child, out)?;
            }
        }
    }
    Ok(())
}
