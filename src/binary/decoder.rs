//! Decoder for the binary node format.
//!
//! Mirrors the encoder's token usage: dictionary tokens for common strings,
//! `JID_PAIR`/`AD_JID` for JIDs, `NIBBLE_8`/`HEX_8` for packed numeric/hex
//! strings, and `BINARY_8`/`BINARY_20`/`BINARY_32` as the always-available
//! fallback for anything not in the dictionary (spec.md §4.A, grounded on
//! `other_examples/RieGan-whatsmeow-rs/src/binary/decoder.rs`).

use crate::binary::token;
use crate::types::Jid;
use crate::Error;
use std::collections::HashMap;

fn check_eos(data: &[u8], position: usize, len: usize) -> crate::Result<()> {
    if position + len <= data.len() {
        Ok(())
    } else {
        Err(Error::Binary("unexpected eof".into()))
    }
}

/// Decodes a binary protocol node.
pub fn decode(data: &[u8]) -> crate::Result<super::Node> {
    let mut d = Decoder::new(data);
    d.read_node()
}

pub(super) struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub(super) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_u8(&mut self) -> crate::Result<u8> {
        check_eos(self.data, self.pos, 1)?;
        let b = self.data[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn read_u16_be(&mut self) -> crate::Result<u16> {
        check_eos(self.data, self.pos, 2)?;
        let b = &self.data[self.pos..self.pos + 2];
        self.pos += 2;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u20_be(&mut self) -> crate::Result<u32> {
        check_eos(self.data, self.pos, 3)?;
        let b = &self.data[self.pos..self.pos + 3];
        self.pos += 3;
        Ok(((b[0] as u32 & 0x0F) << 16) | ((b[1] as u32) << 8) | (b[2] as u32))
    }

    fn read_u32_be(&mut self) -> crate::Result<u32> {
        check_eos(self.data, self.pos, 4)?;
        let b = &self.data[self.pos..self.pos + 4];
        self.pos += 4;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_bytes(&mut self, len: usize) -> crate::Result<Vec<u8>> {
        check_eos(self.data, self.pos, len)?;
        let out = self.data[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(out)
    }

    /// Reads a nibble- or hex-packed numeric string (`NIBBLE_8`/`HEX_8`).
    /// First byte: top bit set means the last nibble is a padding filler,
    /// low 7 bits are the number of packed bytes that follow.
    fn read_packed(&mut self, alphabet: &[char]) -> crate::Result<String> {
        let header = self.read_u8()?;
        let is_odd = header & 0x80 != 0;
        let num_bytes = (header & 0x7F) as usize;
        let bytes = self.read_bytes(num_bytes)?;
        let mut out = String::with_capacity(num_bytes * 2);
        for (i, byte) in bytes.iter().enumerate() {
            let hi = (byte >> 4) & 0x0F;
            let lo = byte & 0x0F;
            out.push(*alphabet.get(hi as usize).ok_or_else(|| {
                Error::Binary(format!("invalid packed nibble {}", hi))
            })?);
            if is_odd && i == bytes.len() - 1 {
                break;
            }
            out.push(*alphabet.get(lo as usize).ok_or_else(|| {
                Error::Binary(format!("invalid packed nibble {}", lo))
            })?);
        }
        Ok(out)
    }

    fn read_jid_pair(&mut self) -> crate::Result<Jid> {
        let user_tag = self.read_u8()?;
        let user = if user_tag == token::LIST_EMPTY {
            String::new()
        } else {
            self.pos -= 1;
            self.read_string()?
        };
        let server = self.read_string()?;
        if user.is_empty() {
            Ok(Jid::server(server))
        } else {
            Ok(Jid::new(user, server))
        }
    }

    fn read_ad_jid(&mut self) -> crate::Result<Jid> {
        let agent = self.read_u8()?;
        let device = self.read_u8()?;
        let user = self.read_string()?;
        Ok(Jid::new_ad(user, agent, device as u16, crate::types::jid::DEFAULT_USER_SERVER))
    }

    fn read_string(&mut self) -> crate::Result<String> {
        let tag = self.read_u8()?;
        self.read_string_body(tag)
    }

    fn read_string_body(&mut self, tag: u8) -> crate::Result<String> {
        match tag {
            token::LIST_EMPTY => Ok(String::new()),
            token::DICTIONARY_0 | token::DICTIONARY_1 | token::DICTIONARY_2 | token::DICTIONARY_3 => {
                let dict = token::dictionary_index(tag).expect("matched dictionary marker");
                let index = self.read_u8()?;
                token::get_double_token(dict, index)
                    .map(|s| s.to_string())
                    .ok_or_else(|| Error::Binary(format!("unknown double-byte token {}/{}", dict, index)))
            }
            token::JID_PAIR => Ok(self.read_jid_pair()?.to_string()),
            token::AD_JID => Ok(self.read_ad_jid()?.to_string()),
            token::NIBBLE_8 => self.read_packed(&NIBBLE_ALPHABET),
            token::HEX_8 => self.read_packed(&HEX_ALPHABET),
            token::BINARY_8 => {
                let len = self.read_u8()? as usize;
                let bytes = self.read_bytes(len)?;
                String::from_utf8(bytes).map_err(|e| Error::Binary(e.to_string()))
            }
            token::BINARY_20 => {
                let len = self.read_u20_be()? as usize;
                let bytes = self.read_bytes(len)?;
                String::from_utf8(bytes).map_err(|e| Error::Binary(e.to_string()))
            }
            token::BINARY_32 => {
                let len = self.read_u32_be()? as usize;
                let bytes = self.read_bytes(len)?;
                String::from_utf8(bytes).map_err(|e| Error::Binary(e.to_string()))
            }
            _ => token::get_single_token(tag)
                .map(|s| s.to_string())
                .ok_or_else(|| Error::Binary(format!("unknown token {}", tag))),
        }
    }

    fn read_list_size(&mut self, list_tag: u8) -> crate::Result<usize> {
        match list_tag {
            token::LIST_EMPTY => Ok(0),
            token::LIST_8 => Ok(self.read_u8()? as usize),
            token::LIST_16 => Ok(self.read_u16_be()? as usize),
            _ => Err(Error::Binary(format!("unsupported list token {}", list_tag))),
        }
    }

    fn read_node(&mut self) -> crate::Result<super::Node> {
        let list_tag = self.read_u8()?;
        let list_size = self.read_list_size(list_tag)?;
        if list_size == 0 {
            return Err(Error::Binary("empty list size for node".into()));
        }
        let tag = self.read_string()?;
        let attr_count = (list_size - 1) / 2;
        let has_content = (list_size % 2) == 0;

        let mut attrs = HashMap::new();
        for _ in 0..attr_count {
            let k = self.read_string()?;
            let v = self.read_string()?;
            attrs.insert(k, v);
        }

        let content = if has_content {
            self.read_content()?
        } else {
            super::NodeContent::Empty
        };

        Ok(super::Node { tag, attrs, content })
    }

    fn read_content(&mut self) -> crate::Result<super::NodeContent> {
        let tag = self.read_u8()?;
        match tag {
            token::LIST_EMPTY => Ok(super::NodeContent::Empty),
            token::BINARY_8 => {
                let len = self.read_u8()? as usize;
                Ok(super::NodeContent::Bytes(self.read_bytes(len)?))
            }
            token::BINARY_20 => {
                let len = self.read_u20_be()? as usize;
                Ok(super::NodeContent::Bytes(self.read_bytes(len)?))
            }
            token::BINARY_32 => {
                let len = self.read_u32_be()? as usize;
                Ok(super::NodeContent::Bytes(self.read_bytes(len)?))
            }
            token::JID_PAIR => Ok(super::NodeContent::Jid(self.read_jid_pair()?)),
            token::AD_JID => Ok(super::NodeContent::Jid(self.read_ad_jid()?)),
            token::LIST_8 | token::LIST_16 => {
                let n = self.read_list_size(tag)?;
                let mut children = Vec::with_capacity(n);
                for _ in 0..n {
                    children.push(self.read_node()?);
                }
                Ok(super::NodeContent::Nodes(children))
            }
            _ => Err(Error::Binary(format!("unsupported content token {}", tag))),
        }
    }
}

const NIBBLE_ALPHABET: [char; 16] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', '-', '.', '\0', '\0', '\0', '\0',
];
const HEX_ALPHABET: [char; 16] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'B', 'C', 'D', 'E', 'F',
];
