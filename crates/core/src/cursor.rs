//! Opaque resumption cursor.
//!
//! Wire form: base64url (no padding) over
//! `block_num (LEB128 varint) ‖ block_id (32 bytes) ‖ trx_id_prefix (8 bytes)`.
//! A cursor stays valid across forks only if its `block_id` still resolves
//! to a canonical ancestor; that check belongs to the router.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

use crate::error::{SearchError, SearchResult};

const BLOCK_ID_BYTES: usize = 32;
const TRX_PREFIX_BYTES: usize = 8;

/// Decoded resumption token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub block_num: u64,
    /// Lowercase hex, 64 chars.
    pub block_id: String,
    /// Lowercase hex, 16 chars (first 8 bytes of the transaction id).
    pub trx_id_prefix: String,
}

impl Cursor {
    pub fn new(
        block_num: u64,
        block_id: impl Into<String>,
        trx_id_prefix: impl Into<String>,
    ) -> Self {
        Self {
            block_num,
            block_id: block_id.into(),
            trx_id_prefix: trx_id_prefix.into(),
        }
    }

    /// Encode into the opaque client token.
    pub fn encode(&self) -> SearchResult<String> {
        let id = decode_hex_exact(&self.block_id, BLOCK_ID_BYTES)
            .ok_or_else(|| SearchError::internal("cursor block id is not 32 hex-encoded bytes"))?;
        let prefix = decode_hex_prefix(&self.trx_id_prefix, TRX_PREFIX_BYTES).ok_or_else(|| {
            SearchError::internal("cursor trx id prefix is shorter than 8 hex-encoded bytes")
        })?;

        let mut raw = Vec::with_capacity(10 + BLOCK_ID_BYTES + TRX_PREFIX_BYTES);
        write_varint(&mut raw, self.block_num);
        raw.extend_from_slice(&id);
        raw.extend_from_slice(&prefix);
        Ok(URL_SAFE_NO_PAD.encode(raw))
    }

    /// Decode a client-supplied token. Failures are argument errors: the
    /// token is client input, not service state.
    pub fn decode(token: &str) -> SearchResult<Self> {
        let raw = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| SearchError::invalid_argument("cursor is not valid base64url"))?;

        let (block_num, rest) = read_varint(&raw)
            .ok_or_else(|| SearchError::invalid_argument("cursor block number is malformed"))?;
        if rest.len() != BLOCK_ID_BYTES + TRX_PREFIX_BYTES {
            return Err(SearchError::invalid_argument(format!(
                "cursor body is {} bytes, expected {}",
                rest.len(),
                BLOCK_ID_BYTES + TRX_PREFIX_BYTES
            )));
        }

        Ok(Self {
            block_num,
            block_id: encode_hex(&rest[..BLOCK_ID_BYTES]),
            trx_id_prefix: encode_hex(&rest[BLOCK_ID_BYTES..]),
        })
    }
}

fn write_varint(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push((v as u8 & 0x7f) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

fn read_varint(buf: &[u8]) -> Option<(u64, &[u8])> {
    let mut out = 0u64;
    let mut shift = 0u32;
    for (i, &b) in buf.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        out |= u64::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Some((out, &buf[i + 1..]));
        }
        shift += 7;
    }
    None
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn decode_hex_exact(hex: &str, len: usize) -> Option<Vec<u8>> {
    let out = decode_hex(hex)?;
    (out.len() == len).then_some(out)
}

/// Decode at least `len` bytes of hex and truncate to `len`.
fn decode_hex_prefix(hex: &str, len: usize) -> Option<Vec<u8>> {
    let mut out = decode_hex(hex)?;
    if out.len() < len {
        return None;
    }
    out.truncate(len);
    Some(out)
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    hex.as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            Some((hi * 16 + lo) as u8)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn hex_of(byte: u8, len: usize) -> String {
        encode_hex(&vec![byte; len])
    }

    #[test]
    fn round_trip() {
        let c = Cursor::new(1_234_567, hex_of(0xab, 32), hex_of(0x7f, 8));
        let token = c.encode().unwrap();
        assert_eq!(Cursor::decode(&token).unwrap(), c);
    }

    #[test]
    fn longer_trx_prefix_is_truncated_to_eight_bytes() {
        let c = Cursor::new(9, hex_of(0x01, 32), hex_of(0x22, 20));
        let decoded = Cursor::decode(&c.encode().unwrap()).unwrap();
        assert_eq!(decoded.trx_id_prefix, hex_of(0x22, 8));
    }

    #[test]
    fn rejects_garbage_tokens() {
        assert!(Cursor::decode("not base64 ???").is_err());
        assert!(Cursor::decode("").is_err());
        // valid base64, truncated body
        let short = URL_SAFE_NO_PAD.encode([0x05, 0x01, 0x02]);
        assert!(Cursor::decode(&short).is_err());
    }

    #[test]
    fn encode_requires_well_formed_ids() {
        assert!(Cursor::new(1, "zz", hex_of(0, 8)).encode().is_err());
        assert!(Cursor::new(1, hex_of(0, 32), "beef").encode().is_err());
    }

    proptest! {
        #[test]
        fn varint_round_trips(v in any::<u64>()) {
            let mut buf = Vec::new();
            write_varint(&mut buf, v);
            let (decoded, rest) = read_varint(&buf).unwrap();
            prop_assert_eq!(decoded, v);
            prop_assert!(rest.is_empty());
        }

        #[test]
        fn cursor_round_trips(num in any::<u64>(), id_byte in any::<u8>(), trx_byte in any::<u8>()) {
            let c = Cursor::new(num, hex_of(id_byte, 32), hex_of(trx_byte, 8));
            prop_assert_eq!(Cursor::decode(&c.encode().unwrap()).unwrap(), c);
        }
    }
}
