//! RDB-like snapshot codec. Load-only: the server can read a snapshot file
//! at startup, but the only thing it ever hands a follower during PSYNC is
//! the canned empty-database blob below — there is no live dataset dump.
//!
//! Grounded on `app/protocol/redis_db/rdb.go` in the reference
//! implementation, with one deliberate fix: that source's `decodeString`
//! skips any byte `<= 0x20` while copying a string payload, which corrupts
//! arbitrary binary values. This decoder copies exactly the declared length.

use std::path::Path;

use tracing::warn;

use crate::errors::{ServerError, ServerResult};
use crate::store::Store;

const MAGIC: &[u8] = b"REDIS";
const AUX_FIELD: u8 = 0xFA;
const DB_SELECTOR: u8 = 0xFE;
const RESIZE_DB: u8 = 0xFB;
const EXPIRE_MS: u8 = 0xFC;
const EXPIRE_SEC: u8 = 0xFD;
const EOF: u8 = 0xFF;

/// The same fixed "empty database" payload the reference server embeds at
/// compile time and always ships as a full-resync snapshot.
const EMPTY_SNAPSHOT_BASE64: &str = "UkVESVMwMDEx+glyZWRpcy12ZXIFNy4yLjD6CnJlZGlzLWJpdHPAQPoFY3RpbWXCbQi8ZfoIdXNlZC1tZW3CsMQQAPoIYW9mLWJhc2XAAP/wbjv+wP9aog==";

pub fn empty_snapshot_bytes() -> Vec<u8> {
    decode_base64(EMPTY_SNAPSHOT_BASE64).expect("embedded empty-snapshot payload is valid base64")
}

/// Minimal standard-alphabet base64 decoder for the one embedded constant
/// above. The rest of the dependency stack has no other use for a `base64`
/// crate, so this follows the teacher's own precedent of hand-rolling small,
/// self-contained codecs (e.g. its big-endian integer helpers in `utils.rs`)
/// instead of adding one.
fn decode_base64(input: &str) -> Result<Vec<u8>, String> {
    fn value(byte: u8) -> Option<u8> {
        match byte {
            b'A'..=b'Z' => Some(byte - b'A'),
            b'a'..=b'z' => Some(byte - b'a' + 26),
            b'0'..=b'9' => Some(byte - b'0' + 52),
            b'+' => Some(62),
            b'/' => Some(63),
            _ => None,
        }
    }

    let mut out = Vec::with_capacity(input.len() / 4 * 3);
    let mut buffer: u32 = 0;
    let mut bits = 0u32;
    for byte in input.bytes() {
        if byte == b'=' || byte.is_ascii_whitespace() {
            continue;
        }
        let v = value(byte).ok_or_else(|| format!("invalid base64 byte: {byte}"))?;
        buffer = (buffer << 6) | v as u32;
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
        }
    }
    Ok(out)
}

/// Loads `path` into `store`, if it exists. A missing file is not an error.
pub fn load_snapshot_file(store: &Store, path: &Path) -> ServerResult<()> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let n = load_into(store, &bytes)?;
            tracing::info!(keys = n, path = %path.display(), "loaded snapshot");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "snapshot file not found, starting empty");
            Ok(())
        }
        Err(err) => Err(ServerError::Io(err)),
    }
}

/// Decodes a complete RDB-format byte slice and loads its key/value pairs
/// into `store`. Returns the number of entries loaded.
pub fn load_into(store: &Store, data: &[u8]) -> ServerResult<usize> {
    let mut cursor = Cursor::new(data);
    cursor.expect_bytes(MAGIC, "magic number")?;
    // The version is 4 ASCII digits; unlike the magic it is not pinned to a
    // single value here, since the canned full-resync blob and a real
    // on-disk snapshot need not share one.
    cursor.advance(4)?;

    if cursor.peek()? == AUX_FIELD {
        skip_aux_sections(&mut cursor)?;
    }

    if cursor.peek()? == DB_SELECTOR {
        cursor.advance(1)?;
        let _db_index = read_length(&mut cursor)?;
    }

    let mut loaded = 0usize;
    loop {
        let tag = cursor.peek()?;
        if tag == EOF {
            break;
        }
        if tag == RESIZE_DB {
            cursor.advance(1)?;
            let _hash_size = read_length(&mut cursor)?;
            let _expire_size = read_length(&mut cursor)?;
        }

        let tag = cursor.peek()?;
        let expires_at_ms = match tag {
            EXPIRE_MS => {
                cursor.advance(1)?;
                Some(cursor.read_u64_le()? as i64)
            }
            EXPIRE_SEC => {
                cursor.advance(1)?;
                Some(cursor.read_u32_le()? as i64 * 1000)
            }
            _ => None,
        };

        let _value_type = cursor.advance(1)?;
        let key = read_string(&mut cursor)?;
        let value = read_string(&mut cursor)?;
        store.set_with(&key, value, expires_at_ms);
        loaded += 1;
    }
    Ok(loaded)
}

fn skip_aux_sections(cursor: &mut Cursor<'_>) -> ServerResult<()> {
    while cursor.peek()? == AUX_FIELD {
        cursor.advance(1)?;
        let _key = read_string(cursor)?;
        let _value = read_string(cursor)?;
    }
    Ok(())
}

fn read_length(cursor: &mut Cursor<'_>) -> ServerResult<u64> {
    let first = cursor.advance(1)?[0];
    match first >> 6 {
        0b00 => Ok((first & 0x3F) as u64),
        0b01 => {
            let second = cursor.advance(1)?[0];
            Ok((((first & 0x3F) as u64) << 8) | second as u64)
        }
        0b10 => {
            let bytes = cursor.advance(4)?;
            Ok(u32::from_be_bytes(bytes.try_into().unwrap()) as u64)
        }
        _ => Err(ServerError::snapshot("special-encoded length not supported")),
    }
}

/// Reads a length-prefixed string, per §4.2's length grammar. A `11`-tagged
/// prefix is the special encoding: an 8/16/32-bit little-endian integer
/// stored as its decimal text rather than a raw byte run (used by the aux
/// fields a real RDB file carries, e.g. `redis-bits`/`ctime`). Compressed
/// (LZF) strings are the one special-encoding case this loader doesn't
/// support and surfaces as an error.
fn read_string(cursor: &mut Cursor<'_>) -> ServerResult<Vec<u8>> {
    let tag = cursor.peek()?;
    if tag >> 6 == 0b11 {
        cursor.advance(1)?;
        let value: i64 = match tag & 0x3F {
            0 => cursor.advance(1)?[0] as i8 as i64,
            1 => i16::from_le_bytes(cursor.advance(2)?.try_into().unwrap()) as i64,
            2 => i32::from_le_bytes(cursor.advance(4)?.try_into().unwrap()) as i64,
            _ => return Err(ServerError::snapshot("LZF-compressed strings are not supported")),
        };
        return Ok(value.to_string().into_bytes());
    }
    let len = read_length(cursor)? as usize;
    Ok(cursor.advance(len)?.to_vec())
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn peek(&self) -> ServerResult<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| ServerError::snapshot("unexpected end of snapshot data"))
    }

    fn advance(&mut self, n: usize) -> ServerResult<&'a [u8]> {
        let end = self.pos + n;
        let slice = self
            .data
            .get(self.pos..end)
            .ok_or_else(|| ServerError::snapshot("unexpected end of snapshot data"))?;
        self.pos = end;
        Ok(slice)
    }

    fn expect_bytes(&mut self, expected: &[u8], what: &str) -> ServerResult<()> {
        let actual = self.advance(expected.len())?;
        if actual != expected {
            return Err(ServerError::snapshot(format!("{what} mismatch")));
        }
        Ok(())
    }

    fn read_u32_le(&mut self) -> ServerResult<u32> {
        let bytes = self.advance(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_u64_le(&mut self) -> ServerResult<u64> {
        let bytes = self.advance(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_length(n: u8) -> Vec<u8> {
        vec![n & 0x3F]
    }

    fn encode_string(s: &[u8]) -> Vec<u8> {
        let mut out = encode_length(s.len() as u8);
        out.extend_from_slice(s);
        out
    }

    #[test]
    fn loads_minimal_file_with_one_pair() {
        let mut file = Vec::new();
        file.extend_from_slice(MAGIC);
        file.extend_from_slice(b"0003");
        file.push(DB_SELECTOR);
        file.push(0);
        file.push(0x00); // value type: string
        file.extend_from_slice(&encode_string(b"foo"));
        file.extend_from_slice(&encode_string(b"bar"));
        file.push(EOF);
        file.extend_from_slice(&[0u8; 8]);

        let store = Store::new();
        let n = load_into(&store, &file).unwrap();
        assert_eq!(n, 1);
        assert_eq!(store.get("foo"), Some(b"bar".to_vec()));
    }

    #[test]
    fn embedded_empty_snapshot_decodes_as_valid_base64() {
        let bytes = empty_snapshot_bytes();
        assert!(bytes.starts_with(MAGIC));
    }

    #[test]
    fn read_string_decodes_8_bit_special_int_as_decimal_text() {
        let data = [0xC0u8, 0x40]; // special encoding, 8-bit int, value 64
        let mut cursor = Cursor::new(&data);
        assert_eq!(read_string(&mut cursor).unwrap(), b"64".to_vec());
    }

    #[test]
    fn embedded_empty_snapshot_loads_despite_its_own_version() {
        // The canned blob carries its own RDB version, distinct from the one
        // a freshly-written on-disk snapshot might use; load_into must not
        // pin to a single expected value.
        let bytes = empty_snapshot_bytes();
        let store = Store::new();
        assert_eq!(load_into(&store, &bytes).unwrap(), 0);
    }
}
