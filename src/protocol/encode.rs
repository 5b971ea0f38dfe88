//! Wire encoder.
//!
//! Mirrors the decode side: plain functions that build the bytes for each
//! frame kind, plus a [`Reply`] tree so command handlers can describe a
//! response shape (including nested arrays) without hand-building byte
//! buffers inline.

pub fn encode_bulk_string(data: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

pub fn encode_null_bulk() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

/// `$<len>\r\n<payload>` with no trailing CRLF — the snapshot-transfer
/// framing PSYNC's full resync uses, distinguishing it on the wire from an
/// ordinary bulk string.
pub fn encode_snapshot_payload(data: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out
}

pub fn encode_null() -> Vec<u8> {
    b"_\r\n".to_vec()
}

pub fn encode_simple_string(s: &str) -> Vec<u8> {
    format!("+{s}\r\n").into_bytes()
}

pub fn encode_simple_error(s: &str) -> Vec<u8> {
    format!("-{s}\r\n").into_bytes()
}

pub fn encode_integer(n: i64) -> Vec<u8> {
    format!(":{n}\r\n").into_bytes()
}

/// Encodes an array of bulk strings, the shape every outbound command
/// (and the replication stream) uses.
pub fn encode_array_of_bulk<T: AsRef<[u8]>>(items: &[T]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", items.len()).into_bytes();
    for item in items {
        out.extend_from_slice(&encode_bulk_string(item.as_ref()));
    }
    out
}

/// A reply a command handler wants to send back, described structurally
/// rather than as raw bytes.
#[derive(Debug, Clone)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Vec<u8>),
    NullBulk,
    Null,
    Array(Vec<Reply>),
    /// Pre-encoded bytes, used for frames this enum can't otherwise shape
    /// (e.g. a snapshot transfer's no-CRLF bulk framing).
    Raw(Vec<u8>),
}

impl Reply {
    pub fn ok() -> Reply {
        Reply::Simple("OK".to_string())
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Reply::Simple(s) => encode_simple_string(s),
            Reply::Error(s) => encode_simple_error(s),
            Reply::Integer(n) => encode_integer(*n),
            Reply::Bulk(b) => encode_bulk_string(b),
            Reply::NullBulk => encode_null_bulk(),
            Reply::Null => encode_null(),
            Reply::Array(items) => {
                let mut out = format!("*{}\r\n", items.len()).into_bytes();
                for item in items {
                    out.extend_from_slice(&item.encode());
                }
                out
            }
            Reply::Raw(bytes) => bytes.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_bulk_string() {
        assert_eq!(encode_bulk_string(b"hi"), b"$2\r\nhi\r\n");
    }

    #[test]
    fn encodes_array_of_bulk() {
        let items: Vec<&[u8]> = vec![b"SET", b"k", b"v"];
        assert_eq!(
            encode_array_of_bulk(&items),
            b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n".to_vec()
        );
    }

    #[test]
    fn encodes_snapshot_payload_without_trailing_crlf() {
        assert_eq!(encode_snapshot_payload(b"hi"), b"$2\r\nhi".to_vec());
    }

    #[test]
    fn reply_array_nests() {
        let reply = Reply::Array(vec![Reply::Integer(1), Reply::Bulk(b"x".to_vec())]);
        assert_eq!(reply.encode(), b"*2\r\n:1\r\n$1\r\nx\r\n".to_vec());
    }
}
