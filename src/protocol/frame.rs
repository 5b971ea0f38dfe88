//! Wire decoder.
//!
//! The protocol is line-oriented and tag-prefixed, in the style of the
//! Redis RESP family: `*` introduces an array, `$` a length-prefixed
//! payload, `+`/`-`/`:` a single textual line. Decoding happens one frame
//! at a time off an `AsyncBufRead`; nothing is pipelined ahead of what the
//! caller asks for.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::errors::{ServerError, ServerResult};

/// One decoded protocol unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// An array of bulk strings, interpreted as a command name plus its
    /// arguments. `byte_size` is the exact number of bytes this frame
    /// occupied on the wire, tag through trailing CRLF.
    Command {
        name: String,
        args: Vec<Vec<u8>>,
        byte_size: usize,
    },
    /// A `+`, `-`, or `:` line, stripped of its leading tag and trailing
    /// CRLF.
    SimpleLine(String),
    /// A `$<len>\r\n<payload>\r\n` frame.
    BulkPayload(Vec<u8>),
    /// A `$<len>\r\n<payload>` frame with no trailing CRLF — the snapshot
    /// transfer framing used by PSYNC's full resync.
    SnapshotPayload(Vec<u8>),
    /// A tag this decoder does not recognize. The currently buffered bytes
    /// are drained so the stream can resynchronize on the next read.
    Unknown,
    /// The underlying stream reached end of file before any tag byte.
    Eof,
}

/// Decode exactly one [`Frame`] from `reader`.
pub async fn decode_next<R>(reader: &mut R) -> ServerResult<Frame>
where
    R: AsyncBufRead + Unpin,
{
    let mut tag = [0u8; 1];
    let n = reader.read(&mut tag).await?;
    if n == 0 {
        return Ok(Frame::Eof);
    }
    match tag[0] {
        b'*' => decode_array(reader).await,
        b'$' => {
            let (data, _consumed, had_crlf) = decode_bulk_body(reader).await?;
            if had_crlf {
                Ok(Frame::BulkPayload(data))
            } else {
                Ok(Frame::SnapshotPayload(data))
            }
        }
        b'+' | b'-' | b':' => {
            let (line, _consumed) = read_line(reader).await?;
            Ok(Frame::SimpleLine(line))
        }
        _ => {
            let buf = reader.fill_buf().await?;
            let drained = buf.len();
            reader.consume(drained);
            Ok(Frame::Unknown)
        }
    }
}

/// Reads a line up to and including `\r\n` (or bare `\n`), returning the
/// trimmed text and the number of bytes consumed including the delimiter.
async fn read_line<R>(reader: &mut R) -> ServerResult<(String, usize)>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    let consumed = reader.read_until(b'\n', &mut raw).await?;
    if consumed == 0 {
        return Err(ServerError::protocol("truncated line"));
    }
    while raw.last() == Some(&b'\n') || raw.last() == Some(&b'\r') {
        raw.pop();
    }
    let text = String::from_utf8(raw)
        .map_err(|_| ServerError::protocol("line is not valid UTF-8"))?;
    Ok((text, consumed))
}

fn parse_decimal(text: &str) -> ServerResult<i64> {
    text.trim()
        .parse::<i64>()
        .map_err(|_| ServerError::protocol(format!("expected decimal length, got {text:?}")))
}

/// Reads the `<len>\r\n<payload>` body of a `$` frame, plus its trailing
/// CRLF when present. Returns the payload, the number of bytes consumed
/// after the leading `$` tag, and whether a trailing CRLF was consumed.
async fn decode_bulk_body<R>(reader: &mut R) -> ServerResult<(Vec<u8>, usize, bool)>
where
    R: AsyncBufRead + Unpin,
{
    let (len_line, line_len) = read_line(reader).await?;
    let len = parse_decimal(&len_line)?;
    if len < 0 {
        return Ok((Vec::new(), line_len, true));
    }
    let len = len as usize;
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    let mut consumed = line_len + len;

    let buf = reader.fill_buf().await?;
    if buf.len() >= 2 && &buf[0..2] == b"\r\n" {
        reader.consume(2);
        consumed += 2;
        Ok((data, consumed, true))
    } else {
        Ok((data, consumed, false))
    }
}

async fn decode_array<R>(reader: &mut R) -> ServerResult<Frame>
where
    R: AsyncBufRead + Unpin,
{
    let (len_line, line_len) = read_line(reader).await?;
    let count = parse_decimal(&len_line)?;
    let mut byte_size = 1 + line_len;

    if count <= 0 {
        return Err(ServerError::protocol("empty or negative command array"));
    }

    let mut elements: Vec<Vec<u8>> = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut tag = [0u8; 1];
        let n = reader.read(&mut tag).await?;
        if n == 0 {
            return Err(ServerError::protocol("truncated array element"));
        }
        byte_size += 1;
        if tag[0] != b'$' {
            return Err(ServerError::protocol("array element is not a bulk string"));
        }
        let (data, consumed, _had_crlf) = decode_bulk_body(reader).await?;
        byte_size += consumed;
        elements.push(data);
    }

    let name = String::from_utf8_lossy(&elements[0]).to_lowercase();
    let args = elements.into_iter().skip(1).collect();
    Ok(Frame::Command {
        name,
        args,
        byte_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn decodes_simple_command() {
        let input = b"*1\r\n$4\r\nPING\r\n".to_vec();
        let mut reader = BufReader::new(&input[..]);
        let frame = decode_next(&mut reader).await.unwrap();
        match frame {
            Frame::Command {
                name,
                args,
                byte_size,
            } => {
                assert_eq!(name, "ping");
                assert!(args.is_empty());
                assert_eq!(byte_size, input.len());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn decodes_command_with_args() {
        let input = b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n".to_vec();
        let mut reader = BufReader::new(&input[..]);
        let frame = decode_next(&mut reader).await.unwrap();
        match frame {
            Frame::Command {
                name,
                args,
                byte_size,
            } => {
                assert_eq!(name, "set");
                assert_eq!(args, vec![b"foo".to_vec(), b"bar".to_vec()]);
                assert_eq!(byte_size, input.len());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn distinguishes_snapshot_payload_from_bulk() {
        let input = b"$5\r\nhello".to_vec();
        let mut reader = BufReader::new(&input[..]);
        let frame = decode_next(&mut reader).await.unwrap();
        assert_eq!(frame, Frame::SnapshotPayload(b"hello".to_vec()));

        let input = b"$5\r\nhello\r\n".to_vec();
        let mut reader = BufReader::new(&input[..]);
        let frame = decode_next(&mut reader).await.unwrap();
        assert_eq!(frame, Frame::BulkPayload(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn decodes_simple_line() {
        let input = b"+OK\r\n".to_vec();
        let mut reader = BufReader::new(&input[..]);
        let frame = decode_next(&mut reader).await.unwrap();
        assert_eq!(frame, Frame::SimpleLine("OK".to_string()));
    }

    #[tokio::test]
    async fn reports_eof() {
        let input: Vec<u8> = Vec::new();
        let mut reader = BufReader::new(&input[..]);
        let frame = decode_next(&mut reader).await.unwrap();
        assert_eq!(frame, Frame::Eof);
    }
}
