//! Follower-side replication: connects out to a primary, runs the
//! handshake, loads the transferred snapshot, then applies the ongoing
//! command stream to the local store.
//!
//! State machine: `CONNECTING → PING_SENT → REPLCONF_PORT → REPLCONF_CAPA →
//! PSYNC_SENT → SNAPSHOT_XFER → REPLICATING`. Modeled here as a straight-line
//! sequence of awaited round-trips rather than an explicit enum — each stage
//! either succeeds and falls through to the next or returns an error, which
//! is equivalent and reads simpler for a handshake with no external inputs.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{error, info, warn};

use crate::commands;
use crate::errors::{ServerError, ServerResult};
use crate::protocol::encode::encode_array_of_bulk;
use crate::protocol::frame::{decode_next, Frame};
use crate::replication::offset::OffsetMeter;
use crate::snapshot;
use crate::store::Store;

/// Runs forever: performs the handshake and replication loop, and on any
/// failure (connection refused, decode error, primary going away)
/// reconnects after a short backoff rather than giving up.
pub async fn run(host: String, port: u16, own_port: u16, store: Arc<Store>, offset: Arc<OffsetMeter>) {
    loop {
        match replicate_once(&host, port, own_port, &store, &offset).await {
            Ok(()) => warn!(primary = %format!("{host}:{port}"), "replication stream ended, reconnecting"),
            Err(err) => error!(primary = %format!("{host}:{port}"), error = %err, "replication failed, reconnecting"),
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

async fn replicate_once(
    host: &str,
    port: u16,
    own_port: u16,
    store: &Store,
    offset: &OffsetMeter,
) -> ServerResult<()> {
    let stream = TcpStream::connect((host, port)).await?;
    let mut reader = BufReader::new(stream);

    send_command(&mut reader, &[b"PING".to_vec()]).await?;
    expect_simple(&mut reader).await?;

    send_command(
        &mut reader,
        &[b"REPLCONF".to_vec(), b"listening-port".to_vec(), own_port.to_string().into_bytes()],
    )
    .await?;
    expect_simple(&mut reader).await?;

    send_command(&mut reader, &[b"REPLCONF".to_vec(), b"capa".to_vec(), b"psync2".to_vec()]).await?;
    expect_simple(&mut reader).await?;

    send_command(&mut reader, &[b"PSYNC".to_vec(), b"?".to_vec(), b"-1".to_vec()]).await?;
    let fullresync = expect_simple(&mut reader).await?;
    if !fullresync.starts_with("FULLRESYNC") {
        return Err(ServerError::protocol(format!("unexpected PSYNC reply: {fullresync}")));
    }
    info!(reply = %fullresync, "handshake complete, awaiting snapshot");

    match decode_next(&mut reader).await? {
        Frame::SnapshotPayload(data) => {
            let n = snapshot::load_into(store, &data)?;
            info!(keys = n, "loaded snapshot from primary");
        }
        other => return Err(ServerError::protocol(format!("expected snapshot payload, got {other:?}"))),
    }

    loop {
        match decode_next(&mut reader).await? {
            Frame::Command { name, args, byte_size } => {
                // Every fully-decoded frame counts towards the offset
                // before the next one is read, including the GETACK frame
                // itself — the ACK reply this produces therefore reports an
                // offset that already includes the probe's own bytes.
                offset.add_to_offset(byte_size as i64);
                apply_replicated(&mut reader, store, offset, &name, &args).await?;
            }
            Frame::Eof => return Ok(()),
            _ => {}
        }
    }
}

async fn apply_replicated(
    reader: &mut BufReader<TcpStream>,
    store: &Store,
    offset: &OffsetMeter,
    name: &str,
    args: &[Vec<u8>],
) -> ServerResult<()> {
    match name {
        "set" => {
            if let Ok((key, value, expires_at_ms)) = commands::parse_set_args(args) {
                store.apply_replicated_set(&key, value, expires_at_ms);
            }
        }
        "xadd" if args.len() >= 2 => {
            let key = String::from_utf8_lossy(&args[0]).to_string();
            let id_spec = String::from_utf8_lossy(&args[1]).to_string();
            let fields = args[2..]
                .chunks_exact(2)
                .map(|pair| (String::from_utf8_lossy(&pair[0]).to_string(), pair[1].clone()))
                .collect();
            // The primary already resolved any `*`/`<ms>-*` spec to a
            // concrete id before propagating, so this just replays it.
            let _ = store.xadd(&key, &id_spec, fields);
        }
        "replconf" if args.first().is_some_and(|a| a.eq_ignore_ascii_case(b"getack")) => {
            let ack = encode_array_of_bulk(&[b"REPLCONF".as_slice(), b"ACK", offset.read_offset().to_string().as_bytes()]);
            reader.get_mut().write_all(&ack).await?;
        }
        _ => {}
    }
    Ok(())
}

async fn send_command(reader: &mut BufReader<TcpStream>, parts: &[Vec<u8>]) -> ServerResult<()> {
    let frame = encode_array_of_bulk(parts);
    reader.get_mut().write_all(&frame).await?;
    Ok(())
}

async fn expect_simple(reader: &mut BufReader<TcpStream>) -> ServerResult<String> {
    match decode_next(reader).await? {
        Frame::SimpleLine(line) => Ok(line),
        other => Err(ServerError::protocol(format!("expected simple reply, got {other:?}"))),
    }
}
