//! Per-connection frame loop.
//!
//! Every accepted socket gets one task running [`handle_connection`]. The
//! task owns its `TcpStream` outright (wrapped in a `BufReader`, never
//! split) so that handing the raw stream to the primary coordinator on
//! `PSYNC` is just `reader.into_inner()` — no separate read/write halves to
//! reconcile. Everything that only touches the store goes through
//! [`crate::commands`]; this module adds the connection-scoped state
//! (`MULTI`/`EXEC` queue) and the pieces that reach outside the store
//! (`INFO`, `CONFIG`, `REPLCONF`, `PSYNC`, `WAIT`, blocking `XREAD`).

use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::commands;
use crate::context::ServerContext;
use crate::protocol::encode::{encode_array_of_bulk, encode_snapshot_payload, Reply};
use crate::protocol::frame::{decode_next, Frame};
use crate::replication::primary::CoordinatorEvent;
use crate::snapshot;
use crate::store::stream::StreamId;

type Queue = Vec<(String, Vec<Vec<u8>>)>;

pub async fn handle_connection(stream: TcpStream, ctx: std::sync::Arc<ServerContext>) {
    let peer = stream.peer_addr().ok();
    let mut reader = BufReader::new(stream);
    let mut queue: Option<Queue> = None;

    loop {
        let (name, args) = match decode_next(&mut reader).await {
            Ok(Frame::Command { name, args, .. }) => (name, args),
            Ok(Frame::Eof) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!(?peer, error = %err, "decode error, closing connection");
                break;
            }
        };

        if let Some(q) = queue.as_mut() {
            if !matches!(name.as_str(), "exec" | "discard" | "multi") {
                q.push((name, args));
                if write_reply(&mut reader, &Reply::Simple("QUEUED".to_string())).await.is_err() {
                    break;
                }
                continue;
            }
        }

        let outcome = match name.as_str() {
            "multi" => {
                queue = Some(Vec::new());
                write_reply(&mut reader, &Reply::ok()).await
            }
            "exec" => {
                let reply = match queue.take() {
                    None => Reply::Error("ERR EXEC without MULTI".to_string()),
                    Some(queued) => {
                        let mut replies = Vec::with_capacity(queued.len());
                        for (cname, cargs) in queued {
                            replies.push(commands::dispatch(&ctx, &cname, &cargs).await);
                        }
                        Reply::Array(replies)
                    }
                };
                write_reply(&mut reader, &reply).await
            }
            "discard" => {
                let reply = match queue.take() {
                    None => Reply::Error("ERR DISCARD without MULTI".to_string()),
                    Some(_) => Reply::ok(),
                };
                write_reply(&mut reader, &reply).await
            }
            "wait" => {
                let reply = handle_wait(&ctx, &args).await;
                write_reply(&mut reader, &reply).await
            }
            "xread" => {
                let reply = handle_xread(&ctx, &args).await;
                write_reply(&mut reader, &reply).await
            }
            "psync" => {
                handle_psync(&ctx, reader).await;
                return;
            }
            _ => {
                let reply = commands::dispatch(&ctx, &name, &args).await;
                write_reply(&mut reader, &reply).await
            }
        };

        if outcome.is_err() {
            break;
        }
    }
}

async fn write_reply(reader: &mut BufReader<TcpStream>, reply: &Reply) -> std::io::Result<()> {
    reader.get_mut().write_all(&reply.encode()).await
}

/// Hands the connection's raw socket to the primary coordinator as a
/// registered follower. Only meaningful when this process is a primary;
/// a follower receiving PSYNC (which should not happen in practice) just
/// closes the connection after replying.
async fn handle_psync(ctx: &ServerContext, mut reader: BufReader<TcpStream>) {
    let fullresync = format!("+FULLRESYNC {} 0\r\n", ctx.replid);
    if reader.get_mut().write_all(fullresync.as_bytes()).await.is_err() {
        return;
    }
    let framed = encode_snapshot_payload(&snapshot::empty_snapshot_bytes());
    if reader.get_mut().write_all(&framed).await.is_err() {
        return;
    }

    match &ctx.primary_tx {
        Some(tx) => {
            let stream = reader.into_inner();
            if tx.send(CoordinatorEvent::RegisterFollower(stream)).await.is_err() {
                warn!("primary coordinator gone, dropping new follower");
            }
        }
        None => {
            debug!("received PSYNC while not running as primary, closing");
        }
    }
}

async fn handle_wait(ctx: &ServerContext, args: &[Vec<u8>]) -> Reply {
    if args.len() != 2 {
        return Reply::Error("ERR wrong number of arguments for 'wait' command".to_string());
    }
    let min_acks: i64 = match parse_i64(&args[0]) {
        Some(n) => n,
        None => return Reply::Error("ERR value is not an integer or out of range".to_string()),
    };
    let timeout_ms: u64 = match parse_u64(&args[1]) {
        Some(n) => n,
        None => return Reply::Error("ERR timeout is not an integer or out of range".to_string()),
    };

    match &ctx.primary_tx {
        // Not running as primary: there is no replication stream to wait on.
        None => Reply::Integer(0),
        Some(tx) => {
            let (resp_tx, resp_rx) = oneshot::channel();
            if tx
                .send(CoordinatorEvent::Wait {
                    min_acks,
                    timeout_ms,
                    resp: resp_tx,
                })
                .await
                .is_err()
            {
                return Reply::Integer(0);
            }
            match resp_rx.await {
                Ok(n) => Reply::Integer(n),
                Err(_) => Reply::Integer(0),
            }
        }
    }
}

/// Blocking `XREAD`. Tries an immediate read first (matching real
/// semantics: data already present is returned without ever blocking),
/// then — only if `BLOCK` was given and nothing was immediately available
/// — registers a one-shot waiter per requested stream and races them
/// against the block timeout. `BLOCK 0` waits indefinitely.
async fn handle_xread(ctx: &ServerContext, args: &[Vec<u8>]) -> Reply {
    let (block_ms, keys, id_specs) = match commands::parse_xread_args(args) {
        Ok(parsed) => parsed,
        Err(message) => return Reply::Error(message),
    };
    let cursors: Vec<StreamId> = match commands::resolve_xread_cursors(&ctx.store, &keys, &id_specs) {
        Ok(cursors) => cursors,
        Err(message) => return Reply::Error(message),
    };

    let immediate = commands::xread_immediate(&ctx.store, &keys, &cursors);
    let Some(block_ms) = block_ms else {
        return immediate;
    };
    if !matches!(immediate, Reply::Null) {
        return immediate;
    }

    let (tx, mut rx) = mpsc::channel::<()>(keys.len().max(1));
    for key in &keys {
        let receiver = ctx.store.subscribe(key);
        let woke = tx.clone();
        tokio::spawn(async move {
            if receiver.await.is_ok() {
                let _ = woke.send(()).await;
            }
        });
    }
    drop(tx);

    let woken = if block_ms == 0 {
        rx.recv().await.is_some()
    } else {
        matches!(tokio::time::timeout(Duration::from_millis(block_ms), rx.recv()).await, Ok(Some(())))
    };

    for key in &keys {
        ctx.store.unsubscribe(key);
    }

    if woken {
        commands::xread_immediate(&ctx.store, &keys, &cursors)
    } else {
        Reply::Null
    }
}

fn parse_i64(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

fn parse_u64(bytes: &[u8]) -> Option<u64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// `INFO [section]`: a bulk string of `key:value` lines. Only the
/// `replication` section and the no-argument default are implemented,
/// matching the command table this server actually supports.
pub(crate) fn cmd_info(ctx: &ServerContext, args: &[Vec<u8>]) -> Reply {
    let section = args.first().map(|s| String::from_utf8_lossy(s).to_lowercase());
    let role_text = if ctx.is_primary() { "master" } else { "slave" };
    let body = match section.as_deref() {
        Some("replication") => format!(
            "# Replication\r\nrole:{role_text}\r\nmaster_replid:{}\r\nmaster_repl_offset:{}",
            ctx.replid,
            ctx.offset.read_prev_offset(),
        ),
        _ => format!("port:{}\r\nrole:{role_text}", ctx.config.port),
    };
    Reply::Bulk(body.into_bytes())
}

/// `CONFIG GET <key>`: only `dir` and `dbfilename` are recognized, the only
/// settings a client ever has reason to ask this server about.
pub(crate) fn cmd_config(ctx: &ServerContext, args: &[Vec<u8>]) -> Reply {
    if args.len() < 2 {
        return Reply::Error("ERR wrong number of arguments for 'config' command".to_string());
    }
    let sub = String::from_utf8_lossy(&args[0]).to_uppercase();
    if sub != "GET" {
        return Reply::Error(format!("ERR unsupported CONFIG subcommand '{sub}'"));
    }
    let key = String::from_utf8_lossy(&args[1]).to_lowercase();
    let value = match key.as_str() {
        "dir" => ctx.config.dir.clone(),
        "dbfilename" => ctx.config.dbfilename.clone(),
        _ => None,
    };
    match value {
        Some(v) => Reply::Array(vec![Reply::Bulk(key.into_bytes()), Reply::Bulk(v.into_bytes())]),
        None => Reply::Null,
    }
}

pub(crate) fn cmd_replconf(ctx: &ServerContext, args: &[Vec<u8>]) -> Reply {
    if args.first().is_some_and(|a| a.eq_ignore_ascii_case(b"getack")) {
        Reply::Array(vec![
            Reply::Bulk(b"REPLCONF".to_vec()),
            Reply::Bulk(b"ACK".to_vec()),
            Reply::Bulk(ctx.offset.read_offset().to_string().into_bytes()),
        ])
    } else {
        Reply::ok()
    }
}

/// Fans a just-applied mutation out to followers, if this process is a
/// primary with a live coordinator. No-op otherwise — including on a
/// follower applying a client write directly against its local store,
/// which this server allows but never re-propagates.
pub(crate) async fn replicate_raw(ctx: &ServerContext, parts: &[Vec<u8>]) {
    if let Some(tx) = &ctx.primary_tx {
        let frame = encode_array_of_bulk(parts);
        if tx.send(CoordinatorEvent::Replicated(frame)).await.is_err() {
            warn!("primary coordinator gone, dropping replication event");
        }
    }
}

pub(crate) async fn replicate_set(ctx: &ServerContext, key: &str, value: &[u8], expires_at_ms: Option<i64>) {
    let mut parts: Vec<Vec<u8>> = vec![b"SET".to_vec(), key.as_bytes().to_vec(), value.to_vec()];
    if let Some(exp) = expires_at_ms {
        let relative_ms = (exp - crate::store::now_ms()).max(0);
        parts.push(b"PX".to_vec());
        parts.push(relative_ms.to_string().into_bytes());
    }
    replicate_raw(ctx, &parts).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Role, ServerConfig};
    use crate::replication::offset::OffsetMeter;
    use crate::store::Store;
    use std::sync::Arc;

    fn test_ctx() -> ServerContext {
        let config = ServerConfig {
            port: 6379,
            role: Role::Primary,
            dir: Some("/tmp".to_string()),
            dbfilename: None,
        };
        ServerContext::new(config, Arc::new(Store::new()), Arc::new(OffsetMeter::new()))
    }

    #[test]
    fn info_default_reports_port_and_role() {
        let ctx = test_ctx();
        let reply = cmd_info(&ctx, &[]);
        match reply {
            Reply::Bulk(body) => {
                let text = String::from_utf8(body).unwrap();
                assert!(text.contains("port:6379"));
                assert!(text.contains("role:master"));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn config_get_known_key_returns_pair() {
        let ctx = test_ctx();
        let reply = cmd_config(&ctx, &[b"GET".to_vec(), b"dir".to_vec()]);
        match reply {
            Reply::Array(items) => assert_eq!(items.len(), 2),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn config_get_unknown_key_is_null() {
        let ctx = test_ctx();
        let reply = cmd_config(&ctx, &[b"GET".to_vec(), b"maxmemory".to_vec()]);
        assert!(matches!(reply, Reply::Null));
    }

    #[test]
    fn replconf_getack_reports_current_offset() {
        let ctx = test_ctx();
        ctx.offset.add_to_offset(42);
        let reply = cmd_replconf(&ctx, &[b"GETACK".to_vec(), b"*".to_vec()]);
        match reply {
            Reply::Array(items) => match &items[2] {
                Reply::Bulk(b) => assert_eq!(b, b"42"),
                other => panic!("unexpected reply: {other:?}"),
            },
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn wait_without_primary_tx_reports_zero() {
        let ctx = test_ctx();
        let reply = handle_wait(&ctx, &[b"1".to_vec(), b"0".to_vec()]).await;
        assert!(matches!(reply, Reply::Integer(0)));
    }

    async fn loopback_pair() -> (tokio::net::TcpStream, tokio::net::TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (server, client)
    }

    async fn read_n(client: &mut tokio::net::TcpStream, n: usize) -> Vec<u8> {
        use tokio::io::AsyncReadExt;
        let mut buf = vec![0u8; n];
        client.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn ping_over_the_wire_replies_pong() {
        use tokio::io::AsyncWriteExt;
        let (server, mut client) = loopback_pair().await;
        let ctx = Arc::new(test_ctx());
        tokio::spawn(handle_connection(server, ctx));

        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        let expected = b"+PONG\r\n";
        let reply = read_n(&mut client, expected.len()).await;
        assert_eq!(reply, expected);
    }

    #[tokio::test]
    async fn multi_queues_then_exec_runs_in_order() {
        use tokio::io::AsyncWriteExt;
        let (server, mut client) = loopback_pair().await;
        let ctx = Arc::new(test_ctx());
        tokio::spawn(handle_connection(server, ctx));

        client.write_all(b"*1\r\n$5\r\nMULTI\r\n").await.unwrap();
        assert_eq!(read_n(&mut client, b"+OK\r\n".len()).await, b"+OK\r\n");

        client
            .write_all(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\n1\r\n")
            .await
            .unwrap();
        assert_eq!(read_n(&mut client, b"+QUEUED\r\n".len()).await, b"+QUEUED\r\n");

        client.write_all(b"*2\r\n$4\r\nINCR\r\n$1\r\nk\r\n").await.unwrap();
        assert_eq!(read_n(&mut client, b"+QUEUED\r\n".len()).await, b"+QUEUED\r\n");

        client.write_all(b"*1\r\n$4\r\nEXEC\r\n").await.unwrap();
        let expected = b"*2\r\n+OK\r\n:2\r\n";
        let reply = read_n(&mut client, expected.len()).await;
        assert_eq!(reply, expected);
    }

    #[tokio::test]
    async fn exec_without_multi_is_an_error() {
        use tokio::io::AsyncWriteExt;
        let (server, mut client) = loopback_pair().await;
        let ctx = Arc::new(test_ctx());
        tokio::spawn(handle_connection(server, ctx));

        client.write_all(b"*1\r\n$4\r\nEXEC\r\n").await.unwrap();
        let expected = b"-ERR EXEC without MULTI\r\n";
        let reply = read_n(&mut client, expected.len()).await;
        assert_eq!(reply, expected);
    }
}
