//! Pure command handlers: everything that only touches the [`Store`] and
//! needs no connection or coordinator state. `MULTI`/`EXEC`/`DISCARD`,
//! blocking `XREAD`, `WAIT`, `PSYNC` and `REPLCONF` stay in `connection.rs`
//! since they reach outside the store.

use crate::context::ServerContext;
use crate::protocol::encode::Reply;
use crate::store::stream::StreamId;
use crate::store::{now_ms, Store, StreamEntry};

/// Runs one command against the shared context: the store-only commands
/// dispatch straight into this module's pure handlers; `INFO`/`CONFIG`/
/// `REPLCONF` reach into connection-scoped context and live in
/// [`crate::connection`]. Used both for a connection's top-level command
/// and to replay a queue drained by `EXEC`.
pub async fn dispatch(ctx: &ServerContext, name: &str, args: &[Vec<u8>]) -> Reply {
    match name {
        "ping" => cmd_ping(),
        "echo" => cmd_echo(args),
        "set" => {
            let (reply, applied) = cmd_set(&ctx.store, args);
            if let Some((key, value, expires_at_ms)) = applied {
                crate::connection::replicate_set(ctx, &key, &value, expires_at_ms).await;
            }
            reply
        }
        "get" => cmd_get(&ctx.store, args),
        "incr" => cmd_incr(&ctx.store, args),
        "keys" => cmd_keys(&ctx.store, args),
        "type" => cmd_type(&ctx.store, args),
        "xadd" => {
            let (reply, replicated) = cmd_xadd(&ctx.store, args);
            if let Some(parts) = replicated {
                crate::connection::replicate_raw(ctx, &parts).await;
            }
            reply
        }
        "xrange" => cmd_xrange(&ctx.store, args),
        "xread" => cmd_xread(&ctx.store, args),
        "config" => crate::connection::cmd_config(ctx, args),
        "info" => crate::connection::cmd_info(ctx, args),
        "replconf" => crate::connection::cmd_replconf(ctx, args),
        // Queued inside a transaction, these either don't make sense
        // replayed (MULTI/EXEC/DISCARD nesting) or can't defer the way
        // they normally would (WAIT, PSYNC): a transaction never opens a
        // nested transaction and never hands its socket off mid-replay.
        "multi" | "exec" | "discard" => {
            Reply::Error(format!("ERR {} is not allowed inside MULTI", name.to_uppercase()))
        }
        "wait" => Reply::Integer(0),
        "psync" => Reply::Error("ERR PSYNC is not allowed inside MULTI".to_string()),
        _ => Reply::Simple("UNKNOWN CMD".to_string()),
    }
}

pub fn parse_set_args(args: &[Vec<u8>]) -> Result<(String, Vec<u8>, Option<i64>), String> {
    if args.len() < 2 {
        return Err("ERR wrong number of arguments for 'set' command".to_string());
    }
    let key = String::from_utf8_lossy(&args[0]).to_string();
    let value = args[1].clone();
    let mut expires_at_ms = None;
    let mut i = 2;
    while i < args.len() {
        let opt = String::from_utf8_lossy(&args[i]).to_uppercase();
        match opt.as_str() {
            "PX" => {
                let ms_arg = args.get(i + 1).ok_or_else(|| "ERR syntax error".to_string())?;
                let ms: i64 = std::str::from_utf8(ms_arg)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| "ERR value is not an integer or out of range".to_string())?;
                expires_at_ms = Some(now_ms() + ms);
                i += 2;
            }
            other => return Err(format!("ERR syntax error near '{other}'")),
        }
    }
    Ok((key, value, expires_at_ms))
}

pub fn cmd_ping() -> Reply {
    Reply::Simple("PONG".to_string())
}

pub fn cmd_echo(args: &[Vec<u8>]) -> Reply {
    match args.first() {
        Some(message) => Reply::Simple(String::from_utf8_lossy(message).to_string()),
        None => Reply::Error("ERR wrong number of arguments for 'echo' command".to_string()),
    }
}

/// Returns the parsed `(key, value, expires_at_ms)` alongside the reply so
/// the caller can decide whether to fan the mutation out to followers.
pub fn cmd_set(store: &Store, args: &[Vec<u8>]) -> (Reply, Option<(String, Vec<u8>, Option<i64>)>) {
    match parse_set_args(args) {
        Ok((key, value, expires_at_ms)) => {
            store.set_with(&key, value.clone(), expires_at_ms);
            (Reply::ok(), Some((key, value, expires_at_ms)))
        }
        Err(message) => (Reply::Error(message), None),
    }
}

pub fn cmd_get(store: &Store, args: &[Vec<u8>]) -> Reply {
    let Some(key) = args.first() else {
        return Reply::Error("ERR wrong number of arguments for 'get' command".to_string());
    };
    let key = String::from_utf8_lossy(key);
    match store.get(&key) {
        Some(value) => Reply::Bulk(value),
        None => Reply::NullBulk,
    }
}

pub fn cmd_incr(store: &Store, args: &[Vec<u8>]) -> Reply {
    let Some(key) = args.first() else {
        return Reply::Error("ERR wrong number of arguments for 'incr' command".to_string());
    };
    let key = String::from_utf8_lossy(key);
    match store.incr(&key) {
        Ok(n) => Reply::Integer(n),
        Err(message) => Reply::Error(message),
    }
}

pub fn cmd_keys(store: &Store, args: &[Vec<u8>]) -> Reply {
    let pattern = args.first().map(|p| String::from_utf8_lossy(p).to_string());
    if pattern.as_deref() != Some("*") {
        return Reply::Error("ERR KEYS only supports the literal '*' pattern".to_string());
    }
    Reply::Array(
        store
            .keys_all()
            .into_iter()
            .map(|k| Reply::Bulk(k.into_bytes()))
            .collect(),
    )
}

pub fn cmd_type(store: &Store, args: &[Vec<u8>]) -> Reply {
    let Some(key) = args.first() else {
        return Reply::Error("ERR wrong number of arguments for 'type' command".to_string());
    };
    let key = String::from_utf8_lossy(key);
    Reply::Simple(store.type_of(&key).to_string())
}

fn parse_field_value_pairs(args: &[Vec<u8>]) -> Result<Vec<(String, Vec<u8>)>, String> {
    if args.is_empty() || args.len() % 2 != 0 {
        return Err("ERR wrong number of arguments for 'xadd' command".to_string());
    }
    Ok(args
        .chunks_exact(2)
        .map(|pair| (String::from_utf8_lossy(&pair[0]).to_string(), pair[1].clone()))
        .collect())
}

pub fn cmd_xadd(store: &Store, args: &[Vec<u8>]) -> (Reply, Option<Vec<Vec<u8>>>) {
    if args.len() < 4 {
        return (
            Reply::Error("ERR wrong number of arguments for 'xadd' command".to_string()),
            None,
        );
    }
    let key = String::from_utf8_lossy(&args[0]).to_string();
    let id_spec = String::from_utf8_lossy(&args[1]).to_string();
    let fields = match parse_field_value_pairs(&args[2..]) {
        Ok(fields) => fields,
        Err(message) => return (Reply::Error(message), None),
    };
    match store.xadd(&key, &id_spec, fields) {
        Ok(id) => {
            let mut replicated = vec![b"XADD".to_vec(), key.into_bytes(), id.to_string().into_bytes()];
            for (field, value) in args[2..].chunks_exact(2).map(|c| (&c[0], &c[1])) {
                replicated.push(field.clone());
                replicated.push(value.clone());
            }
            (Reply::Bulk(id.to_string().into_bytes()), Some(replicated))
        }
        Err(message) => (Reply::Error(message), None),
    }
}

/// Shared by `XRANGE` and `XREAD`: one entry becomes `[id, [field, value, …]]`.
fn entry_to_reply(entry: StreamEntry) -> Reply {
    let mut fields = Vec::with_capacity(entry.fields.len() * 2);
    for (field, value) in entry.fields {
        fields.push(Reply::Bulk(field.into_bytes()));
        fields.push(Reply::Bulk(value));
    }
    Reply::Array(vec![
        Reply::Bulk(entry.id.to_string().into_bytes()),
        Reply::Array(fields),
    ])
}

pub fn cmd_xrange(store: &Store, args: &[Vec<u8>]) -> Reply {
    if args.len() != 3 {
        return Reply::Error("ERR wrong number of arguments for 'xrange' command".to_string());
    }
    let key = String::from_utf8_lossy(&args[0]);
    let lower = String::from_utf8_lossy(&args[1]);
    let upper = String::from_utf8_lossy(&args[2]);
    match store.xrange(&key, &lower, &upper) {
        Ok(entries) => Reply::Array(entries.into_iter().map(entry_to_reply).collect()),
        Err(message) => Reply::Error(message),
    }
}

/// Parses everything after `XREAD` up to and including `STREAMS`: an
/// optional `BLOCK <ms>`, then the key list followed by the matching id
/// list (same length, keys first).
pub fn parse_xread_args(args: &[Vec<u8>]) -> Result<(Option<u64>, Vec<String>, Vec<String>), String> {
    let mut i = 0;
    let mut block_ms = None;
    loop {
        let token = args
            .get(i)
            .map(|a| String::from_utf8_lossy(a).to_uppercase())
            .ok_or_else(|| "ERR syntax error".to_string())?;
        match token.as_str() {
            "BLOCK" => {
                let ms_arg = args.get(i + 1).ok_or_else(|| "ERR syntax error".to_string())?;
                let ms: u64 = std::str::from_utf8(ms_arg)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| "ERR timeout is not an integer or out of range".to_string())?;
                block_ms = Some(ms);
                i += 2;
            }
            "STREAMS" => {
                i += 1;
                break;
            }
            other => return Err(format!("ERR syntax error near '{other}'")),
        }
    }
    let rest = &args[i..];
    if rest.is_empty() || rest.len() % 2 != 0 {
        return Err(
            "ERR Unbalanced XREAD list of streams: for each stream key an ID or '$' must be specified."
                .to_string(),
        );
    }
    let n = rest.len() / 2;
    let keys = rest[..n].iter().map(|b| String::from_utf8_lossy(b).to_string()).collect();
    let ids = rest[n..].iter().map(|b| String::from_utf8_lossy(b).to_string()).collect();
    Ok((block_ms, keys, ids))
}

/// Resolves each requested cursor against the store: `$` becomes the
/// stream's current `last_id` *at this moment*, anything else is parsed as
/// an explicit id.
pub fn resolve_xread_cursors(
    store: &Store,
    keys: &[String],
    id_specs: &[String],
) -> Result<Vec<StreamId>, String> {
    keys.iter()
        .zip(id_specs)
        .map(|(key, spec)| {
            if spec == "$" {
                Ok(store.current_last_id(key))
            } else {
                crate::store::stream::parse_cursor_id(spec)
            }
        })
        .collect()
}

/// A single non-blocking pass over every requested stream. Returns
/// [`Reply::Null`] when none of them have entries past their cursor —
/// the caller decides whether that means "give up" or "start blocking".
pub fn xread_immediate(store: &Store, keys: &[String], cursors: &[StreamId]) -> Reply {
    let mut per_stream = Vec::new();
    for (key, cursor) in keys.iter().zip(cursors) {
        let entries = store.xread_after(key, *cursor);
        if !entries.is_empty() {
            per_stream.push(Reply::Array(vec![
                Reply::Bulk(key.clone().into_bytes()),
                Reply::Array(entries.into_iter().map(entry_to_reply).collect()),
            ]));
        }
    }
    if per_stream.is_empty() {
        Reply::Null
    } else {
        Reply::Array(per_stream)
    }
}

/// Non-blocking `XREAD`, used both for requests with no `BLOCK` clause and
/// to replay a queued `XREAD` inside `EXEC` (which never defers).
pub fn cmd_xread(store: &Store, args: &[Vec<u8>]) -> Reply {
    let (_block_ms, keys, id_specs) = match parse_xread_args(args) {
        Ok(parsed) => parsed,
        Err(message) => return Reply::Error(message),
    };
    let cursors = match resolve_xread_cursors(store, &keys, &id_specs) {
        Ok(cursors) => cursors,
        Err(message) => return Reply::Error(message),
    };
    xread_immediate(store, &keys, &cursors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_with_px_computes_absolute_expiry() {
        let store = Store::new();
        let before = now_ms();
        let (reply, applied) = cmd_set(
            &store,
            &[b"k".to_vec(), b"v".to_vec(), b"PX".to_vec(), b"1000".to_vec()],
        );
        assert!(matches!(reply, Reply::Simple(s) if s == "OK"));
        let (_, _, expires_at_ms) = applied.unwrap();
        let expires_at_ms = expires_at_ms.unwrap();
        assert!(expires_at_ms >= before + 1000 && expires_at_ms <= before + 1100);
    }

    #[test]
    fn keys_rejects_non_literal_glob() {
        let store = Store::new();
        let reply = cmd_keys(&store, &[b"k*".to_vec()]);
        assert!(matches!(reply, Reply::Error(_)));
    }

    #[test]
    fn get_missing_key_is_null_bulk() {
        let store = Store::new();
        let reply = cmd_get(&store, &[b"missing".to_vec()]);
        assert!(matches!(reply, Reply::NullBulk));
    }

    #[test]
    fn xadd_returns_replicated_command_with_resolved_id() {
        let store = Store::new();
        let (reply, replicated) = cmd_xadd(&store, &[b"s".to_vec(), b"5-*".to_vec(), b"f".to_vec(), b"v".to_vec()]);
        assert!(matches!(reply, Reply::Bulk(b) if b == b"5-0"));
        let replicated = replicated.unwrap();
        assert_eq!(replicated[0], b"XADD");
        assert_eq!(replicated[2], b"5-0");
    }

    #[test]
    fn xread_parses_block_and_streams_clause() {
        let args: Vec<Vec<u8>> = vec![
            b"block".to_vec(),
            b"100".to_vec(),
            b"streams".to_vec(),
            b"a".to_vec(),
            b"b".to_vec(),
            b"0".to_vec(),
            b"$".to_vec(),
        ];
        let (block_ms, keys, ids) = parse_xread_args(&args).unwrap();
        assert_eq!(block_ms, Some(100));
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(ids, vec!["0".to_string(), "$".to_string()]);
    }

    #[test]
    fn xread_without_block_sees_existing_entries() {
        let store = Store::new();
        store.xadd("s", "1-1", vec![("f".into(), b"v".to_vec())]).unwrap();
        let reply = cmd_xread(&store, &[b"streams".to_vec(), b"s".to_vec(), b"0".to_vec()]);
        match reply {
            Reply::Array(items) => assert_eq!(items.len(), 1),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn xread_dollar_cursor_resolves_to_current_last_id() {
        let store = Store::new();
        store.xadd("s", "1-1", vec![("f".into(), b"v".to_vec())]).unwrap();
        let cursors = resolve_xread_cursors(&store, &["s".to_string()], &["$".to_string()]).unwrap();
        assert_eq!(cursors[0], StreamId { ms: 1, seq: 1 });
    }

    #[test]
    fn xread_with_no_new_entries_is_null() {
        let store = Store::new();
        store.xadd("s", "1-1", vec![("f".into(), b"v".to_vec())]).unwrap();
        let reply = cmd_xread(&store, &[b"streams".to_vec(), b"s".to_vec(), b"1-1".to_vec()]);
        assert!(matches!(reply, Reply::Null));
    }
}
