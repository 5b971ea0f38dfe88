//! Stream value type: ordered entries keyed by a `(ms, seq)` id, and the
//! single-waiter-per-key registry blocking `XREAD` subscribes to.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StreamId {
    pub ms: i64,
    pub seq: i64,
}

impl StreamId {
    pub const ZERO: StreamId = StreamId { ms: 0, seq: 0 };
    pub const MAX: StreamId = StreamId {
        ms: i64::MAX,
        seq: i64::MAX,
    };
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: StreamId,
    pub fields: Vec<(String, Vec<u8>)>,
}

#[derive(Debug, Clone, Default)]
pub struct StreamValue {
    pub entries: Vec<StreamEntry>,
    pub last_id: StreamId,
}

/// How the caller asked for the new entry's id to be picked.
pub enum IdSpec {
    /// `*`: both ms and seq auto-generated.
    Auto,
    /// `<ms>-*`: ms fixed, seq auto-generated.
    PartialAuto(i64),
    /// `<ms>-<seq>`: fully explicit.
    Explicit(i64, i64),
}

pub fn parse_id_spec(spec: &str) -> Result<IdSpec, String> {
    if spec == "*" {
        return Ok(IdSpec::Auto);
    }
    if let Some(ms_text) = spec.strip_suffix("-*") {
        let ms = ms_text
            .parse::<i64>()
            .map_err(|_| "ERR Invalid stream ID specified as stream command argument".to_string())?;
        return Ok(IdSpec::PartialAuto(ms));
    }
    let mut parts = spec.splitn(2, '-');
    let ms = parts
        .next()
        .unwrap()
        .parse::<i64>()
        .map_err(|_| "ERR Invalid stream ID specified as stream command argument".to_string())?;
    let seq = parts
        .next()
        .ok_or_else(|| "ERR Invalid stream ID specified as stream command argument".to_string())?
        .parse::<i64>()
        .map_err(|_| "ERR Invalid stream ID specified as stream command argument".to_string())?;
    Ok(IdSpec::Explicit(ms, seq))
}

impl StreamValue {
    /// Resolves an [`IdSpec`] against this stream's current state, enforcing
    /// strict monotonicity. `now_ms` feeds the auto-generation clock.
    pub fn resolve_id(&self, spec: IdSpec, now_ms: i64) -> Result<StreamId, String> {
        let candidate = match spec {
            IdSpec::Auto => {
                if self.last_id.ms == now_ms {
                    StreamId {
                        ms: now_ms,
                        seq: self.last_id.seq + 1,
                    }
                } else if now_ms > self.last_id.ms {
                    StreamId { ms: now_ms, seq: 0 }
                } else {
                    StreamId {
                        ms: self.last_id.ms,
                        seq: self.last_id.seq + 1,
                    }
                }
            }
            IdSpec::PartialAuto(ms) => {
                if self.entries.is_empty() && ms == 0 {
                    StreamId { ms: 0, seq: 1 }
                } else if ms == self.last_id.ms {
                    StreamId {
                        ms,
                        seq: self.last_id.seq + 1,
                    }
                } else {
                    StreamId { ms, seq: 0 }
                }
            }
            IdSpec::Explicit(ms, seq) => {
                let candidate = StreamId { ms, seq };
                if candidate == StreamId::ZERO {
                    return Err("ERR The ID specified in XADD must be greater than 0-0".to_string());
                }
                if candidate <= self.last_id {
                    return Err(
                        "ERR The ID specified in XADD is equal or smaller than the target stream top item"
                            .to_string(),
                    );
                }
                return Ok(candidate);
            }
        };
        Ok(candidate)
    }
}

/// Bound used by `XRANGE`: `-`/`+` mean the smallest/largest possible id,
/// anything else is a concrete id (a bare ms is treated as `ms-0`).
pub enum RangeBound {
    Min,
    Max,
    Id(StreamId),
}

impl RangeBound {
    pub fn resolve(&self) -> StreamId {
        match self {
            RangeBound::Min => StreamId::ZERO,
            RangeBound::Max => StreamId::MAX,
            RangeBound::Id(id) => *id,
        }
    }
}

/// Parses an `XREAD` cursor id: `<ms>-<seq>` or a bare `<ms>` (meaning
/// `<ms>-0`). Unlike a range bound, `-`/`+` are not accepted here.
pub fn parse_cursor_id(text: &str) -> Result<StreamId, String> {
    if let Some((ms_text, seq_text)) = text.split_once('-') {
        let ms = ms_text
            .parse::<i64>()
            .map_err(|_| "ERR Invalid stream ID specified as stream command argument".to_string())?;
        let seq = seq_text
            .parse::<i64>()
            .map_err(|_| "ERR Invalid stream ID specified as stream command argument".to_string())?;
        Ok(StreamId { ms, seq })
    } else {
        let ms = text
            .parse::<i64>()
            .map_err(|_| "ERR Invalid stream ID specified as stream command argument".to_string())?;
        Ok(StreamId { ms, seq: 0 })
    }
}

pub fn parse_range_bound(text: &str) -> Result<RangeBound, String> {
    match text {
        "-" => Ok(RangeBound::Min),
        "+" => Ok(RangeBound::Max),
        _ => {
            if let Some((ms_text, seq_text)) = text.split_once('-') {
                let ms = ms_text
                    .parse::<i64>()
                    .map_err(|_| "ERR Invalid stream ID specified as stream command argument".to_string())?;
                let seq = seq_text
                    .parse::<i64>()
                    .map_err(|_| "ERR Invalid stream ID specified as stream command argument".to_string())?;
                Ok(RangeBound::Id(StreamId { ms, seq }))
            } else {
                let ms = text
                    .parse::<i64>()
                    .map_err(|_| "ERR Invalid stream ID specified as stream command argument".to_string())?;
                Ok(RangeBound::Id(StreamId { ms, seq: 0 }))
            }
        }
    }
}

/// One `oneshot` slot per key. Registering a new waiter for a key that
/// already has one simply replaces it — only the most recent subscriber is
/// woken, matching a single-reader-per-stream blocking model.
#[derive(Default)]
pub struct StreamWaiters {
    inner: Mutex<HashMap<String, oneshot::Sender<String>>>,
}

impl StreamWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: &str) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().unwrap().insert(key.to_string(), tx);
        rx
    }

    pub fn unregister(&self, key: &str) {
        self.inner.lock().unwrap().remove(key);
    }

    pub fn publish(&self, key: &str, payload: String) {
        if let Some(tx) = self.inner.lock().unwrap().remove(key) {
            let _ = tx.send(payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_id_uses_wall_clock_when_empty() {
        let value = StreamValue::default();
        let id = value.resolve_id(IdSpec::Auto, 1000).unwrap();
        assert_eq!(id, StreamId { ms: 1000, seq: 0 });
    }

    #[test]
    fn partial_auto_bumps_seq_within_same_ms() {
        let mut value = StreamValue::default();
        value.last_id = StreamId { ms: 5, seq: 2 };
        let id = value.resolve_id(IdSpec::PartialAuto(5), 9999).unwrap();
        assert_eq!(id, StreamId { ms: 5, seq: 3 });
    }

    #[test]
    fn explicit_zero_zero_is_rejected() {
        let value = StreamValue::default();
        let err = value.resolve_id(IdSpec::Explicit(0, 0), 1).unwrap_err();
        assert!(err.contains("greater than 0-0"));
    }

    #[test]
    fn explicit_must_be_strictly_increasing() {
        let mut value = StreamValue::default();
        value.last_id = StreamId { ms: 5, seq: 5 };
        let err = value.resolve_id(IdSpec::Explicit(5, 5), 1).unwrap_err();
        assert!(err.contains("equal or smaller"));
        let err = value.resolve_id(IdSpec::Explicit(5, 4), 1).unwrap_err();
        assert!(err.contains("equal or smaller"));
    }

    #[test]
    fn cursor_id_accepts_bare_ms() {
        assert_eq!(parse_cursor_id("5").unwrap(), StreamId { ms: 5, seq: 0 });
        assert_eq!(parse_cursor_id("5-3").unwrap(), StreamId { ms: 5, seq: 3 });
        assert!(parse_cursor_id("-").is_err());
    }

    #[test]
    fn range_bounds_parse() {
        assert_eq!(parse_range_bound("-").unwrap().resolve(), StreamId::ZERO);
        assert_eq!(parse_range_bound("+").unwrap().resolve(), StreamId::MAX);
        assert_eq!(
            parse_range_bound("5-3").unwrap().resolve(),
            StreamId { ms: 5, seq: 3 }
        );
        assert_eq!(
            parse_range_bound("5").unwrap().resolve(),
            StreamId { ms: 5, seq: 0 }
        );
    }
}
