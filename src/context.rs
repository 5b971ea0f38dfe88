//! Shared, explicitly-constructed dependency bag handed to every connection
//! task — an `Arc`-cloned struct rather than a stringly-keyed context map,
//! so every field a handler reaches for is checked at compile time.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::{Role, ServerConfig};
use crate::replication::offset::OffsetMeter;
use crate::replication::primary::CoordinatorEvent;
use crate::store::Store;

pub struct ServerContext {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub offset: Arc<OffsetMeter>,
    pub replid: String,
    /// Set once at startup. `Some` only when running as primary, after the
    /// coordinator task has been spawned.
    pub primary_tx: Option<mpsc::Sender<CoordinatorEvent>>,
}

impl ServerContext {
    pub fn new(config: ServerConfig, store: Arc<Store>, offset: Arc<OffsetMeter>) -> Self {
        Self {
            config,
            store,
            offset,
            replid: generate_replid(),
            primary_tx: None,
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self.config.role, Role::Primary)
    }
}

/// 40 hex characters, matching the shape of a real replication id. Derived
/// from the process start time and pid rather than pulled from a `rand`
/// dependency the rest of the stack has no other use for.
pub fn generate_replid() -> String {
    let mut seed = DefaultHasher::new();
    std::time::SystemTime::now().hash(&mut seed);
    std::process::id().hash(&mut seed);
    let mut state = seed.finish();
    let mut out = String::with_capacity(40);
    while out.len() < 40 {
        let mut h = DefaultHasher::new();
        state.hash(&mut h);
        state = h.finish();
        out.push_str(&format!("{state:016x}"));
    }
    out.truncate(40);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replid_is_forty_hex_chars() {
        let id = generate_replid();
        assert_eq!(id.len(), 40);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
