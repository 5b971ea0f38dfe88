pub mod encode;
pub mod frame;

pub use encode::{encode_array_of_bulk, encode_snapshot_payload, Reply};
pub use frame::{decode_next, Frame};
