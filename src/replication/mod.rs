pub mod follower;
pub mod offset;
pub mod primary;

pub use offset::OffsetMeter;
pub use primary::{CoordinatorEvent, PrimaryCoordinator};
