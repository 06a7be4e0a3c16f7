//! Core domain types for the relay.

pub mod ids;
pub mod task;

pub use ids::{DestinationId, ITEM_ID_LEN, ItemId, ItemIdGenerator};
pub use task::{Task, TaskTarget};
