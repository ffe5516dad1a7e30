//! State Management Module
//!
//! Handles persistent checkpoint tracking for follower shards.

mod tracker;
mod checkpoint;

pub use tracker::CheckpointStore;
pub use checkpoint::{Checkpoint, CheckpointTracker};
