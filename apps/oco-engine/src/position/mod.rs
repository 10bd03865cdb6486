//! Position shadow-state tracking.

mod tracker;

pub use tracker::{BracketFill, OpenPositionRequest, PositionTracker, TrackerStats};
