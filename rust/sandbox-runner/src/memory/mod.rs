//! Guest memory measurement and balloon-driven rebalancing.

pub mod controller;
pub mod stats;

pub use controller::{
    compute_target, AdjustmentDirection, BalloonCycleReport, BalloonTarget, MemoryAdjustment,
    MemoryController,
};
pub use stats::{collect_running_stats, VmMemoryStats};
