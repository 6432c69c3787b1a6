//! QoS scheduling
//!
//! Orders already-admitted work across priority tiers. The scheduler never
//! touches window state.

mod fair_queue;

pub use fair_queue::{
    QosScheduler, Scheduled, SchedulerConfig, SchedulerError, SchedulerStats, TierWeights,
};
