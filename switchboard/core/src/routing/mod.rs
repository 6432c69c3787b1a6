//! Adapter Routing
//!
//! Live routing table, declarative policy and bandit-driven selection.
//!
//! # Architecture
//!
//! ```text
//! +------------------+
//! |    PolicySet     |  <-- first matching rule: eligible set, budget, strategy
//! +--------+---------+
//!          |
//!          v
//! +------------------+
//! |   RoutingTable   |  <-- capabilities + live health, drops unhealthy rows
//! +--------+---------+
//!          |
//!          v
//! +------------------+
//! |      Bandit      |  <-- UCB1 arms blended with a linear contextual model
//! +--------+---------+
//!          |
//!          v
//!   Plan: primary / challenger / fallback
//! ```
//!
//! # Design Principles
//!
//! 1. **Fail Closed**: no healthy eligible adapter means `NoEligibleAdapter`
//! 2. **Learn Online**: every outcome updates the table row and the bandit
//! 3. **Concurrent Reads**: the table sits behind an async `RwLock`

pub mod bandit;
pub mod config;
pub mod metrics;
pub mod policy;
pub mod selector;
pub mod table;

pub use bandit::{Bandit, Features};
pub use config::{HealthConfig, RiskLevel, SelectionConfig, TaskClass};
pub use policy::{PolicyRule, PolicySet, RouteQuery, RoutingError};
pub use selector::{Feedback, Plan, PlanEntry, PlanRole, Selector};
pub use table::{AdapterEntry, CallOutcome, RoutingTable};
