//! Window governance
//!
//! Admission control for streams. Window fields are only ever written inside
//! this module; other components read [`WindowSnapshot`](crate::protocol::WindowSnapshot)s.

mod aimd;
mod governor;

pub use aimd::{AimdCeiling, AimdConfig};
pub use governor::{
    Dimension, GovernorConfig, GovernorError, SendEstimate, SendTicket, WindowGovernor,
    WindowUpdate,
};
