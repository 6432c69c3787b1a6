//! Sessions and streams
//!
//! The session manager owns stream lifecycle, message sequencing and
//! fragment reassembly. Window accounting is delegated to the governor.

mod manager;
mod reassembly;
mod stream;

pub use manager::{SessionConfig, SessionError, SessionEvent, SessionManager};
pub use reassembly::{fragment_message, FragmentOutcome, ReassemblyBuffer};
pub use stream::{StreamInfo, StreamState, StreamUsage};
