//! Adapter Integration
//!
//! Abstracted access to language-model backends through a common trait,
//! plus the registry the engine dispatches through.
//!
//! # Available Adapters
//!
//! - **Scripted**: canned loopback responses (tests, daemon loopback mode)
//!
//! # Usage
//!
//! ```ignore
//! use switchboard_core::adapter::{Adapter, AdapterRequest, ScriptedAdapter};
//!
//! let rx = adapter.stream(&AdapterRequest::new(key, "hello")).await?;
//! ```

mod scripted;
mod traits;

pub use scripted::{ScriptedAdapter, ScriptedAdapterConfig, ScriptedBehavior};
pub use traits::{
    approx_tokens, Adapter, AdapterCapabilities, AdapterChunk, AdapterRegistry, AdapterRequest,
    CostEstimate, HealthReport,
};
