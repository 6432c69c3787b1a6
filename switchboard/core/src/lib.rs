//! Switchboard Core - Routing and Flow Control for Language-Model Adapters
//!
//! Clients open streams inside sessions over a binary framed protocol,
//! send requests, and receive one reconciled answer per stream. Behind the
//! streams the switchboard picks adapters, fans requests out, bounds what
//! every stream may consume, and escalates when the answers disagree.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Clients                                  │
//! │        binary frames over a byte stream (Unix socket)            │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │ FrameCodec / FrameDecoder
//! ┌───────────────────────────────┼──────────────────────────────────┐
//! │                         SWITCHBOARD                              │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────┐  │
//! │  │ SessionManager │─▶│  QosScheduler  │─▶│     Selector       │  │
//! │  │ (stream state, │  │ (gold/silver/  │  │ (policy, health,   │  │
//! │  │  reassembly)   │  │  bronze WFQ)   │  │  contextual UCB)   │  │
//! │  └───────┬────────┘  └────────────────┘  └─────────┬──────────┘  │
//! │          │                                         │ fan-out     │
//! │  ┌───────┴────────┐                      ┌─────────┴──────────┐  │
//! │  │ WindowGovernor │◀──── admission ──────│  Adapter calls     │  │
//! │  │ (AIMD windows) │                      └─────────┬──────────┘  │
//! │  └────────────────┘                      ┌─────────┴──────────┐  │
//! │                                          │  ConsensusEngine   │  │
//! │                                          │ (reconcile, escal.)│  │
//! │                                          └────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Switchboard`]: The engine that wires every component together
//! - [`Frame`]: One protocol frame; [`FrameCodec`] turns it into bytes
//! - [`SessionManager`]: Stream state machine, sequencing and reassembly
//! - [`WindowGovernor`]: Per-stream parallelism, token and USD windows
//! - [`QosScheduler`]: Weighted-fair dispatch across priority tiers
//! - [`Selector`]: Policy-constrained contextual-bandit adapter selection
//! - [`ConsensusEngine`]: Reconciliation strategies and escalation triggers
//! - [`Adapter`]: The trait every language-model backend implements
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use switchboard_core::{load_config, LogTelemetrySink, Switchboard};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config()?;
//!     let (tx, mut rx) = mpsc::unbounded_channel();
//!     let engine = Switchboard::from_config(&config, Arc::new(LogTelemetrySink), tx).await;
//!     engine.start();
//!
//!     // Feed decoded frames with engine.handle_frame(frame).await
//!     while let Some(out) = rx.recv().await {
//!         // Encode out.frame and write it to the connection of out.session
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`protocol`]: Frame model, wire codec, signatures, error codes
//! - [`session`]: Sessions, streams, sequencing, fragment reassembly
//! - [`window`]: Window governor with AIMD ceilings
//! - [`scheduler`]: QoS weighted-fair scheduler with load shedding
//! - [`adapter`]: Adapter trait, registry and the scripted adapter
//! - [`routing`]: Policy rules, routing table, bandit selection, metrics
//! - [`consensus`]: Agreement metrics, reconciliation, escalation
//! - [`telemetry`]: Per-stream telemetry records and sinks
//! - [`engine`]: The [`Switchboard`] engine
//! - [`config`]: TOML configuration with environment overrides

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod adapter;
pub mod config;
pub mod consensus;
pub mod engine;
pub mod protocol;
pub mod routing;
pub mod scheduler;
pub mod session;
pub mod telemetry;
pub mod window;

// Engine exports
pub use engine::{EngineConfig, EngineError, Outbound, Switchboard};

// Protocol exports
pub use protocol::{
    AdapterId, ControlMessage, ErrorCode, ErrorReport, Frame, FrameCodec, FrameDecoder,
    FrameFlags, FrameMetadata, Payload, PriorityTier, ProtocolError, ResultEnvelope, SessionId,
    StreamId, StreamKey, WindowLimits, WindowSnapshot, MAX_FRAGMENTS_PER_MESSAGE, MAX_FRAME_SIZE,
    PROTOCOL_VERSION,
};

// Session exports
pub use session::{SessionConfig, SessionEvent, SessionManager, StreamState};

// Window exports
pub use window::{AimdConfig, GovernorConfig, GovernorError, SendEstimate, WindowGovernor};

// Scheduler exports
pub use scheduler::{QosScheduler, SchedulerConfig};

// Adapter exports
pub use adapter::{
    Adapter, AdapterCapabilities, AdapterChunk, AdapterRegistry, AdapterRequest, CostEstimate,
    HealthReport, ScriptedAdapter, ScriptedBehavior,
};

// Routing exports
pub use routing::metrics::EngineMetrics;
pub use routing::{Plan, PlanRole, PolicyRule, RiskLevel, RoutingTable, Selector, TaskClass};

// Consensus exports
pub use consensus::{ConsensusEngine, ConsensusResult, Contribution, EscalationConfig, Strategy};

// Telemetry exports
pub use telemetry::{ChannelTelemetrySink, LogTelemetrySink, TelemetryRecord, TelemetrySink};

// Config exports
pub use config::{
    default_config_path, default_socket_path, load_config, load_config_from_path, ConfigError,
    ConfigOverrides, ConfigSource, SwitchboardConfig,
};
