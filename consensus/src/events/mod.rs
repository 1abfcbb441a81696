//! Run activity events.
//!
//! User-facing progress for a pipeline run, kept per run id in memory:
//!
//! 1. **Event Types** (`types.rs`): [`ActivityEvent`] and its phases.
//! 2. **Activity Bus** (`bus.rs`): bounded per-run buffers, replay via
//!    snapshot, live subscription, idle eviction.
//!
//! ```text
//! ┌──────────────┐  append  ┌──────────────┐ snapshot ┌──────────────┐
//! │ Orchestrator │─────────▶│ ActivityBus  │─────────▶│   Observer   │
//! └──────────────┘          │  (per run)   │──live───▶│ (SSE, CLI)   │
//!                           └──────────────┘          └──────────────┘
//! ```
//!
//! The bus is optional instrumentation. Every operation on an empty run id
//! is a no-op, and the orchestrator runs the same with or without one.

pub mod bus;
pub mod types;

pub use bus::{
    subscribe_channel_with_snapshot, ActivityBus, ActivityBusConfig, ActivityBusError,
    ActivityBusResult, SharedActivityBus, Subscription,
};
pub use types::{ActivityEvent, ActivityPhase};
