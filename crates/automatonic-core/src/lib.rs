//! Core building blocks of the automatonic command pipeline.
//!
//! This crate provides:
//! - `CommandQueue` - Single-flight FIFO queue with drain-on-failure
//! - `wait_until` - Retry-with-timeout condition polling
//! - `flow` - Coroutine runner for straight-line multi-step flows
//! - `ReadinessGate` - One-shot buffered dispatch
//! - `Script` and `RemoteTarget` - The remote execution contract

pub mod config;
pub mod error;
pub mod events;
pub mod flow;
pub mod gate;
pub mod poller;
pub mod queue;
pub mod script;
pub mod traits;

pub use config::SessionConfig;
pub use error::{CommandError, DrainError, RemoteError};
pub use events::EventHub;
pub use gate::ReadinessGate;
pub use poller::{PollOptions, wait_until};
pub use queue::{CommandFuture, CommandQueue};
pub use script::Script;
pub use traits::{NavigateOptions, RemoteTarget, TargetEvent, TargetFailure};
