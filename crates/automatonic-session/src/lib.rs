//! Ordered command sessions over a remote execution target.
//!
//! Provides:
//! - `Session` - the public operations, each queued in order
//! - `SessionManager` - registry of live sessions
//! - `MemoryTarget` - an in-memory simulated target (feature `memory`)

pub mod manager;
pub mod session;
pub mod target;

pub use manager::{ManagerError, SessionManager};
pub use session::{
    Chained, ClickOptions, Session, SessionId, TextPattern, TypeOptions, WaitFor,
};
#[cfg(feature = "memory")]
pub use target::{MemoryTarget, Page};
