//! Remote target implementations bundled with the session crate.

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "memory")]
pub use memory::{MemoryTarget, Page};
