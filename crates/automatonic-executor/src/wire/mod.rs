//! Line-delimited JSON wire target.

pub mod protocol;
pub mod types;

pub use protocol::WireTarget;
pub use types::{Frame, Request, RequestFrame, WireError};
