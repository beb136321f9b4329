//! Remote execution for automatonic sessions.
//!
//! Provides:
//! - `RemoteExecutor` - submit scripts and normalize target failures
//! - `CallBuilder` - build remote function calls
//! - `WireTarget` - a target reached over line-delimited JSON

pub mod call;
pub mod remote;
pub mod wire;

pub use call::{CallBuildError, CallBuilder};
pub use remote::{RemoteExecutor, normalize};
pub use wire::WireTarget;
