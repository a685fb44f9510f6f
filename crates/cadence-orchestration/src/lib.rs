//! Routing and session orchestration for Cadence.
//!
//! [`ExecutionRouter`] decides which backend serves a call and fails over
//! between them; [`SessionManager`] owns login state and the credential
//! vault; [`PlatformClient`] ties the two together for callers.

pub mod client;
pub mod handle;
pub mod router;
pub mod session;

pub use client::PlatformClient;
pub use handle::{BackendHandle, HandleSnapshot};
pub use router::{ExecuteOptions, ExecutionRouter, RouterStatus};
pub use session::SessionManager;
