//! Shared domain types for Cadence: the backend contract both execution
//! backends implement, the authentication contract, configuration and the
//! error taxonomy every crate reports through.

pub mod backend;
pub mod config;
pub mod error;
pub mod session;

pub use backend::{
    Backend, BackendIdentity, HealthCheckResult, OperationResult, PublishOptions, PublishOutcome,
    Resource, ResourceStatus, Show, Visibility,
};
pub use config::{Config, RouterConfig, SelectionMode};
pub use error::{CadenceError, ErrorKind, Result};
pub use session::{
    AuthResult, Authenticator, LoginMethod, LoginMethodKind, LoginOptions, LoginOutcome,
    SessionRecord, UserIdentity,
};
