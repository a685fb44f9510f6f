//! Execution backends for Cadence.
//!
//! [`ApiBackend`] talks JSON to the platform directly. [`BrowserBackend`]
//! drives a real browser through a [`BrowserDriver`] and is the backend
//! that performs logins. Both implement [`cadence_core::Backend`].

pub mod api;
pub mod browser;
pub mod error;
pub mod factory;
pub mod mock;
pub mod state;
pub mod webdriver;
mod wire;

pub use api::ApiBackend;
pub use browser::{BrowserBackend, BrowserDriver};
pub use error::BackendError;
pub use factory::{BackendFactory, BackendSet};
pub use mock::{MockAuthenticator, MockBackend, ScriptedLogin};
pub use state::{Cookie, SessionState};
pub use webdriver::WebDriverClient;
