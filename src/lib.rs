//! n8s - configuration store for a multi-port nginx reverse-proxy router
//!
//! This library keeps the router's persisted state and the proxy's
//! configuration in step:
//! - Persists listening ports, routes and installed-component flags in a
//!   line-oriented state file that is parsed, never executed
//! - Renders one nginx server block per listening port, each including the
//!   route fragments registered for that port
//! - Validates every change with the proxy's own syntax check before it is
//!   persisted, rolling back the touched files on rejection
//! - Reconciles stored installed flags with the live system

pub mod config;
pub mod docker;
pub mod error;
pub mod exec;
pub mod lock;
pub mod nginx;
pub mod probe;
pub mod publicip;
pub mod route;
pub mod state;
pub mod store;

pub use error::{ErrorKind, Result, RouterError};
pub use state::{Component, Route, RouteKey, RouterConfig};
pub use store::{RouteView, RouterStore};

/// Package name from Cargo.toml
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Package version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
