pub mod cache;
pub mod catalog;
pub mod client;
pub mod controller;
pub mod convert;

/// Default user agent for `kubecatalog` - automatically uses the package version
///
/// All cluster clients are created with `client::new(Some(USER_AGENT))`.
///
/// The client module provides two modes:
/// - `client::new()` - Lenient mode (default): logs warnings for invalid headers but continues
/// - `client::new_strict()` - Strict mode: fails on invalid headers
///
/// User-agent can be overridden via the `KUBECATALOG_USER_AGENT` environment variable.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Environment variable overriding [`USER_AGENT`]
pub const USER_AGENT_ENV: &str = "KUBECATALOG_USER_AGENT";
