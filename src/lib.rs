pub mod config;
pub mod handlers;
pub mod healthcheck;
pub mod presence;
pub mod security;
pub mod state;
pub mod store;

/// Numeric account id issued by the site's auth layer. 0 means anonymous.
pub type UserId = u64;
