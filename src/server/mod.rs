//! HTTP surface

pub mod auth;
pub mod handlers;
pub mod serve;
pub mod state;

pub use serve::serve;
pub use state::ServerState;
