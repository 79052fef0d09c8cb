//! mender-gateway: HTTP API over the debug service
//!
//! Exposes single runs, debug-once, full auto-retry sessions and paced
//! session stepping as JSON routes.

pub mod protocol;
pub mod server;

pub use server::GatewayServer;
