//! Blind fan-out relay: every frame a connection sends is forwarded, as-is,
//! to every other live connection.

pub mod config;
pub mod registry;
pub mod server;

pub use config::{Cli, RelayConfig};
pub use registry::{BroadcastReport, Registration, Registry};
pub use server::{router, serve, RelayState, StatsResponse};
