//! Push channel infrastructure.
//!
//! This module owns the long-lived socket to the vehicle cloud and everything that keeps
//! it healthy.
//!
//! # Architecture
//!
//! - [`ConnectionManager`]: Socket owner with watchdogs, keepalive and reconnection
//! - [`ReconnectPolicy`]: Quadratic backoff with a rate-limit floor
//! - [`Watchdog`]: Restartable inactivity alarm polled by the connection task
//! - [`FrameCodec`]: Trait for decoding push frames and encoding acknowledgments
//! - [`TelemetrySink`]: Trait for receiving telemetry updates
//!
//! # Example
//!
//! ```ignore
//! let manager = ConnectionManager::new(endpoint, Config::default(), tokens, ProtoCodec::default())?;
//! manager.connect(Arc::new(telemetry_tx));
//! ```

pub mod backoff;
pub mod config;
pub mod connection;
pub mod error;
pub mod traits;
pub mod watchdog;

pub use backoff::ReconnectPolicy;
pub use connection::{ConnectionManager, ConnectionState};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use traits::*;
pub use watchdog::Watchdog;
