//! rilproxy - Unix socket relay between a modem control daemon and SIM clients.
//!
//! The relay sits between one upstream peer (the modem control process) and
//! one or two client processes, re-framing a length-prefixed binary
//! protocol, fanning upstream traffic out to every client, buffering
//! records for whichever side is not connected yet and reconnecting to
//! upstream when it goes away.
//!
//! # Architecture
//!
//! - **Reactor** - single thread dispatching readiness callbacks
//! - **Relay** - accept/read callbacks, fan-out, caches, teardown
//! - **Supervisor** - background thread that (re)connects upstream
//! - **Dedup** - optional arbitration of the dual-SIM activation request
//!
//! # Modules
//!
//! - [`framing`] - record codec and stream cursor
//! - [`cache`] - bounded replay buffer
//! - [`reactor`] - poll-based dispatcher
//! - [`relay`] - relay engine, supervisor, dedup and telemetry
//! - [`config`] - configuration loading

pub mod cache;
pub mod config;
pub mod error;
pub mod framing;
pub mod reactor;
pub mod relay;
pub mod socket;

// Re-export commonly used types
pub use config::{Config, SocketFamily, UpstreamMode};
pub use error::{RelayError, Result};
pub use reactor::Reactor;
pub use relay::dedup::DedupPolicy;
pub use relay::endpoint::{ClientSlot, Side};
pub use relay::telemetry::TelemetrySnapshot;
pub use relay::Relay;
