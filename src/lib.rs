//! Portbridge Library
//!
//! A transparent TCP port-forwarding relay. A [`Device`] listens on a bind
//! address and opens a matching connection to a fixed target for every
//! admitted client; each such pair of connections is driven by a [`Relay`]
//! that pumps bytes in both directions until either side goes away.
//!
//! Behavior is extended through three hooks installed before start:
//! admission control, in-flight data transformation, and close
//! notification.

pub mod admission;
pub mod config;
pub mod device;
pub mod hooks;
pub mod metrics;
pub mod relay;
pub mod shutdown;

pub use admission::AdmissionPolicy;
pub use config::Config;
pub use device::Device;
pub use hooks::{AdmissionHook, CloseHook, DataHook, Direction, Status};
pub use relay::Relay;
pub use shutdown::ShutdownCoordinator;

/// Common error type for the relay
pub type Result<T> = anyhow::Result<T>;
