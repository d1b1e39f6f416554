//! sshgate-core: backend abstraction and connection metadata for the SSH gateway.
//!
//! Provides the staged metadata records carried from connection accept to
//! channel open, the `host:port` remote address codec, the [`Session`]
//! contract every execution backend implements, the [`Registry`] of named
//! backends, and the metrics/GeoIP contracts the gateway reports through.

pub mod backend;
pub mod error;
pub mod geoip;
pub mod metadata;
pub mod metrics;
pub mod signal;

// Re-export commonly used items at crate root.
pub use backend::{Backend, Registry, Session, ShellOrSubsystem, EXIT_CODE_UNAVAILABLE};
pub use error::{GateError, GateResult};
pub use geoip::{DummyLookup, GeoIpLookup, UNKNOWN_COUNTRY};
pub use metadata::{
    AuthMethod, BinaryValue, ChannelMetadata, ConnectionAuthPendingMetadata,
    ConnectionAuthenticatedMetadata, ConnectionMetadata, RemoteAddress, Value,
};
pub use metrics::{MetricLabel, MetricType, MetricsCollector};
pub use signal::Signal;
