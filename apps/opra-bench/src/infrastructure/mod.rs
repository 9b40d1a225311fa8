//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete transports behind the application ports, plus the ambient
//! concerns of the binaries.

/// In-process and UDP transports, channel URI parsing.
pub mod transport;

/// Command-line and environment configuration.
pub mod config;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Periodic throughput sampling.
pub mod rate;

/// JSON record output.
pub mod printer;

/// Logging and OpenTelemetry integration.
pub mod telemetry;

/// Signal-driven cancellation.
pub mod shutdown;
