//! Application Layer - Use cases and port definitions.
//!
//! The publish and subscribe loops, the publication strategies and the
//! fragment assembler live here, written against the transport ports so
//! they run unchanged over any transport adapter.

/// Port interfaces for transports and sinks.
pub mod ports;

/// Publish/subscribe services.
pub mod services;
