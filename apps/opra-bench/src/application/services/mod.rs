//! Application Services
//!
//! The hot loops and the machinery they share.
//!
//! - `PublishLoop`: drives a `PublishStrategy` across message indices
//! - `SubscribeLoop`: polls, reassembles, decodes and dispatches
//! - `FragmentAssembler`: per-session reassembly of fragmented messages
//! - `IdleStrategy`: bounded spin/yield steps between attempts

pub mod assembler;
pub mod clock;
pub mod idle;
pub mod publisher;
pub mod strategy;
pub mod subscriber;
pub mod throughput;

#[cfg(test)]
pub(crate) mod testing;

pub use assembler::FragmentAssembler;
pub use idle::{BackoffIdle, IdleStrategy};
pub use publisher::{PublishConfig, PublishError, PublishLoop, PublishReport};
pub use strategy::{AttemptError, ExclusiveClaim, PublishStrategy, SharedOffer};
pub use subscriber::{SubscribeConfig, SubscribeError, SubscribeLoop, SubscribeReport};
pub use throughput::Throughput;
