//! The serialized topic registry: the single-writer pub/sub core that every
//! mutation in the store publishes through.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod registry;

pub use registry::{Registry, RegenFn, Subscription};
