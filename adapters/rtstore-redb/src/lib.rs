//! `redb`-backed implementation of the `Store` interface: the embedded
//! key-value engine binding.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod store;

pub use store::RedbStore;
