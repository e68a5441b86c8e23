//! Shared utilities.
//!
//! Hashing, keyed locking and test helpers used across the engine.

pub mod hash;
pub mod keyed_mutex;

#[cfg(test)]
pub mod testutil;
