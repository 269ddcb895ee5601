//! Shared utilities.
//!
//! Hashing used by fingerprints, plus in-memory collaborators for tests.

pub mod hash;

#[cfg(test)]
pub mod testutil;
