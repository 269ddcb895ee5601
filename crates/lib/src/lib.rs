//! smartbuild-lib: Core types and logic for smart image builds
//!
//! This crate provides the building blocks of the build orchestrator:
//! - `BuildPlan`: the units to build, loaded from a YAML plan file
//! - `Fingerprinter`: deterministic cache keys for a unit's inputs
//! - `Orchestrator`: dependency-ordered, cache-aware builds of a plan
//! - `ExportedEnvironment`: per-unit outputs visible to later units

pub mod cache;
pub mod cancel;
pub mod config;
pub mod consts;
pub mod environment;
pub mod executor;
pub mod expand;
pub mod fingerprint;
pub mod image;
pub mod orchestrator;
pub mod plan;
pub mod registry;
pub mod repository;
pub mod tag;
pub mod util;
pub mod volumes;
