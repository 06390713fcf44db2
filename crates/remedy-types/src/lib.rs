//! Shared domain types for the remedy remediation engine.
//!
//! This crate contains the plan model produced by the upstream advisor, the
//! execution records the engine emits, and the engine configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod event;
pub mod execution;
pub mod plan;
