//! Result sink for remediation workflows.
//!
//! Provides an `EventBus` that distributes `RemediationEvent` records to audit
//! and notification subscribers via a `tokio::sync::broadcast` channel.

pub mod bus;

pub use bus::EventBus;
