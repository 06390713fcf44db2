//! Remediation workflow engine for Kubernetes incidents.
//!
//! Takes a `RemediationPlan` from `remedy-types`, schedules its primary and
//! secondary actions against an [`workflow::ActionExecutor`], monitors the
//! result through a [`workflow::Probe`], and rolls back when a trigger fires.
//! Cluster access lives behind those two traits; this crate performs no I/O
//! of its own apart from reading its config file.

pub mod config;
pub mod event;
pub mod workflow;
