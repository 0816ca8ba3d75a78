//! Task build & job run engine.
//!
//! Provisions per-task execution environments ([`builder`]), launches and
//! supervises one child process per run ([`runner`]), tracks live runs for
//! cooperative cancellation ([`registry`]), and brokers the structured
//! control channel between a running job and its host ([`broker`]).
//!
//! Persistence and trigger scheduling live in the calling layer; the
//! engine holds no durable state and reports every terminal transition
//! through tickets that resolve exactly once.
//!
//! Unix-only: the control channel rides on the child's file descriptor 3.

pub mod broker;
pub mod builder;
pub mod config;
pub mod engine;
pub mod registry;
pub mod runner;

pub use broker::ControlHandler;
pub use builder::{BuildOutcome, BuildTicket, TaskBuilder};
pub use config::EngineConfig;
pub use engine::JobEngine;
pub use registry::RunRegistry;
pub use runner::{JobRunner, RunOutcome, RunSpec, RunTicket};
