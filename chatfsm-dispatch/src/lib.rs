//! # chatfsm-dispatch
//!
//! Concurrent delivery of chat messages to conversation state machines.
//!
//! This crate provides:
//! - A dispatcher that serializes messages per conversation key
//! - Backpressure for the feeding side
//! - A supervised pool of blocking workers
//! - YAML/environment configuration

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod stats;
pub mod supervisor;
pub mod worker;

pub use config::{Config, ConfigError, DispatchConfig, EngineLimits, WorkerConfig};
pub use dispatcher::{Backpressure, Dispatcher, Envelope};
pub use error::DispatchError;
pub use stats::{DispatchStats, StatsSnapshot};
pub use supervisor::{FailurePolicy, Supervisor};
pub use worker::Worker;
