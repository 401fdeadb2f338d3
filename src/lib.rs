//! Beanpoll - management-bean polling agent
//!
//! This crate provides a long-running agent that periodically reads
//! management metrics from remote managed processes and forwards the numeric
//! samples to configured sinks. Configuration is declarative, loaded from a
//! directory (or single file) of JSON/YAML documents that is watched and
//! hot-reloaded on change.

pub mod agent;
pub mod client;
pub mod config;
pub mod error;
pub mod executors;
pub mod jobs;
pub mod model;
pub mod output;
pub mod scheduler;
pub mod watcher;
