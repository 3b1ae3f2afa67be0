//! Strand: an execution engine for trees of workflow actions
//!
//! Jobs run action trees on cooperatively scheduled threads. Processes and
//! sub-jobs complete asynchronously and are routed back to the action that
//! started them.

pub mod action;
pub mod actions;
pub mod cli;
pub mod condition;
pub mod config;
pub mod correlation;
pub mod documents;
pub mod engine;
pub mod errors;
pub mod evaluator;
pub mod job;
pub mod rendezvous;
pub mod scheduler;
pub mod substrate;
pub mod testcase;
pub mod thread;
pub mod timer;
pub mod timestamp;
pub mod types;

// Re-export main types
pub use config::Config;
pub use engine::{start_local, Engine, EngineBuilder};
pub use job::{Job, JobDefinition, JobOutcome};
pub use types::*;
