//! Action implementations
//!
//! Each action comes as an immutable definition, shared by every execution,
//! and an instance created per execution that carries the mutable state.

pub mod breakpoint;
pub mod function;
pub mod import;
pub mod job;
pub mod process;
pub mod sequence;
pub mod testcase;
