//! Testing utilities and mock implementations
//!
//! Mock activity runners and polling helpers for exercising workflows
//! without external brokers or databases.

pub mod mocks;

pub use mocks::*;
