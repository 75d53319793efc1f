//! Testing utilities and mock implementations
//!
//! Scripted broker clients and instrumented handlers for exercising the
//! receive loop without a real broker.

pub mod mocks;

pub use mocks::*;
