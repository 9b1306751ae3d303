//! Rust-specific implementations.
//!
//! This module includes:
//! - kernel abort

pub mod panicking;
