//! Core runtime infrastructure.
//!
//! - [`config`] - Configuration parsing and validation
//! - [`runtime`] - Component lifecycle orchestration
//! - [`error`] - Store and operation error types

pub mod config;
pub mod error;
pub mod runtime;
