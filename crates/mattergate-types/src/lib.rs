//! Core types for the Mattergate delivery gateway.
//!
//! This crate defines the configuration, message and error types shared by the
//! backend, runtime and kernel crates. It contains no I/O.

pub mod config;
pub mod error;
pub mod message;
