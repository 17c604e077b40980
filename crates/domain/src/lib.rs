//! Shared types for the SessionGrid crates: the error type, structured
//! trace events and the configuration model.

pub mod config;
pub mod error;
pub mod trace;
