// src/core/mod.rs

//! Crate-wide error types shared by every other module.

pub mod errors;

pub use errors::{ProxyError, ProxyResult};
