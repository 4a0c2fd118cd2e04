// src/core/errors.rs

//! Defines the primary error type for the proxy.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the proxy.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("invalid TDS frame: {0}")]
    InvalidFrame(String),

    #[error("no buckets configured")]
    NoBucketsConfigured,

    #[error("shared store transport error: {0}")]
    StoreTransport(String),

    #[error("dial to backend for bucket '{0}' failed: {1}")]
    BackendDialFailed(String, String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for ProxyError {
    fn from(e: std::io::Error) -> Self {
        ProxyError::Io(Arc::new(e))
    }
}

impl From<redis::RedisError> for ProxyError {
    fn from(e: redis::RedisError) -> Self {
        ProxyError::StoreTransport(e.to_string())
    }
}

/// Specialized `Result` alias used throughout the proxy.
pub type ProxyResult<T> = Result<T, ProxyError>;
