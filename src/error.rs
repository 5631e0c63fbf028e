//! Error types for redbed.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while parsing the `redis.conf` dialect.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfError {
    #[error("No arguments found in line: '{line}'")]
    NoArguments { line: String },

    #[error("Unbalanced quotes in arguments: '{arguments}'")]
    UnbalancedQuotes { arguments: String },

    #[error(
        "Keyword '{keyword}' contains illegal characters. Only alphanumeric characters, hyphens and underscores are allowed"
    )]
    IllegalKeyword { keyword: String },

    #[error("Keyword must not be blank")]
    BlankKeyword,

    #[error("At least one argument is required")]
    NoDirectiveArguments,
}

/// Main error type for redbed operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Could not find an available TCP port")]
    PortExhaustion,

    #[error(transparent)]
    Conf(#[from] ConfError),

    #[error("Invalid configuration: {0}")]
    Validation(String),

    #[error("Redis cluster did not converge within {timeout:?}")]
    ClusterConvergenceTimeout { timeout: Duration },

    #[error("Failed to launch {executable}: {reason}")]
    Launch { executable: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Redis command failed: {0}")]
    Redis(#[from] redis::RedisError),
}

pub type Result<T> = std::result::Result<T, Error>;
