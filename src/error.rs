//! Error types for harbormaster.

use std::path::PathBuf;

use thiserror::Error;

/// Errors in the desired-state document. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file could not be parsed.
    #[error("Failed to parse config file {path}: {reason}")]
    Parse {
        /// Path of the offending file.
        path: PathBuf,
        /// Parser message.
        reason: String,
    },

    /// A value is present but unusable.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// A required value is absent.
    #[error("Missing required value: {key}")]
    Missing { key: String },
}

/// Errors returned by the container runtime.
///
/// Every variant is recoverable: callers log it and retry on the next tick.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime daemon could not be reached.
    #[error("Container runtime not available: {reason}")]
    Unavailable { reason: String },

    /// The object does not exist (HTTP 404).
    #[error("No such object: {id}")]
    NotFound { id: String },

    /// The object is already in the requested state (HTTP 304).
    #[error("Object {id} already in requested state")]
    NotModified { id: String },

    /// The request conflicts with current state (HTTP 409).
    #[error("Conflict on {id}: {message}")]
    Conflict { id: String, message: String },

    /// Any other error status from the runtime API.
    #[error("Runtime API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Transport-level failure (socket, timeout, decoding).
    #[error("Runtime transport error: {0}")]
    Transport(String),
}

impl RuntimeError {
    /// True when the error means the operation's goal already holds,
    /// e.g. stopping a stopped container or removing a removed one.
    pub fn is_already_done(&self) -> bool {
        matches!(self, Self::NotModified { .. } | Self::NotFound { .. })
    }
}

/// Errors raised from the hook pipeline.
#[derive(Debug, Error)]
pub enum HookError {
    /// The hook refuses this creation attempt. Cancels only the current attempt.
    #[error("Creation aborted by {plugin}: {reason}")]
    Abort { plugin: String, reason: String },

    /// The hook failed for another reason.
    #[error("Hook {plugin} failed: {reason}")]
    Failed { plugin: String, reason: String },

    /// A runtime call made by the hook failed.
    #[error("Hook {plugin} runtime call failed: {source}")]
    Runtime {
        plugin: String,
        #[source]
        source: RuntimeError,
    },
}

impl HookError {
    /// Build an abort for the given plugin.
    pub fn abort(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Abort {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }

    /// Build a generic failure for the given plugin.
    pub fn failed(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }

    /// Whether this is an "abort creation" signal.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Abort { .. })
    }
}

/// Failure of one create-and-start attempt.
#[derive(Debug, Error)]
pub enum CreateError {
    #[error(transparent)]
    Hook(#[from] HookError),

    #[error("Failed to create container for set '{set}': {source}")]
    Create {
        set: String,
        #[source]
        source: RuntimeError,
    },

    /// The container exists but did not start. It is left in place.
    #[error("Container {id} for set '{set}' created but failed to start: {source}")]
    Start {
        set: String,
        id: String,
        #[source]
        source: RuntimeError,
    },
}

/// Errors from the idle-worker detector.
#[derive(Debug, Error)]
pub enum IdleError {
    #[error("Failed to build idle detector client: {0}")]
    Client(String),

    #[error("Idle detector request failed: {0}")]
    Http(String),

    #[error("Idle detector returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// An entry in the response was not an 8-character worker id.
    #[error("Idle detector returned malformed worker id '{entry}' (expected {expected} chars)")]
    MalformedEntry { entry: String, expected: usize },
}
