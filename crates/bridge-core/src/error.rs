//! Unified error type for the bridge-core crate.
//!
//! [`BridgeError`] wraps module-specific errors (`AudioError`, `PortError`)
//! and domain-specific error kinds (`Config`, `MalformedRequest`).
//! `From` impls allow `?` to propagate across module boundaries seamlessly.

use std::fmt;

use crate::audio::AudioError;
use crate::port::PortError;

/// Unified error type for bridge-core operations.
#[derive(Debug)]
pub enum BridgeError {
    /// Audio device error (query/set volume or mute, COM/mainloop init).
    Audio(AudioError),
    /// Port custodian error (bind conflict that could not be safely reclaimed).
    Port(PortError),
    /// Standard I/O error (file read/write, config persistence).
    Io(std::io::Error),
    /// Configuration validation error.
    Config(String),
    /// Malformed HTTP request body.
    MalformedRequest(String),
    /// A child task failed or panicked; the supervisor restart policy applies.
    InternalCrash(String),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Audio(e) => write!(f, "{e}"),
            BridgeError::Port(e) => write!(f, "{e}"),
            BridgeError::Io(e) => write!(f, "I/O error: {e}"),
            BridgeError::Config(e) => write!(f, "Config error: {e}"),
            BridgeError::MalformedRequest(e) => write!(f, "Malformed request: {e}"),
            BridgeError::InternalCrash(e) => write!(f, "Internal crash: {e}"),
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BridgeError::Audio(e) => Some(e),
            BridgeError::Port(e) => Some(e),
            BridgeError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<AudioError> for BridgeError {
    fn from(e: AudioError) -> Self {
        BridgeError::Audio(e)
    }
}

impl From<PortError> for BridgeError {
    fn from(e: PortError) -> Self {
        BridgeError::Port(e)
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::Io(e)
    }
}

/// Crate-level Result alias using [`BridgeError`].
pub type Result<T> = std::result::Result<T, BridgeError>;
