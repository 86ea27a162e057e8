//! Error types shared by the btsink crates.

use thiserror::Error;

/// Why a pairing callback was not answered with an accept.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PairingError {
    /// The decision-maker rejected the request.
    #[error("Pairing rejected")]
    Rejected,

    /// The device is on the deny list.
    #[error("Device {0} is not allowed to pair")]
    Denied(String),

    /// No decision arrived before the deadline.
    #[error("Pairing request timed out")]
    Timeout,

    /// The stack (or agent shutdown) cancelled the request.
    #[error("Pairing request cancelled")]
    Cancelled,

    /// A newer request for the same device replaced this one.
    #[error("Pairing request superseded by a newer request")]
    Superseded,

    /// Service authorization refused for an untrusted device.
    #[error("Service {service} not authorized for {address}")]
    Unauthorized { address: String, service: String },
}

/// Errors from the device registry and its persistence layer.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Registry I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed device store: {0}")]
    Format(String),

    #[error("Unsupported device store version: {0}")]
    UnsupportedVersion(u32),
}

/// Errors from the audio control plane.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    /// Neither PipeWire nor PulseAudio was detected.
    #[error("No audio control plane available")]
    Unavailable,

    /// The sink id or card name is not known to the active backend.
    #[error("Audio sink not found: {0}")]
    NotFound(String),

    /// The card exists but does not offer this profile.
    #[error("Card {card} has no profile {profile}")]
    UnknownProfile { card: String, profile: String },

    /// An external command failed or returned something we could not parse.
    #[error("Audio backend error ({command}): {message}")]
    Backend { command: String, message: String },
}

impl AudioError {
    /// Build a backend error from a command name and a diagnostic.
    pub fn backend(command: impl Into<String>, message: impl Into<String>) -> Self {
        AudioError::Backend {
            command: command.into(),
            message: message.into(),
        }
    }
}
