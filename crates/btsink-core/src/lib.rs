//! # btsink-core
//!
//! Core types and error definitions shared across the btsink crates.
//!
//! This crate provides:
//! - Bluetooth device identity and trust/connection state
//! - Audio sink representation and volume mapping
//! - Common error types for pairing, registry and audio operations

pub mod device;
pub mod error;
pub mod sink;

pub use device::{Address, Device};
pub use error::{AudioError, PairingError, RegistryError};
pub use sink::{AudioSink, SinkState, VolumeRequest, MAX_VOLUME_PERCENT, NATIVE_MAX_PERCENT};
