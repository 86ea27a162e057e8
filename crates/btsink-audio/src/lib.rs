//! # btsink-audio
//!
//! Normalized control over the host's audio output.
//!
//! Two mutually exclusive control planes are supported:
//! - **PipeWire** (via `pw-dump` and `wpctl`)
//! - **PulseAudio** (via `pactl`, which also covers pipewire-pulse)
//!
//! Card profiles (A2DP versus headset mode) are managed through `pactl` on
//! either plane.
//!
//! The plane is detected once at startup. [`AudioController`] runs every
//! operation on its own task so callers on the pairing path never wait on an
//! external process, and serializes operations that target the same sink.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use btsink_audio::{AudioConfig, AudioController, SystemRunner};
//!
//! async fn example() -> Result<(), btsink_core::AudioError> {
//!     let controller = AudioController::start(Arc::new(SystemRunner::new()), AudioConfig::default());
//!     for sink in controller.list_sinks().await? {
//!         println!("{} {}%", sink.display_name(), sink.volume_percent);
//!     }
//!     let applied = controller.set_volume("bluez_output.AA_BB_CC_DD_EE_FF.1", 175).await?;
//!     assert_eq!(applied, 150);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod cards;
pub mod controller;
pub mod detect;
pub mod pipewire;
pub mod pulseaudio;
pub mod runner;

#[cfg(test)]
pub(crate) mod test_support;

pub use backend::AudioBackend;
pub use cards::{AudioCard, BluetoothAudioStatus, CardControl, CardProfile};
pub use controller::{AudioConfig, AudioController};
pub use detect::{detect_backend, BackendKind};
pub use pipewire::PipeWireBackend;
pub use pulseaudio::PulseAudioBackend;
pub use runner::{CommandOutput, CommandRunner, SystemRunner, DEFAULT_COMMAND_TIMEOUT};
