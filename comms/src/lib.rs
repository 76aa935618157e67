//! Compressed reduction transport for 1-bit optimizers.
//!
//! The optimizer only talks to a `CompressedBackend`, any transport able to average
//! a buffer across ranks with 1-bit error-feedback compression can stand behind it.

mod backend;
mod error;
mod hub;
pub mod signs;
mod solo;

pub use backend::{CompressedBackend, CompressedBackendTemplate, check_layout};
pub use error::{CommErr, Result};
pub use hub::{Hub, HubBackend};
pub use solo::SoloBackend;
