//! Core CARDLINK primitives shared across crates.
//!
//! Includes APDU command/response value types, the transport error taxonomy,
//! and opaque secure-session key material.

pub mod apdu;
pub mod error;
pub mod session;

pub use apdu::{ApduCommand, ApduResponse, SW_OK};
pub use error::TransportError;
pub use session::{KeyMaterial, SecureSession};
