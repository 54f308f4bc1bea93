pub mod config;
pub mod crypto;
pub mod error;
pub mod telemetry;

pub use crypto::EncryptionCodec;
pub use error::{Error, Result};
