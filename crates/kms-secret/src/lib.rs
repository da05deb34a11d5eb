//! Local tier of the envelope: per-secret keys, HKDF derivation and the
//! secretbox keeper that seals payloads under the derived key.
//! Also serves the `base64key://` scheme for hosts that keep a static key.

pub mod error;
pub mod kdf;
pub mod keeper;
pub mod local_secret;

pub use error::{Result, SecretError};
pub use keeper::{LocalKeeper, LocalKeeperDriver, LocalKeeperOpener};
pub use local_secret::LocalSecret;
