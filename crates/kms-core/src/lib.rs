//! Core abstractions for the KMS plugin: the driver capability every key
//! management backend satisfies and the secret envelope model shared by the
//! local and remote encryption tiers.

pub mod driver;
pub mod secret;
