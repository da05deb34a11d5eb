use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Secret status lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SecretStatus {
    Plain,
    SecretBox,
}

impl Default for SecretStatus {
    fn default() -> Self {
        SecretStatus::Plain
    }
}

/// Version tag selecting the key-derivation policy that protects an envelope.
///
/// `Local` derives the key only from material carried with the envelope and
/// exists so that envelopes sealed before master keys were supported stay
/// readable. It is weaker than `MasterKey` and must not be changed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Mode {
    Local,
    MasterKey,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Local
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown encryption mode: {0}")]
pub struct UnknownMode(pub i32);

impl Mode {
    /// Wire representation carried next to the ciphertext.
    pub fn as_i32(self) -> i32 {
        match self {
            Mode::Local => 0,
            Mode::MasterKey => 1,
        }
    }

    /// Mode used when sealing with the given master key.
    pub fn for_master_key(master_key: &str) -> Self {
        if master_key.is_empty() {
            Mode::Local
        } else {
            Mode::MasterKey
        }
    }
}

impl TryFrom<i32> for Mode {
    type Error = UnknownMode;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Mode::Local),
            1 => Ok(Mode::MasterKey),
            other => Err(UnknownMode(other)),
        }
    }
}

/// Transient secret envelope exchanged with the host.
///
/// In `Plain` status `key` is empty and `mode` is `Local`; in `SecretBox`
/// status `key` is the hex per-secret key and `payload` the base64 ciphertext.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct BaseSecret {
    pub status: SecretStatus,
    pub payload: String,
    pub key: String,
    pub additional_data: String,
    pub mode: Mode,
}

impl BaseSecret {
    pub fn plain(payload: impl Into<String>, additional_data: impl Into<String>) -> Self {
        Self {
            status: SecretStatus::Plain,
            payload: payload.into(),
            additional_data: additional_data.into(),
            ..Self::default()
        }
    }

    pub fn sealed(
        payload: impl Into<String>,
        key: impl Into<String>,
        additional_data: impl Into<String>,
        mode: Mode,
    ) -> Self {
        Self {
            status: SecretStatus::SecretBox,
            payload: payload.into(),
            key: key.into(),
            additional_data: additional_data.into(),
            mode,
        }
    }
}

// Payload and key never reach logs.
impl fmt::Debug for BaseSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseSecret")
            .field("status", &self.status)
            .field("payload", &"[REDACTED]")
            .field("key", &if self.key.is_empty() { "" } else { "[REDACTED]" })
            .field("additional_data", &self.additional_data)
            .field("mode", &self.mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_wire_values() {
        assert_eq!(Mode::Local.as_i32(), 0);
        assert_eq!(Mode::MasterKey.as_i32(), 1);
        assert_eq!(Mode::try_from(0), Ok(Mode::Local));
        assert_eq!(Mode::try_from(1), Ok(Mode::MasterKey));
        assert_eq!(Mode::try_from(7), Err(UnknownMode(7)));
    }

    #[test]
    fn mode_follows_master_key_presence() {
        assert_eq!(Mode::for_master_key(""), Mode::Local);
        assert_eq!(Mode::for_master_key("super-master"), Mode::MasterKey);
    }

    #[test]
    fn debug_redacts_payload_and_key() {
        let secret = BaseSecret::sealed("cGF5bG9hZA==", "abcd", "user/1", Mode::MasterKey);
        let rendered = format!("{secret:?}");
        assert!(!rendered.contains("cGF5bG9hZA=="));
        assert!(!rendered.contains("abcd"));
        assert!(rendered.contains("user/1"));
    }

    #[test]
    fn plain_constructor_clears_key_and_mode() {
        let secret = BaseSecret::plain("db-password", "");
        assert_eq!(secret.status, SecretStatus::Plain);
        assert!(secret.key.is_empty());
        assert_eq!(secret.mode, Mode::Local);
    }
}
