use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use color_eyre::Result;
use dirs::config_dir;
use kms_plugin::DEFAULT_TIMEOUT;
use serde::{Deserialize, Serialize};

/// Plugin configuration loaded from `<config dir>/sftpgo-plugin-kms/config.toml`.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct Config {
    /// Deadline for one encrypt/decrypt call, in seconds.
    pub timeout_secs: Option<u64>,
    /// OCI Vault crypto endpoint; `SFTPGO_PLUGIN_KMS_OCI_ENDPOINT` wins.
    pub oci_endpoint: Option<String>,
}

impl Config {
    pub fn timeout(&self) -> Duration {
        self.timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT)
    }
}

/// Load config from a given path; if missing or empty, return defaults.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let cfg: Config = toml::from_str(&contents)?;
    Ok(cfg)
}

pub fn default_path() -> Result<PathBuf> {
    let base = config_dir().ok_or_else(|| color_eyre::eyre::eyre!("no config dir available"))?;
    Ok(base.join("sftpgo-plugin-kms").join("config.toml"))
}

/// Write `config` to `path` unless a file is already there.
pub fn write_default_if_missing(config: &Config, path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(config)?;
    fs::write(path, body)?;
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_default_when_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = load_from_path(dir.path().join("config.toml")).expect("load");
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.timeout(), Duration::from_secs(15));
    }

    #[test]
    fn parses_custom_config() {
        let contents = r#"
            timeout_secs = 30
            oci_endpoint = "https://abc-crypto.kms.eu-frankfurt-1.oraclecloud.com"
        "#;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, contents).expect("write temp config");

        let cfg = load_from_path(&path).expect("load");
        assert_eq!(
            cfg,
            Config {
                timeout_secs: Some(30),
                oci_endpoint: Some("https://abc-crypto.kms.eu-frankfurt-1.oraclecloud.com".into()),
            }
        );
        assert_eq!(cfg.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn zero_timeout_falls_back_to_default() {
        let cfg = Config {
            timeout_secs: Some(0),
            oci_endpoint: None,
        };
        assert_eq!(cfg.timeout(), DEFAULT_TIMEOUT);
    }

    #[test]
    fn rejects_malformed_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "timeout_secs = \"soon\"").expect("write temp config");
        assert!(load_from_path(&path).is_err());
    }

    #[test]
    fn write_default_creates_file_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");
        let cfg = Config {
            timeout_secs: Some(20),
            oci_endpoint: None,
        };

        write_default_if_missing(&cfg, &path).expect("write should succeed");
        let second = write_default_if_missing(&Config::default(), &path).expect("second write ok");
        assert_eq!(second, path);
        assert_eq!(load_from_path(&path).expect("load"), cfg);
    }
}
