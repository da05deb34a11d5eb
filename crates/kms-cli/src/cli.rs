use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Environment variable holding the master key for local wrapping.
pub const MASTER_KEY_ENV: &str = "SFTPGO_PLUGIN_KMS_MASTER_KEY";

/// CLI surface. Without a subcommand the plugin serves requests on stdin.
#[derive(Parser, Debug)]
#[command(
    name = "sftpgo-plugin-kms",
    about = "Encrypt and decrypt SFTPGo secrets through a key management service",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Configuration file; defaults to the per-user config directory.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Encrypt a payload and print the result as JSON.
    Encrypt(EncryptArgs),
    /// Decrypt a payload and print the plaintext.
    Decrypt(DecryptArgs),
    /// Answer JSON requests, one per line, on stdin/stdout.
    Serve(ServeArgs),
    /// Print version and exit.
    Version,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct EncryptArgs {
    /// Keeper URL, e.g. ocikeyvault://<key-ocid>.
    #[arg(long)]
    pub url: String,
    #[arg(long, default_value = "")]
    pub additional_data: String,
    #[arg(long, env = MASTER_KEY_ENV, default_value = "", hide_env_values = true)]
    pub master_key: String,
    pub payload: String,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct DecryptArgs {
    #[arg(long)]
    pub url: String,
    /// Hex per-secret key returned by encrypt; empty if none.
    #[arg(long, default_value = "")]
    pub key: String,
    #[arg(long, default_value = "")]
    pub additional_data: String,
    #[arg(long, default_value_t = 0)]
    pub mode: i32,
    #[arg(long, env = MASTER_KEY_ENV, default_value = "", hide_env_values = true)]
    pub master_key: String,
    /// Base64 ciphertext.
    pub ciphertext: String,
}

#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct ServeArgs {
    /// Used for requests that carry no master key of their own.
    #[arg(long, env = MASTER_KEY_ENV, default_value = "", hide_env_values = true)]
    pub master_key: String,
}

impl ServeArgs {
    pub fn from_env() -> Self {
        Self {
            master_key: std::env::var(MASTER_KEY_ENV).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_serve_when_missing_subcommand() {
        let cli = Cli::try_parse_from(["sftpgo-plugin-kms"]).expect("parse should succeed");
        assert_eq!(cli.command, None);
        assert_eq!(cli.config, None);
    }

    #[test]
    fn parses_encrypt_subcommand() {
        let cli = Cli::try_parse_from([
            "sftpgo-plugin-kms",
            "encrypt",
            "--url",
            "ocikeyvault://ocid1.key",
            "--additional-data",
            "user/1",
            "--master-key",
            "m",
            "db-password",
        ])
        .expect("parse should succeed");
        assert_eq!(
            cli.command,
            Some(Command::Encrypt(EncryptArgs {
                url: "ocikeyvault://ocid1.key".into(),
                additional_data: "user/1".into(),
                master_key: "m".into(),
                payload: "db-password".into(),
            }))
        );
    }

    #[test]
    fn parses_decrypt_subcommand_with_defaults() {
        let cli = Cli::try_parse_from([
            "sftpgo-plugin-kms",
            "decrypt",
            "--url",
            "base64key://",
            "--master-key",
            "",
            "Y2lwaGVy",
        ])
        .expect("parse should succeed");
        let Some(Command::Decrypt(args)) = cli.command else {
            panic!("expected decrypt command");
        };
        assert_eq!(args.ciphertext, "Y2lwaGVy");
        assert_eq!(args.key, "");
        assert_eq!(args.mode, 0);
    }

    #[test]
    fn global_config_flag_after_subcommand() {
        let cli = Cli::try_parse_from([
            "sftpgo-plugin-kms",
            "version",
            "--config",
            "/etc/kms.toml",
        ])
        .expect("parse should succeed");
        assert_eq!(cli.command, Some(Command::Version));
        assert_eq!(cli.config, Some(PathBuf::from("/etc/kms.toml")));
    }

    #[test]
    fn parses_config_init_subcommand() {
        let cli = Cli::try_parse_from(["sftpgo-plugin-kms", "config", "init"])
            .expect("parse should succeed");
        assert_eq!(cli.command, Some(Command::Config(ConfigCommand::Init)));
    }

    #[test]
    fn encrypt_requires_url() {
        assert!(Cli::try_parse_from(["sftpgo-plugin-kms", "encrypt", "payload"]).is_err());
    }
}
