//! Loading the settings file and the secrets file.
//!
//! Settings (`cfg/config.toml`) hold hosts and ports, secrets
//! (`secrets/keys.toml`) hold user names, passwords and key files. Secrets
//! left out of the file are looked up in the OS keychain.

mod types;

pub use types::{
    DEFAULT_MYSQL_PORT, DEFAULT_SSH_PORT, MysqlConfig, SshConfig, TunnelSettings,
};

use crate::ssh::{SshAuthMethod, keychain};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use types::{SecretsFile, SettingsFile};

pub const CONFIG_FILE: &str = "cfg/config.toml";
pub const SECRETS_FILE: &str = "secrets/keys.toml";

/// Where secrets come from when the secrets file leaves them out.
pub trait SecretLookup {
    fn ssh_password(&self, host: &str, port: u16, user: &str) -> Option<String>;
    fn key_passphrase(&self, host: &str, port: u16, user: &str, key_path: &str) -> Option<String>;
    fn mysql_password(&self, host: &str, port: u16, user: &str) -> Option<String>;
}

/// The OS keychain.
pub struct Keychain;

impl SecretLookup for Keychain {
    fn ssh_password(&self, host: &str, port: u16, user: &str) -> Option<String> {
        keychain::ssh_password(host, port, user)
    }

    fn key_passphrase(&self, host: &str, port: u16, user: &str, key_path: &str) -> Option<String> {
        keychain::key_passphrase(host, port, user, key_path)
    }

    fn mysql_password(&self, host: &str, port: u16, user: &str) -> Option<String> {
        keychain::mysql_password(host, port, user)
    }
}

/// Everything needed to open a session.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub ssh: SshConfig,
    pub mysql: MysqlConfig,
    pub tunnel: TunnelSettings,
}

impl AppConfig {
    /// Read both files, falling back to the keychain for missing secrets.
    pub fn load(config_path: impl AsRef<Path>, secrets_path: impl AsRef<Path>) -> Result<Self> {
        let config_path = config_path.as_ref();
        let secrets_path = secrets_path.as_ref();

        let config = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file {}", config_path.display()))?;
        let secrets = std::fs::read_to_string(secrets_path)
            .with_context(|| format!("Failed to read secrets file {}", secrets_path.display()))?;

        let settings: SettingsFile = toml::from_str(&config)
            .with_context(|| format!("Invalid config file {}", config_path.display()))?;
        let secrets: SecretsFile = toml::from_str(&secrets)
            .with_context(|| format!("Invalid secrets file {}", secrets_path.display()))?;

        tracing::debug!(
            "Loaded settings from {} and {}",
            config_path.display(),
            secrets_path.display()
        );

        Self::resolve(settings, secrets, &Keychain)
            .with_context(|| format!("Invalid secrets file {}", secrets_path.display()))
    }

    /// Look in `./cfg` + `./secrets`, then in the user config directory.
    pub fn load_default() -> Result<Self> {
        let candidates = default_locations();
        for (config_path, secrets_path) in &candidates {
            if config_path.exists() {
                return Self::load(config_path, secrets_path);
            }
        }

        let tried: Vec<String> = candidates
            .iter()
            .map(|(config, _)| config.display().to_string())
            .collect();
        anyhow::bail!("No config file found (tried {})", tried.join(", "))
    }

    /// Parse in-memory config and secrets text.
    pub fn from_strs(config: &str, secrets: &str) -> Result<Self> {
        Self::from_strs_with(config, secrets, &Keychain)
    }

    /// Like [`AppConfig::from_strs`] with a custom fallback for missing secrets.
    pub fn from_strs_with(config: &str, secrets: &str, lookup: &dyn SecretLookup) -> Result<Self> {
        let settings: SettingsFile = toml::from_str(config).context("Invalid config")?;
        let secrets: SecretsFile = toml::from_str(secrets).context("Invalid secrets")?;
        Self::resolve(settings, secrets, lookup)
    }

    fn resolve(
        settings: SettingsFile,
        secrets: SecretsFile,
        lookup: &dyn SecretLookup,
    ) -> Result<Self> {
        let server = settings.mysql;
        let ssh_secrets = secrets.ssh;
        let mysql_secrets = secrets.mysql;

        let (ssh_host, ssh_port, ssh_user) = (server.ssh_host, server.ssh_port, ssh_secrets.user_name);

        let auth = match (ssh_secrets.password, ssh_secrets.key_file) {
            (Some(_), Some(_)) => {
                anyhow::bail!("The [ssh] secrets can't contain both a key_file and a password")
            }
            (Some(password), None) => {
                if ssh_secrets.key_pass.is_some() {
                    tracing::warn!("Ignoring [ssh] key_pass: no key_file is configured");
                }
                SshAuthMethod::Password(password)
            }
            (None, Some(key_file)) => {
                let private_key_path = expand_home(&key_file);
                let passphrase = ssh_secrets.key_pass.or_else(|| {
                    lookup.key_passphrase(&ssh_host, ssh_port, &ssh_user, &private_key_path)
                });
                SshAuthMethod::PublicKey {
                    private_key_path,
                    passphrase,
                }
            }
            (None, None) => {
                if ssh_secrets.key_pass.is_some() {
                    tracing::warn!("Ignoring [ssh] key_pass: no key_file is configured");
                }
                match lookup.ssh_password(&ssh_host, ssh_port, &ssh_user) {
                    Some(password) => SshAuthMethod::Password(password),
                    None => {
                        tracing::debug!("No SSH password or key file configured, using ssh-agent");
                        SshAuthMethod::Agent
                    }
                }
            }
        };

        let mysql_password = match mysql_secrets.password {
            Some(password) => password,
            None => lookup
                .mysql_password(&server.mysql_host, server.mysql_port, &mysql_secrets.user_name)
                .with_context(|| {
                    format!(
                        "No [mysql] password for {} in the secrets file or the keychain",
                        mysql_secrets.user_name
                    )
                })?,
        };

        Ok(Self {
            ssh: SshConfig {
                host: ssh_host,
                port: ssh_port,
                user: ssh_user,
                auth,
            },
            mysql: MysqlConfig {
                host: server.mysql_host,
                port: server.mysql_port,
                user: mysql_secrets.user_name,
                password: mysql_password,
                database: server.database.filter(|db| !db.is_empty()),
            },
            tunnel: settings.tunnel,
        })
    }
}

fn default_locations() -> Vec<(PathBuf, PathBuf)> {
    let mut locations = vec![(PathBuf::from(CONFIG_FILE), PathBuf::from(SECRETS_FILE))];
    if let Some(dir) = dirs::config_dir() {
        let dir = dir.join("ssql");
        locations.push((dir.join("config.toml"), dir.join("keys.toml")));
    }
    locations
}

/// Expand a leading `~/` to the home directory.
fn expand_home(path: &str) -> String {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest).to_string_lossy().into_owned(),
        _ => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const CONFIG: &str = r#"
        [mysql]
        ssh_host = "bastion.example.com"
        ssh_port = 2222
        mysql_host = "10.0.0.5"
        mysql_port = 3307
        database = "inventory"
    "#;

    #[derive(Default)]
    struct StubSecrets(HashMap<String, String>);

    impl SecretLookup for StubSecrets {
        fn ssh_password(&self, host: &str, port: u16, user: &str) -> Option<String> {
            self.0.get(&format!("ssh:{}@{}:{}", user, host, port)).cloned()
        }

        fn key_passphrase(&self, _: &str, _: u16, _: &str, key_path: &str) -> Option<String> {
            self.0.get(&format!("key:{}", key_path)).cloned()
        }

        fn mysql_password(&self, host: &str, port: u16, user: &str) -> Option<String> {
            self.0.get(&format!("mysql:{}@{}:{}", user, host, port)).cloned()
        }
    }

    fn parse(config: &str, secrets: &str) -> Result<AppConfig> {
        AppConfig::from_strs_with(config, secrets, &StubSecrets::default())
    }

    #[test]
    fn test_password_auth() {
        let secrets = r#"
            [ssh]
            user_name = "deploy"
            password = "ssh-pw"

            [mysql]
            user_name = "app"
            password = "db-pw"
        "#;

        let config = parse(CONFIG, secrets).unwrap();
        assert_eq!(config.ssh.host, "bastion.example.com");
        assert_eq!(config.ssh.port, 2222);
        assert_eq!(config.ssh.user, "deploy");
        assert_eq!(config.ssh.auth, SshAuthMethod::Password("ssh-pw".to_string()));
        assert_eq!(config.mysql.host, "10.0.0.5");
        assert_eq!(config.mysql.port, 3307);
        assert_eq!(config.mysql.user, "app");
        assert_eq!(config.mysql.password, "db-pw");
        assert_eq!(config.mysql.database.as_deref(), Some("inventory"));
        assert_eq!(config.tunnel, TunnelSettings::default());
    }

    #[test]
    fn test_key_file_auth() {
        let secrets = r#"
            [ssh]
            user_name = "deploy"
            key_file = "/keys/id_ed25519"
            key_pass = "phrase"

            [mysql]
            user_name = "app"
            password = "db-pw"
        "#;

        let config = parse(CONFIG, secrets).unwrap();
        assert_eq!(
            config.ssh.auth,
            SshAuthMethod::PublicKey {
                private_key_path: "/keys/id_ed25519".to_string(),
                passphrase: Some("phrase".to_string()),
            }
        );
    }

    #[test]
    fn test_password_and_key_file_rejected() {
        let secrets = r#"
            [ssh]
            user_name = "deploy"
            password = "ssh-pw"
            key_file = "/keys/id_rsa"

            [mysql]
            user_name = "app"
            password = "db-pw"
        "#;

        let err = parse(CONFIG, secrets).unwrap_err();
        assert!(err.to_string().contains("both a key_file and a password"));
    }

    #[test]
    fn test_agent_when_no_ssh_secret() {
        let secrets = r#"
            [ssh]
            user_name = "deploy"

            [mysql]
            user_name = "app"
            password = "db-pw"
        "#;

        let config = parse(CONFIG, secrets).unwrap();
        assert_eq!(config.ssh.auth, SshAuthMethod::Agent);
    }

    #[test]
    fn test_keychain_fallbacks() {
        let mut stub = StubSecrets::default();
        stub.0.insert(
            "ssh:deploy@bastion.example.com:2222".to_string(),
            "from-keychain".to_string(),
        );
        stub.0.insert("mysql:app@10.0.0.5:3307".to_string(), "db-keychain".to_string());

        let secrets = r#"
            [ssh]
            user_name = "deploy"

            [mysql]
            user_name = "app"
        "#;

        let config = AppConfig::from_strs_with(CONFIG, secrets, &stub).unwrap();
        assert_eq!(
            config.ssh.auth,
            SshAuthMethod::Password("from-keychain".to_string())
        );
        assert_eq!(config.mysql.password, "db-keychain");
    }

    #[test]
    fn test_key_passphrase_from_keychain() {
        let mut stub = StubSecrets::default();
        stub.0.insert("key:/keys/id_rsa".to_string(), "kc-phrase".to_string());

        let secrets = r#"
            [ssh]
            user_name = "deploy"
            key_file = "/keys/id_rsa"

            [mysql]
            user_name = "app"
            password = "db-pw"
        "#;

        let config = AppConfig::from_strs_with(CONFIG, secrets, &stub).unwrap();
        assert_eq!(config.ssh.auth.secret(), Some("kc-phrase"));
    }

    #[test]
    fn test_missing_mysql_password() {
        let secrets = r#"
            [ssh]
            user_name = "deploy"

            [mysql]
            user_name = "app"
        "#;

        let err = parse(CONFIG, secrets).unwrap_err();
        assert!(err.to_string().contains("No [mysql] password for app"));
    }

    #[test]
    fn test_defaults_and_tunnel_section() {
        let config = r#"
            [mysql]
            ssh_host = "bastion"
            mysql_host = "localhost"
            database = ""

            [tunnel]
            local_port = 13306
            retries = 3
            extra_args = ["-o", "ProxyJump=jump.example.com"]
        "#;
        let secrets = r#"
            [ssh]
            user_name = "deploy"
            [mysql]
            user_name = "app"
            password = "db-pw"
        "#;

        let config = parse(config, secrets).unwrap();
        assert_eq!(config.ssh.port, DEFAULT_SSH_PORT);
        assert_eq!(config.mysql.port, DEFAULT_MYSQL_PORT);
        assert_eq!(config.mysql.database, None);
        assert_eq!(config.tunnel.local_port, 13306);
        assert_eq!(config.tunnel.retries, 3);
        assert_eq!(config.tunnel.retry_delay_ms, 1000);
        assert_eq!(config.tunnel.extra_args.len(), 2);
        assert_eq!(config.tunnel.reconnect_config().max_attempts, Some(3));
    }

    #[test]
    fn test_missing_required_key() {
        let config = r#"
            [mysql]
            mysql_host = "localhost"
        "#;
        let secrets = r#"
            [ssh]
            user_name = "deploy"
            [mysql]
            user_name = "app"
            password = "db-pw"
        "#;

        let err = parse(config, secrets).unwrap_err();
        assert!(format!("{:#}", err).contains("ssh_host"));
    }

    #[test]
    fn test_load_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        let secrets_path = dir.path().join("keys.toml");
        std::fs::write(&config_path, CONFIG).unwrap();
        std::fs::write(
            &secrets_path,
            "[ssh]\nuser_name = \"deploy\"\npassword = \"pw\"\n[mysql]\nuser_name = \"app\"\npassword = \"db\"\n",
        )
        .unwrap();

        let config = AppConfig::load(&config_path, &secrets_path).unwrap();
        assert_eq!(config.mysql.database.as_deref(), Some("inventory"));
        assert_eq!(config.ssh.auth, SshAuthMethod::Password("pw".to_string()));
    }

    #[test]
    fn test_load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");

        let err = AppConfig::load(&missing, &missing).unwrap_err();
        assert!(err.to_string().contains("nope.toml"));
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/abs/key"), "/abs/key");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(
                expand_home("~/.ssh/id_rsa"),
                home.join(".ssh/id_rsa").to_string_lossy()
            );
        }
    }

    #[test]
    fn test_debug_redacts_passwords() {
        let secrets = r#"
            [ssh]
            user_name = "deploy"
            password = "ssh-secret-pw"
            [mysql]
            user_name = "app"
            password = "db-secret-pw"
        "#;

        let config = parse(CONFIG, secrets).unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("ssh-secret-pw"));
        assert!(!debug.contains("db-secret-pw"));
        assert!(debug.contains("bastion.example.com"));
    }
}
