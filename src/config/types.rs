//! Connection settings resolved from the config and secrets files.

use crate::ssh::{ReconnectConfig, SshAuthMethod, SshTunnelConfig};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_MYSQL_PORT: u16 = 3306;

/// How to reach and log into the SSH host.
#[derive(Clone, PartialEq)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: SshAuthMethod,
}

impl SshConfig {
    /// Tunnel from a local port to the MySQL server as the SSH host sees it.
    pub fn tunnel_to(&self, mysql: &MysqlConfig) -> SshTunnelConfig {
        SshTunnelConfig::new(
            &self.host,
            self.port,
            &self.user,
            self.auth.clone(),
            &mysql.host,
            mysql.port,
        )
    }
}

impl fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let auth = match &self.auth {
            SshAuthMethod::Agent => "agent",
            SshAuthMethod::Password(_) => "password",
            SshAuthMethod::PublicKey { .. } => "public-key",
        };
        f.debug_struct("SshConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("auth", &auth)
            .finish()
    }
}

/// MySQL server and credentials. `host`/`port` are as seen from the SSH host.
#[derive(Clone, PartialEq)]
pub struct MysqlConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: Option<String>,
}

impl fmt::Debug for MysqlConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MysqlConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

/// Optional `[tunnel]` section of the config file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TunnelSettings {
    /// Local port to bind, 0 picks a free one
    pub local_port: u16,
    /// Retries when the tunnel fails to come up for a transient reason
    pub retries: u32,
    pub retry_delay_ms: u64,
    /// Passed to ssh before the destination
    pub extra_args: Vec<String>,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            local_port: 0,
            retries: 1,
            retry_delay_ms: 1000,
            extra_args: Vec::new(),
        }
    }
}

impl TunnelSettings {
    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig::with_retries(self.retries, Duration::from_millis(self.retry_delay_ms))
    }
}

/// `cfg/config.toml`
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SettingsFile {
    pub mysql: ServerSettings,
    #[serde(default)]
    pub tunnel: TunnelSettings,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ServerSettings {
    pub ssh_host: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    pub mysql_host: String,
    #[serde(default = "default_mysql_port")]
    pub mysql_port: u16,
    pub database: Option<String>,
}

/// `secrets/keys.toml`
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SecretsFile {
    pub ssh: SshSecrets,
    pub mysql: MysqlSecrets,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SshSecrets {
    pub user_name: String,
    pub password: Option<String>,
    pub key_file: Option<String>,
    pub key_pass: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct MysqlSecrets {
    pub user_name: String,
    pub password: Option<String>,
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_mysql_port() -> u16 {
    DEFAULT_MYSQL_PORT
}
