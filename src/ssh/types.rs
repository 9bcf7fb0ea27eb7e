//! SSH tunnel configuration types.

use std::fmt;

/// Authentication method for the SSH hop
#[derive(Clone, PartialEq, Eq, Default)]
pub enum SshAuthMethod {
    /// Use ssh-agent or system default authentication
    #[default]
    Agent,
    /// Password authentication (delivered through SSH_ASKPASS)
    Password(String),
    /// Private key file with optional passphrase
    PublicKey {
        private_key_path: String,
        passphrase: Option<String>,
    },
}

impl SshAuthMethod {
    /// The secret ssh will prompt for, if any
    pub fn secret(&self) -> Option<&str> {
        match self {
            SshAuthMethod::Agent => None,
            SshAuthMethod::Password(password) => Some(password),
            SshAuthMethod::PublicKey { passphrase, .. } => passphrase.as_deref(),
        }
    }
}

/// Secrets print as `***`.
impl fmt::Debug for SshAuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshAuthMethod::Agent => f.write_str("Agent"),
            SshAuthMethod::Password(_) => f.debug_tuple("Password").field(&"***").finish(),
            SshAuthMethod::PublicKey {
                private_key_path,
                passphrase,
            } => f
                .debug_struct("PublicKey")
                .field("private_key_path", private_key_path)
                .field("passphrase", &passphrase.as_ref().map(|_| "***"))
                .finish(),
        }
    }
}

/// Configuration for a local port forward through the system ssh binary
#[derive(Debug, Clone)]
pub struct SshTunnelConfig {
    /// SSH server hostname
    pub ssh_host: String,
    /// SSH server port (default: 22)
    pub ssh_port: u16,
    /// SSH username
    pub ssh_user: String,
    /// Authentication method
    pub auth_method: SshAuthMethod,
    /// MySQL host as seen from the SSH server
    pub remote_host: String,
    /// MySQL port on the remote host
    pub remote_port: u16,
    /// Local bind address (default: 127.0.0.1)
    pub local_bind_host: String,
    /// Local port to bind (0 for auto-assign)
    pub local_bind_port: u16,
    /// Additional SSH arguments
    pub extra_args: Vec<String>,
}

impl SshTunnelConfig {
    pub fn new(
        ssh_host: impl Into<String>,
        ssh_port: u16,
        ssh_user: impl Into<String>,
        auth_method: SshAuthMethod,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            ssh_host: ssh_host.into(),
            ssh_port,
            ssh_user: ssh_user.into(),
            auth_method,
            remote_host: remote_host.into(),
            remote_port,
            local_bind_host: "127.0.0.1".to_string(),
            local_bind_port: 0,
            extra_args: Vec::new(),
        }
    }

    /// Set the local bind port (0 for auto-assign)
    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_bind_port = port;
        self
    }

    /// Add extra SSH arguments
    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Build the SSH destination (user@host)
    pub fn ssh_url(&self) -> String {
        if self.ssh_user.is_empty() {
            self.ssh_host.clone()
        } else {
            format!("{}@{}", self.ssh_user, self.ssh_host)
        }
    }

    /// The `-L` argument: bind_host:local_port:remote_host:remote_port
    pub fn forward_spec(&self, local_port: u16) -> String {
        format!(
            "{}:{}:{}:{}",
            self.local_bind_host, local_port, self.remote_host, self.remote_port
        )
    }
}
