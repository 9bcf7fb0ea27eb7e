//! Local port forwarding through the system ssh binary.
//!
//! Using `ssh -L` instead of an SSH library keeps the user's
//! `~/.ssh/config`, known_hosts, ssh-agent and ProxyJump setup working.

use super::types::{SshAuthMethod, SshTunnelConfig};
use anyhow::{Context, Result};
use futures::StreamExt;
use smol::io::{AsyncBufReadExt, BufReader};
use smol::net::TcpListener;
use smol::process::{Child, Command, Stdio};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How long ssh gets to ask for a password or passphrase
const ASKPASS_TIMEOUT: Duration = Duration::from_secs(60);

/// Delay before the first liveness check
const STARTUP_GRACE: Duration = Duration::from_millis(500);

/// Interval and attempts while waiting for the forwarded port
const PORT_POLL_INTERVAL: Duration = Duration::from_millis(200);
const PORT_POLL_ATTEMPTS: u32 = 50;

/// An active `ssh -N -L` process.
pub struct SshTunnel {
    config: SshTunnelConfig,
    local_port: u16,
    process: Child,
    control_path: Option<PathBuf>,
    _control_dir: Option<tempfile::TempDir>,
}

impl SshTunnel {
    /// Spawn ssh and wait until the forwarded local port accepts connections.
    pub async fn start(config: SshTunnelConfig) -> Result<Self> {
        let local_port = if config.local_bind_port == 0 {
            Self::find_available_port(&config.local_bind_host).await?
        } else {
            config.local_bind_port
        };

        let control_dir = Self::control_dir()?;
        let control_path = control_dir.as_ref().map(|dir| dir.path().join("ssh.sock"));

        let mut cmd = Command::new("ssh");
        cmd.kill_on_drop(true);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.args(ssh_args(&config, local_port, control_path.as_deref()));
        Self::attach_secret(&mut cmd, &config.auth_method).await?;

        tracing::info!(
            "Starting SSH tunnel: ssh -L {} -N {}",
            config.forward_spec(local_port),
            config.ssh_url()
        );
        tracing::debug!("Full SSH command: {:?}", cmd);

        let mut process = cmd.spawn().context("Failed to spawn ssh process")?;
        let stderr_lines = Self::watch_stderr(&mut process, &config);

        smol::Timer::after(STARTUP_GRACE).await;

        let verify_addr = format!("{}:{}", config.local_bind_host, local_port);
        let mut attempts = PORT_POLL_ATTEMPTS;
        loop {
            if let Ok(Some(status)) = process.try_status() {
                let stderr = stderr_lines
                    .lock()
                    .map(|lines| lines.join("; "))
                    .unwrap_or_default();
                anyhow::bail!(
                    "SSH process exited immediately with status: {}. {} \
                    Check SSH credentials and connectivity to {}:{}",
                    status,
                    stderr,
                    config.ssh_host,
                    config.ssh_port
                );
            }

            match smol::net::TcpStream::connect(&verify_addr).await {
                Ok(_) => {
                    tracing::info!(
                        "SSH tunnel established: {} -> {}:{}",
                        verify_addr,
                        config.remote_host,
                        config.remote_port
                    );
                    break;
                }
                Err(_) if attempts > 1 => {
                    smol::Timer::after(PORT_POLL_INTERVAL).await;
                    attempts -= 1;
                }
                Err(e) => {
                    let _ = process.kill();
                    anyhow::bail!(
                        "SSH tunnel failed to establish - local port {} not listening: {}",
                        local_port,
                        e
                    );
                }
            }
        }

        Ok(Self {
            config,
            local_port,
            process,
            control_path,
            _control_dir: control_dir,
        })
    }

    /// Private directory for the ControlMaster socket, removed with the tunnel.
    #[cfg(unix)]
    fn control_dir() -> Result<Option<tempfile::TempDir>> {
        tempfile::TempDir::with_prefix("ssql-ssh-")
            .map(Some)
            .context("Failed to create ssh control directory")
    }

    #[cfg(not(unix))]
    fn control_dir() -> Result<Option<tempfile::TempDir>> {
        Ok(None)
    }

    /// Route the password or key passphrase through an askpass proxy.
    #[cfg(unix)]
    async fn attach_secret(cmd: &mut Command, auth: &SshAuthMethod) -> Result<()> {
        let Some(secret) = auth.secret() else {
            return Ok(());
        };

        let proxy = super::askpass::AskpassProxy::new().await?;
        cmd.env("SSH_ASKPASS", proxy.script_path());
        cmd.env("SSH_ASKPASS_REQUIRE", "force");
        // OpenSSH before 8.4 ignores SSH_ASKPASS_REQUIRE and wants DISPLAY
        if std::env::var_os("DISPLAY").is_none() {
            cmd.env("DISPLAY", ":0");
        }
        proxy.spawn_serve(secret.to_string(), ASKPASS_TIMEOUT);
        Ok(())
    }

    #[cfg(not(unix))]
    async fn attach_secret(_cmd: &mut Command, auth: &SshAuthMethod) -> Result<()> {
        if auth.secret().is_some() {
            tracing::warn!(
                "Password delivery via askpass is only supported on Unix; \
                falling back to default SSH auth"
            );
        }
        Ok(())
    }

    /// Log ssh's stderr and keep it around for error messages.
    fn watch_stderr(process: &mut Child, config: &SshTunnelConfig) -> Arc<Mutex<Vec<String>>> {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let Some(stderr) = process.stderr.take() else {
            return collected;
        };

        let sink = collected.clone();
        let ssh_url = config.ssh_url();
        smol::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Some(result) = lines.next().await {
                let line = match result {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::debug!("SSH stderr read error: {}", e);
                        break;
                    }
                };

                if line.contains("Permission denied") || line.contains("Authentication failed") {
                    tracing::error!("SSH authentication failed for {}: {}", ssh_url, line);
                } else if line.contains("Connection refused") || line.contains("Connection timed out")
                {
                    tracing::error!("SSH connection error: {}", line);
                } else {
                    tracing::debug!("SSH stderr: {}", line);
                }

                if let Ok(mut seen) = sink.lock() {
                    seen.push(line);
                }
            }
        })
        .detach();

        collected
    }

    async fn find_available_port(bind_host: &str) -> Result<u16> {
        let listener = TcpListener::bind(format!("{}:0", bind_host))
            .await
            .context("Failed to find available port")?;
        let port = listener.local_addr()?.port();
        drop(listener);
        Ok(port)
    }

    /// Local port the tunnel is listening on.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Host the tunnel is bound to locally.
    pub fn local_host(&self) -> &str {
        &self.config.local_bind_host
    }

    /// Local address to connect to (e.g. "127.0.0.1:40123").
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.config.local_bind_host, self.local_port)
    }

    pub fn config(&self) -> &SshTunnelConfig {
        &self.config
    }

    /// ControlMaster socket of the ssh process (Unix only).
    ///
    /// Other ssh invocations can pass `-o ControlPath=<path>` to reuse the
    /// authenticated connection while the tunnel is up.
    pub fn control_path(&self) -> Option<&Path> {
        self.control_path.as_deref()
    }

    /// Kill ssh without waiting; the tunnel then reports not alive.
    pub(crate) fn kill(&mut self) {
        if let Err(e) = self.process.kill() {
            tracing::debug!("Failed to kill ssh: {}", e);
        }
    }

    /// Whether the ssh process is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.process.try_status(), Ok(None))
    }

    /// Stop ssh: SIGTERM first, then kill.
    pub async fn shutdown(mut self) {
        tracing::debug!("Shutting down SSH tunnel to {}", self.config.ssh_url());

        #[cfg(unix)]
        {
            unsafe {
                libc::kill(self.process.id() as i32, libc::SIGTERM);
            }
            smol::Timer::after(Duration::from_millis(100)).await;
        }

        if self.is_alive() {
            let _ = self.process.kill();
        }
        let _ = self.process.status().await;

        tracing::info!("SSH tunnel to {} closed", self.config.ssh_url());
    }

    /// Check that ssh can reach and authenticate to the host, without forwarding.
    pub async fn test_ssh_connection(config: &SshTunnelConfig) -> Result<()> {
        let mut cmd = Command::new("ssh");
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let batch_mode = if config.auth_method.secret().is_some() {
            "BatchMode=no"
        } else {
            "BatchMode=yes"
        };
        cmd.args(["-o", batch_mode]);
        cmd.args(["-o", "ConnectTimeout=10"]);
        cmd.args(["-o", "StrictHostKeyChecking=accept-new"]);
        cmd.args(auth_args(config));
        Self::attach_secret(&mut cmd, &config.auth_method).await?;
        cmd.arg(config.ssh_url());
        cmd.args(["exit", "0"]);

        tracing::debug!("Testing SSH connection: {:?}", cmd);

        let output = cmd
            .output()
            .await
            .context("Failed to execute ssh test command")?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "SSH connection test failed (exit {}): {}",
                output.status,
                stderr.trim()
            )
        }
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        let _ = self.process.kill();
    }
}

/// Port and authentication arguments shared by the tunnel and the probe.
fn auth_args(config: &SshTunnelConfig) -> Vec<String> {
    let mut args = Vec::new();

    if config.ssh_port != 22 {
        args.push("-p".to_string());
        args.push(config.ssh_port.to_string());
    }

    match &config.auth_method {
        SshAuthMethod::Agent => {}
        SshAuthMethod::Password(_) => {
            args.extend([
                "-o".to_string(),
                "PreferredAuthentications=password,keyboard-interactive".to_string(),
                "-o".to_string(),
                "NumberOfPasswordPrompts=1".to_string(),
            ]);
        }
        SshAuthMethod::PublicKey {
            private_key_path,
            passphrase,
        } => {
            args.push("-i".to_string());
            args.push(private_key_path.clone());
            args.extend(["-o".to_string(), "IdentitiesOnly=yes".to_string()]);
            if passphrase.is_some() {
                args.extend(["-o".to_string(), "NumberOfPasswordPrompts=1".to_string()]);
            }
        }
    }

    args
}

/// Full argument list for the forwarding process, destination last.
///
/// With a control path the process becomes a ControlMaster. ControlPersist
/// stays off so the master exits with the process we track.
fn ssh_args(config: &SshTunnelConfig, local_port: u16, control_path: Option<&Path>) -> Vec<String> {
    let mut args = vec![
        "-L".to_string(),
        config.forward_spec(local_port),
        "-N".to_string(),
    ];

    for option in [
        "ExitOnForwardFailure=yes",
        "StrictHostKeyChecking=accept-new",
        "ServerAliveInterval=15",
        "ServerAliveCountMax=3",
    ] {
        args.push("-o".to_string());
        args.push(option.to_string());
    }

    if let Some(path) = control_path {
        args.extend([
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            "ControlPersist=no".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", path.display()),
        ]);
    }

    args.extend(auth_args(config));
    args.extend(config.extra_args.iter().cloned());
    args.push(config.ssh_url());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(auth_method: SshAuthMethod) -> SshTunnelConfig {
        SshTunnelConfig::new("bastion.example.com", 22, "deploy", auth_method, "db.internal", 3306)
    }

    #[test]
    fn test_ssh_args_agent() {
        let args = ssh_args(&config(SshAuthMethod::Agent), 40123, None);

        assert_eq!(args[0], "-L");
        assert_eq!(args[1], "127.0.0.1:40123:db.internal:3306");
        assert_eq!(args[2], "-N");
        assert!(args.contains(&"ExitOnForwardFailure=yes".to_string()));
        assert!(!args.contains(&"-p".to_string()));
        assert!(!args.contains(&"-i".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("Control")));
        assert_eq!(args.last().unwrap(), "deploy@bastion.example.com");
    }

    #[test]
    fn test_ssh_args_control_master() {
        let socket = Path::new("/tmp/ssql-ssh-abc/ssh.sock");
        let args = ssh_args(&config(SshAuthMethod::Agent), 40123, Some(socket));

        assert!(args.contains(&"ControlMaster=auto".to_string()));
        assert!(args.contains(&"ControlPersist=no".to_string()));
        let path = args.iter().position(|a| a == "ControlPath=/tmp/ssql-ssh-abc/ssh.sock");
        assert_eq!(args[path.unwrap() - 1], "-o");
        assert_eq!(args.last().unwrap(), "deploy@bastion.example.com");
    }

    #[cfg(unix)]
    #[test]
    fn test_control_dir_is_private_and_removed() {
        let dir = SshTunnel::control_dir().unwrap().unwrap();
        let path = dir.path().to_path_buf();
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("ssql-ssh-"));
        assert!(path.is_dir());
        drop(dir);
        assert!(!path.exists());
    }

    #[test]
    fn test_ssh_args_custom_port_and_extra_args() {
        let mut cfg = config(SshAuthMethod::Agent).with_extra_args(vec!["-v".to_string()]);
        cfg.ssh_port = 2222;
        let args = ssh_args(&cfg, 40123, None);

        let p = args.iter().position(|a| a == "-p").unwrap();
        assert_eq!(args[p + 1], "2222");
        let v = args.iter().position(|a| a == "-v").unwrap();
        assert_eq!(v, args.len() - 2);
    }

    #[test]
    fn test_ssh_args_password() {
        let args = ssh_args(
            &config(SshAuthMethod::Password("pw".to_string())),
            40123,
            None,
        );

        assert!(args.contains(&"NumberOfPasswordPrompts=1".to_string()));
        assert!(args.contains(&"PreferredAuthentications=password,keyboard-interactive".to_string()));
        assert!(!args.contains(&"pw".to_string()));
    }

    #[test]
    fn test_ssh_args_public_key() {
        let args = ssh_args(
            &config(SshAuthMethod::PublicKey {
                private_key_path: "/home/deploy/.ssh/id_ed25519".to_string(),
                passphrase: None,
            }),
            40123,
            None,
        );

        let i = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[i + 1], "/home/deploy/.ssh/id_ed25519");
        assert!(args.contains(&"IdentitiesOnly=yes".to_string()));
        assert!(!args.contains(&"NumberOfPasswordPrompts=1".to_string()));
    }

    #[test]
    fn test_find_available_port() {
        let port = smol::block_on(SshTunnel::find_available_port("127.0.0.1")).unwrap();
        assert_ne!(port, 0);
    }
}
