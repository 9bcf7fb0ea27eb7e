//! SSH_ASKPASS support that never writes secrets to disk.
//!
//! ssh reads passwords and key passphrases from the program named in
//! `SSH_ASKPASS`. We point it at a tiny script inside a private temp
//! directory; the script asks the `ssql` binary (in `--askpass` mode) to
//! read the secret from a Unix socket that only this process serves.
//!
//! Binaries embedding the crate should call [`handle_askpass_mode`] first
//! thing in `main()`. The script falls back to `nc -U` when the current
//! executable does not understand `--askpass`.

use anyhow::{Context, Result};
use futures::FutureExt;
use smol::io::AsyncWriteExt;
use smol::net::unix::UnixListener;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// Flag the askpass script passes to the current executable.
pub const ASKPASS_FLAG: &str = "--askpass";

/// Handle `--askpass <socket>` and exit, or return if the flag is absent.
///
/// Must run before logging or argument parsing: ssh reads whatever this
/// process prints to stdout as the secret.
pub fn handle_askpass_mode() {
    let args: Vec<String> = std::env::args().collect();

    let Some(pos) = args.iter().position(|a| a == ASKPASS_FLAG) else {
        return;
    };

    match args.get(pos + 1) {
        Some(socket_path) => match relay_secret(Path::new(socket_path)) {
            Ok(()) => std::process::exit(0),
            Err(e) => {
                eprintln!("askpass error: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            eprintln!("{} requires a socket path argument", ASKPASS_FLAG);
            std::process::exit(1);
        }
    }
}

/// Read the secret from the proxy socket and print it for ssh.
fn relay_secret(socket_path: &Path) -> std::io::Result<()> {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    let mut stream = UnixStream::connect(socket_path)?;
    let mut secret = String::new();
    stream.read_to_string(&mut secret)?;

    print!("{}", secret);
    std::io::stdout().flush()
}

/// One-shot secret server behind an askpass script.
pub struct AskpassProxy {
    listener: UnixListener,
    script_path: PathBuf,
    socket_path: PathBuf,
    _temp_dir: TempDir,
}

impl AskpassProxy {
    /// Create the private directory, socket (0600) and script (0700).
    pub async fn new() -> Result<Self> {
        let temp_dir = TempDir::with_prefix("ssql-askpass-")
            .context("Failed to create askpass directory")?;
        set_mode(temp_dir.path(), 0o700)?;

        let socket_path = temp_dir.path().join("askpass.sock");
        let script_path = temp_dir.path().join("askpass.sh");

        let listener =
            UnixListener::bind(&socket_path).context("Failed to create askpass socket")?;
        set_mode(&socket_path, 0o600)?;

        let current_exe =
            std::env::current_exe().context("Failed to get current executable path")?;
        std::fs::write(&script_path, askpass_script(&current_exe, &socket_path))
            .context("Failed to write askpass script")?;
        set_mode(&script_path, 0o700)?;

        tracing::debug!(
            "Created askpass proxy: socket={}, script={}",
            socket_path.display(),
            script_path.display()
        );

        Ok(Self {
            listener,
            script_path,
            socket_path,
            _temp_dir: temp_dir,
        })
    }

    /// Path to the askpass script (the value for SSH_ASKPASS)
    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    /// Wait for the script to connect, then hand it the secret.
    pub async fn serve_secret(&self, secret: &str) -> Result<()> {
        let (mut stream, _addr) = self
            .listener
            .accept()
            .await
            .context("Failed to accept askpass connection")?;

        stream
            .write_all(secret.as_bytes())
            .await
            .context("Failed to write secret to askpass socket")?;
        stream
            .write_all(b"\n")
            .await
            .context("Failed to write newline to askpass socket")?;
        stream
            .flush()
            .await
            .context("Failed to flush askpass socket")?;

        tracing::debug!("Served secret via askpass proxy");
        Ok(())
    }

    /// Serve once, giving up after `timeout`.
    ///
    /// Returns `Ok(false)` when ssh never asked (e.g. agent auth succeeded).
    pub async fn serve_secret_with_timeout(&self, secret: &str, timeout: Duration) -> Result<bool> {
        futures::select! {
            result = Box::pin(self.serve_secret(secret)).fuse() => {
                result?;
                Ok(true)
            }
            _ = Box::pin(smol::Timer::after(timeout)).fuse() => {
                tracing::debug!("Askpass timeout; ssh did not request a secret");
                Ok(false)
            }
        }
    }

    /// Move the proxy into a detached task that serves `secret` once.
    ///
    /// The temp directory lives until the task finishes.
    pub fn spawn_serve(self, secret: String, timeout: Duration) {
        smol::spawn(async move {
            if let Err(e) = self.serve_secret_with_timeout(&secret, timeout).await {
                tracing::warn!("Askpass proxy failed: {}", e);
            }
        })
        .detach();
    }
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    let mut perms = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .permissions();
    perms.set_mode(mode);
    std::fs::set_permissions(path, perms)
        .with_context(|| format!("Failed to set permissions on {}", path.display()))
}

/// Script body: contains the socket path only, never the secret.
fn askpass_script(exe: &Path, socket: &Path) -> String {
    let exe = shell_escape(&exe.to_string_lossy());
    let socket = shell_escape(&socket.to_string_lossy());
    format!(
        r#"#!/bin/sh
if {exe} {flag} {socket} 2>/dev/null; then
    exit 0
elif command -v nc >/dev/null 2>&1; then
    nc -U {socket}
else
    echo "ssql askpass: neither {flag} nor nc is available" >&2
    exit 1
fi
"#,
        flag = ASKPASS_FLAG,
    )
}

/// Single-quote a string for /bin/sh.
fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

impl Drop for AskpassProxy {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up askpass proxy {}", self.socket_path.display());
    }
}
