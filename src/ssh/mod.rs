//! SSH tunnelling for reaching MySQL behind a bastion host.
//!
//! - `SshTunnel` - `ssh -N -L` process management
//! - `AskpassProxy` - password delivery via Unix socket (Unix only)
//! - `keychain` - OS keychain fallback for secrets
//! - `retry_with_backoff` - start-up retries on transient failures

#[cfg(unix)]
mod askpass;
pub mod keychain;
mod reconnect;
mod tunnel;
mod types;

#[cfg(unix)]
pub use askpass::{AskpassProxy, handle_askpass_mode};
pub use reconnect::{ExponentialBackoff, ReconnectConfig, is_retriable_error, retry_with_backoff};
pub use tunnel::SshTunnel;
pub use types::{SshAuthMethod, SshTunnelConfig};

/// No-op outside Unix: askpass delivery is not available there.
#[cfg(not(unix))]
pub fn handle_askpass_mode() {}
