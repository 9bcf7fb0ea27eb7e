//! OS keychain storage for SSH and MySQL secrets.
//!
//! Used as a fallback when the secrets file leaves a password out, and by
//! `ssql --remember` to store the secrets that worked.

use anyhow::{Context, Result};
use keyring::Entry;
use std::path::Path;

/// Keyring service name for SSH passwords and key passphrases
const SSH_KEYRING_SERVICE: &str = "ssql-ssh";

/// Keyring service name for MySQL passwords
const MYSQL_KEYRING_SERVICE: &str = "ssql-mysql";

fn account_key(host: &str, port: u16, user: &str) -> String {
    format!("{}@{}:{}", user, host, port)
}

/// Passphrases are keyed by key file name so different keys don't collide.
fn passphrase_key(host: &str, port: u16, user: &str, key_path: &str) -> String {
    let key_name = Path::new(key_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("key");
    format!("key:{}@{}:{}:{}", user, host, port, key_name)
}

fn lookup(service: &str, key: &str) -> Option<String> {
    let secret = Entry::new(service, key)
        .ok()
        .and_then(|e| e.get_password().ok());
    if secret.is_some() {
        tracing::debug!("Loaded {} secret for {} from keychain", service, key);
    }
    secret
}

fn store(service: &str, key: &str, secret: &str) -> Result<()> {
    Entry::new(service, key)
        .with_context(|| format!("Failed to create keyring entry for {}", key))?
        .set_password(secret)
        .with_context(|| format!("Failed to store {} secret in keychain", service))?;
    tracing::info!("Stored {} secret for {} in keychain", service, key);
    Ok(())
}

/// Returns whether an entry existed.
fn delete(service: &str, key: &str) -> Result<bool> {
    let entry = Entry::new(service, key)
        .with_context(|| format!("Failed to create keyring entry for {}", key))?;
    let removed = deletion_outcome(entry.delete_credential())
        .with_context(|| format!("Failed to delete {} secret for {} from keychain", service, key))?;
    if removed {
        tracing::info!("Deleted {} secret for {} from keychain", service, key);
    }
    Ok(removed)
}

/// A missing entry is not a failure when deleting.
fn deletion_outcome(result: keyring::Result<()>) -> keyring::Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(keyring::Error::NoEntry) => Ok(false),
        Err(e) => Err(e),
    }
}

pub fn ssh_password(host: &str, port: u16, user: &str) -> Option<String> {
    lookup(SSH_KEYRING_SERVICE, &account_key(host, port, user))
}

pub fn store_ssh_password(host: &str, port: u16, user: &str, password: &str) -> Result<()> {
    store(SSH_KEYRING_SERVICE, &account_key(host, port, user), password)
}

pub fn delete_ssh_password(host: &str, port: u16, user: &str) -> Result<bool> {
    delete(SSH_KEYRING_SERVICE, &account_key(host, port, user))
}

pub fn key_passphrase(host: &str, port: u16, user: &str, key_path: &str) -> Option<String> {
    lookup(
        SSH_KEYRING_SERVICE,
        &passphrase_key(host, port, user, key_path),
    )
}

pub fn store_key_passphrase(
    host: &str,
    port: u16,
    user: &str,
    key_path: &str,
    passphrase: &str,
) -> Result<()> {
    store(
        SSH_KEYRING_SERVICE,
        &passphrase_key(host, port, user, key_path),
        passphrase,
    )
}

pub fn delete_key_passphrase(host: &str, port: u16, user: &str, key_path: &str) -> Result<bool> {
    delete(
        SSH_KEYRING_SERVICE,
        &passphrase_key(host, port, user, key_path),
    )
}

/// MySQL passwords are keyed by the server address as seen from the SSH host.
pub fn mysql_password(host: &str, port: u16, user: &str) -> Option<String> {
    lookup(MYSQL_KEYRING_SERVICE, &account_key(host, port, user))
}

pub fn store_mysql_password(host: &str, port: u16, user: &str, password: &str) -> Result<()> {
    store(MYSQL_KEYRING_SERVICE, &account_key(host, port, user), password)
}

pub fn delete_mysql_password(host: &str, port: u16, user: &str) -> Result<bool> {
    delete(MYSQL_KEYRING_SERVICE, &account_key(host, port, user))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_key_format() {
        assert_eq!(
            account_key("bastion.example.com", 22, "deploy"),
            "deploy@bastion.example.com:22"
        );
        assert_eq!(account_key("10.0.0.5", 3306, "app"), "app@10.0.0.5:3306");
    }

    #[test]
    fn test_deletion_outcome() {
        assert!(deletion_outcome(Ok(())).unwrap());
        assert!(!deletion_outcome(Err(keyring::Error::NoEntry)).unwrap());
        assert!(deletion_outcome(Err(keyring::Error::Invalid(
            "service".to_string(),
            "empty".to_string()
        )))
        .is_err());
    }

    #[test]
    fn test_passphrase_key_format() {
        let rsa = passphrase_key("example.com", 22, "deploy", "/home/deploy/.ssh/id_rsa");
        assert_eq!(rsa, "key:deploy@example.com:22:id_rsa");

        let ed25519 = passphrase_key("example.com", 22, "deploy", "/home/deploy/.ssh/id_ed25519");
        assert_eq!(ed25519, "key:deploy@example.com:22:id_ed25519");
        assert_ne!(rsa, ed25519);
    }

    #[test]
    fn test_passphrase_key_without_file_name() {
        assert_eq!(
            passphrase_key("example.com", 2222, "deploy", "/"),
            "key:deploy@example.com:2222:key"
        );
    }
}
