//! ssql: run a statement against MySQL through an SSH tunnel.
//!
//! ```bash
//! # Defaults: cfg/config.toml + secrets/keys.toml, SHOW DATABASES
//! ssql
//!
//! # A query with bound parameters, as JSON lines
//! ssql "SELECT id, email FROM users WHERE name = ?" --bind ada --format json
//! ```

use anyhow::Result;
use clap::{Parser, ValueEnum};
use ssql::config::{CONFIG_FILE, SECRETS_FILE};
use ssql::ssh::{SshAuthMethod, SshTunnel, keychain};
use ssql::{AppConfig, ResultRow, SSql, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const DEFAULT_QUERY: &str = "SHOW DATABASES";

#[derive(Parser)]
#[command(name = "ssql", version)]
#[command(about = "Run MySQL statements through an SSH tunnel", long_about = None)]
struct Cli {
    /// Statement to run
    #[arg(default_value = DEFAULT_QUERY)]
    query: String,

    /// Values for `?` placeholders, in order
    #[arg(short, long, value_delimiter = ',')]
    bind: Vec<String>,

    /// Settings file (hosts and ports)
    #[arg(long, env = "SSQL_CONFIG")]
    config: Option<PathBuf>,

    /// Secrets file (user names, passwords, key file)
    #[arg(long, env = "SSQL_SECRETS")]
    secrets: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    format: OutputFormat,

    /// Store the passwords used in the OS keychain after connecting
    #[arg(long)]
    remember: bool,

    /// Remove this host's stored passwords from the OS keychain and exit
    #[arg(long, conflicts_with = "remember")]
    forget: bool,

    /// Only check that ssh can log into the host, then exit
    #[arg(long)]
    check: bool,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

/// What a statement produced, carried out of the scope.
enum Outcome {
    Rows(Vec<String>, Vec<ResultRow>),
    Affected(u64, Option<u64>),
}

fn main() -> Result<()> {
    // ssh may run us as its askpass helper; nothing else may print first
    ssql::ssh::handle_askpass_mode();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ssql=info,warn")),
        )
        .init();

    let cli = Cli::parse();
    smol::block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let config = match (&cli.config, &cli.secrets) {
        (None, None) => AppConfig::load_default()?,
        (config, secrets) => AppConfig::load(
            config.clone().unwrap_or_else(|| PathBuf::from(CONFIG_FILE)),
            secrets.clone().unwrap_or_else(|| PathBuf::from(SECRETS_FILE)),
        )?,
    };

    if cli.forget {
        return forget(&config);
    }

    if cli.check {
        SshTunnel::test_ssh_connection(&config.ssh.tunnel_to(&config.mysql)).await?;
        println!("ssh login to {}@{} ok", config.ssh.user, config.ssh.host);
        return Ok(());
    }

    let session = SSql::from_config(&config).await?;

    if cli.remember {
        remember(&config)?;
    }

    let params: Vec<Value> = cli.bind.into_iter().map(Value::Text).collect();
    let query = cli.query;
    let outcome = session
        .scope(move |cursor| {
            Box::pin(async move {
                cursor.execute(&query, &params).await?;
                if cursor.returns_rows() {
                    let names = cursor.columns().iter().map(|c| c.name.clone()).collect();
                    Ok(Outcome::Rows(names, cursor.fetch_all()))
                } else {
                    Ok(Outcome::Affected(
                        cursor.row_count().unwrap_or_default(),
                        cursor.last_insert_id(),
                    ))
                }
            })
        })
        .await;

    session.stop().await?;
    print_outcome(outcome?, &cli.format)
}

fn print_outcome(outcome: Outcome, format: &OutputFormat) -> Result<()> {
    match (outcome, format) {
        (Outcome::Rows(_, rows), OutputFormat::Json) => {
            for row in rows {
                println!("{}", serde_json::to_string(&row)?);
            }
        }
        (Outcome::Rows(names, rows), OutputFormat::Table) => {
            if !names.is_empty() {
                println!("{}", names.join("\t"));
            }
            for row in rows {
                let cells: Vec<String> = row.values().iter().map(Value::to_string).collect();
                println!("{}", cells.join("\t"));
            }
        }
        (Outcome::Affected(count, last_id), OutputFormat::Json) => {
            let summary = serde_json::json!({ "rows_affected": count, "last_insert_id": last_id });
            println!("{}", summary);
        }
        (Outcome::Affected(count, last_id), OutputFormat::Table) => match last_id {
            Some(id) => println!("{} rows affected (last insert id {})", count, id),
            None => println!("{} rows affected", count),
        },
    }
    Ok(())
}

/// Store the secrets that just worked.
fn remember(config: &AppConfig) -> Result<()> {
    let ssh = &config.ssh;
    match &ssh.auth {
        SshAuthMethod::Password(password) => {
            keychain::store_ssh_password(&ssh.host, ssh.port, &ssh.user, password)?
        }
        SshAuthMethod::PublicKey {
            private_key_path,
            passphrase: Some(passphrase),
        } => keychain::store_key_passphrase(
            &ssh.host,
            ssh.port,
            &ssh.user,
            private_key_path,
            passphrase,
        )?,
        _ => {}
    }

    let mysql = &config.mysql;
    keychain::store_mysql_password(&mysql.host, mysql.port, &mysql.user, &mysql.password)
}

/// Remove stored secrets; a missing entry is fine, a keychain failure is not.
fn forget(config: &AppConfig) -> Result<()> {
    let ssh = &config.ssh;
    let mut removed = keychain::delete_ssh_password(&ssh.host, ssh.port, &ssh.user)?;
    if let SshAuthMethod::PublicKey {
        private_key_path, ..
    } = &ssh.auth
    {
        removed |=
            keychain::delete_key_passphrase(&ssh.host, ssh.port, &ssh.user, private_key_path)?;
    }

    let mysql = &config.mysql;
    removed |= keychain::delete_mysql_password(&mysql.host, mysql.port, &mysql.user)?;

    if removed {
        println!("Removed stored passwords for {}", ssh.host);
    } else {
        println!("No stored passwords for {}", ssh.host);
    }
    Ok(())
}
