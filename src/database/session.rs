use anyhow::{Context, Result};
use async_lock::Mutex;
use futures::future::BoxFuture;
use std::future::Future;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::{Connection, Executor};

use super::cursor::Cursor;
use crate::config::{AppConfig, MysqlConfig, SshConfig, TunnelSettings};
use crate::ssh::{SshTunnel, retry_with_backoff};

/// A running tunnel and the MySQL connection made through it.
struct Link {
    tunnel: SshTunnel,
    conn: MySqlConnection,
}

impl Link {
    async fn open(ssh: &SshConfig, mysql: &MysqlConfig, settings: &TunnelSettings) -> Result<Self> {
        let tunnel_config = ssh
            .tunnel_to(mysql)
            .with_local_port(settings.local_port)
            .with_extra_args(settings.extra_args.clone());

        let tunnel = retry_with_backoff(settings.reconnect_config(), "SSH tunnel", || {
            SshTunnel::start(tunnel_config.clone())
        })
        .await?;

        let options = connect_options(mysql, tunnel.local_host(), tunnel.local_port());
        let conn = match MySqlConnection::connect_with(&options).await {
            Ok(conn) => conn,
            Err(e) => {
                tunnel.shutdown().await;
                return Err(e).with_context(|| {
                    format!(
                        "Failed to connect to MySQL {}:{} as {} through the tunnel",
                        mysql.host, mysql.port, mysql.user
                    )
                });
            }
        };

        tracing::info!(
            "Connected to MySQL {}:{} via {}",
            mysql.host,
            mysql.port,
            tunnel.local_addr()
        );

        Ok(Self { tunnel, conn })
    }

    async fn close(self) -> Result<()> {
        let closed = self.conn.close().await;
        self.tunnel.shutdown().await;
        closed.context("Failed to close MySQL connection")
    }
}

/// Connect through the local end of the tunnel, not to `mysql.host`.
fn connect_options(mysql: &MysqlConfig, host: &str, port: u16) -> MySqlConnectOptions {
    let options = MySqlConnectOptions::new()
        .host(host)
        .port(port)
        .username(&mysql.user)
        .password(&mysql.password);

    match &mysql.database {
        Some(database) => options.database(database),
        None => options,
    }
}

/// Lost connections surface as I/O errors; those get one reconnect.
fn is_connection_lost(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Io(_))
}

#[derive(Debug, PartialEq, Eq)]
enum LinkState {
    Missing,
    Healthy,
    TunnelDown,
    ConnectionLost,
}

/// Classify an existing link from ssh liveness and the ping result.
///
/// The ping is only meaningful while ssh runs. Errors other than lost
/// connections are returned as-is.
fn link_state(tunnel_alive: bool, ping: Result<(), sqlx::Error>) -> Result<LinkState> {
    if !tunnel_alive {
        return Ok(LinkState::TunnelDown);
    }
    match ping {
        Ok(()) => Ok(LinkState::Healthy),
        Err(e) if is_connection_lost(&e) => Ok(LinkState::ConnectionLost),
        Err(e) => Err(e).context("MySQL ping failed"),
    }
}

/// Fill an empty slot with a single call to `open`; a failure is returned
/// without retrying.
async fn fill_once<T, F, Fut>(slot: &mut Option<T>, open: F) -> Result<&mut T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if slot.is_none() {
        *slot = Some(open().await?);
    }
    slot.as_mut().context("No active session link")
}

/// An SSH tunnel plus one MySQL connection, handing out scoped cursors.
///
/// ```ignore
/// let ssql = SSql::from_config(&AppConfig::load_default()?).await?;
/// let databases = ssql
///     .scope(|cursor| Box::pin(async move {
///         cursor.execute("SHOW DATABASES", &[]).await?;
///         Ok(cursor.fetch_all())
///     }))
///     .await?;
/// ssql.stop().await?;
/// ```
pub struct SSql {
    ssh: SshConfig,
    mysql: MysqlConfig,
    settings: TunnelSettings,
    link: Mutex<Option<Link>>,
}

impl SSql {
    /// Start the tunnel and connect with default tunnel settings.
    pub async fn connect(ssh: SshConfig, mysql: MysqlConfig) -> Result<Self> {
        Self::connect_with(ssh, mysql, TunnelSettings::default()).await
    }

    pub async fn connect_with(
        ssh: SshConfig,
        mysql: MysqlConfig,
        settings: TunnelSettings,
    ) -> Result<Self> {
        let link = Link::open(&ssh, &mysql, &settings).await?;
        Ok(Self {
            ssh,
            mysql,
            settings,
            link: Mutex::new(Some(link)),
        })
    }

    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        Self::connect_with(config.ssh.clone(), config.mysql.clone(), config.tunnel.clone()).await
    }

    pub fn ssh_config(&self) -> &SshConfig {
        &self.ssh
    }

    pub fn mysql_config(&self) -> &MysqlConfig {
        &self.mysql
    }

    /// Run `f` inside a transaction.
    ///
    /// Commits when `f` returns `Ok`, rolls back and returns the error when it
    /// returns `Err`. Scopes on one session run one at a time.
    pub async fn scope<F, R>(&self, f: F) -> Result<R>
    where
        F: for<'c> FnOnce(&'c mut Cursor<'_>) -> BoxFuture<'c, Result<R>>,
    {
        let mut slot = self.link.lock().await;
        let link = self.ensure_link(&mut slot).await?;

        let tx = link
            .conn
            .begin()
            .await
            .context("Failed to begin transaction")?;
        let mut cursor = Cursor::new(tx);
        let outcome = f(&mut cursor).await;
        let tx = cursor.into_transaction();

        match outcome {
            Ok(value) => {
                tx.commit().await.context("Failed to commit transaction")?;
                Ok(value)
            }
            Err(e) => {
                tracing::debug!("Scope failed, rolling back: {:#}", e);
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!("Rollback failed: {}", rollback);
                }
                Err(e)
            }
        }
    }

    /// Commit whatever is pending on the session connection outside a scope.
    pub async fn commit(&self) -> Result<()> {
        let mut slot = self.link.lock().await;
        let link = self.ensure_link(&mut slot).await?;
        link.conn
            .execute("COMMIT")
            .await
            .context("Failed to commit")?;
        Ok(())
    }

    /// Local end of the tunnel, if the session is up.
    pub async fn local_addr(&self) -> Option<String> {
        self.link
            .lock()
            .await
            .as_ref()
            .map(|link| link.tunnel.local_addr())
    }

    /// Whether ssh is running and the server answers a ping.
    pub async fn is_alive(&self) -> bool {
        let mut slot = self.link.lock().await;
        match slot.as_mut() {
            Some(link) => link.tunnel.is_alive() && link.conn.ping().await.is_ok(),
            None => false,
        }
    }

    /// Close the connection, then the tunnel.
    pub async fn stop(self) -> Result<()> {
        match self.link.into_inner() {
            Some(link) => {
                link.close().await?;
                tracing::info!("Session to {} stopped", self.ssh.host);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Make sure the link is usable, rebuilding it once if it was lost.
    async fn ensure_link<'s>(&self, slot: &'s mut Option<Link>) -> Result<&'s mut Link> {
        let state = match slot.as_mut() {
            None => LinkState::Missing,
            Some(link) => {
                let alive = link.tunnel.is_alive();
                let ping = if alive { link.conn.ping().await } else { Ok(()) };
                link_state(alive, ping)?
            }
        };

        match state {
            LinkState::Healthy | LinkState::Missing => {}
            LinkState::TunnelDown => {
                tracing::warn!("SSH tunnel to {} exited, reconnecting", self.ssh.host)
            }
            LinkState::ConnectionLost => tracing::warn!("MySQL connection lost, reconnecting"),
        }

        if state != LinkState::Healthy {
            if let Some(old) = slot.take() {
                if let Err(e) = old.close().await {
                    tracing::debug!("Ignoring error while closing lost link: {:#}", e);
                }
            }
        }

        fill_once(slot, || Link::open(&self.ssh, &self.mysql, &self.settings)).await
    }

    /// Kill the ssh process under the session, as a dropped bastion would.
    #[doc(hidden)]
    pub async fn kill_tunnel(&self) {
        if let Some(link) = self.link.lock().await.as_mut() {
            link.tunnel.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_lost_class() {
        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "broken pipe",
        ));
        assert!(is_connection_lost(&io));
        assert!(!is_connection_lost(&sqlx::Error::RowNotFound));
        assert!(!is_connection_lost(&sqlx::Error::Protocol(
            "unexpected packet".to_string()
        )));
    }

    fn broken_pipe() -> sqlx::Error {
        sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "broken pipe",
        ))
    }

    #[test]
    fn test_link_state() {
        assert_eq!(link_state(true, Ok(())).unwrap(), LinkState::Healthy);
        assert_eq!(link_state(false, Ok(())).unwrap(), LinkState::TunnelDown);
        assert_eq!(
            link_state(false, Err(broken_pipe())).unwrap(),
            LinkState::TunnelDown
        );
        assert_eq!(
            link_state(true, Err(broken_pipe())).unwrap(),
            LinkState::ConnectionLost
        );

        let err = link_state(true, Err(sqlx::Error::Protocol("bad packet".to_string())))
            .unwrap_err();
        assert!(err.to_string().contains("MySQL ping failed"));
    }

    #[test]
    fn test_fill_once_opens_a_single_time() {
        smol::block_on(async {
            let counter = std::cell::Cell::new(0);
            let calls = &counter;

            let mut slot: Option<u32> = None;
            let result = fill_once(&mut slot, || async move {
                calls.set(calls.get() + 1);
                Err::<u32, _>(anyhow::anyhow!("Connection refused"))
            })
            .await;
            assert_eq!(result.unwrap_err().to_string(), "Connection refused");
            assert_eq!(calls.get(), 1);
            assert!(slot.is_none());

            let value = fill_once(&mut slot, || async move {
                calls.set(calls.get() + 1);
                Ok(7)
            })
            .await
            .unwrap();
            assert_eq!(*value, 7);
            assert_eq!(calls.get(), 2);
        });
    }

    #[test]
    fn test_fill_once_keeps_existing_link() {
        smol::block_on(async {
            let counter = std::cell::Cell::new(0);
            let calls = &counter;
            let mut slot = Some(1u32);
            let value = fill_once(&mut slot, || async move {
                calls.set(calls.get() + 1);
                Ok(2)
            })
            .await
            .unwrap();
            assert_eq!(*value, 1);
            assert_eq!(calls.get(), 0);
        });
    }
}
