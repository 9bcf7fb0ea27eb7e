//! MySQL over an SSH tunnel.
//!
//! [`SSql`] starts `ssh -L` to a bastion host, connects to MySQL through the
//! forwarded port and runs closures in transactions via [`SSql::scope`].
//! [`SSqlBuilder`] adds generated INSERT/SELECT statements on top.

pub mod builder;
pub mod config;
pub mod database;
pub mod ssh;

pub use builder::{Record, SSqlBuilder, Statement};
pub use config::AppConfig;
pub use database::{Cursor, ResultRow, SSql, Value};
