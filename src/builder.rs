//! Helpers that hand a cursor, and optionally a generated statement, to a
//! closure running inside an [`SSql::scope`].
//!
//! Statements are built from field names: `INSERT` binds one `?` per field,
//! `SELECT` filters with `field = ?` for each where-field, joined by `AND`.

use anyhow::Result;
use futures::future::BoxFuture;
use std::fmt;

use crate::database::{Cursor, ResultRow, SSql, Value};

/// A generated SQL statement with `?` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    sql: String,
    placeholders: usize,
}

impl Statement {
    /// `INSERT INTO table (a,b) VALUES (?,?);`
    pub fn insert(table: &str, fields: &[&str]) -> Result<Self> {
        check_table(table)?;
        if fields.is_empty() {
            anyhow::bail!("INSERT into {} needs at least one field", table);
        }
        for field in fields {
            check_identifier(field)?;
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({});",
            table,
            fields.join(","),
            vec!["?"; fields.len()].join(",")
        );
        Ok(Self {
            sql,
            placeholders: fields.len(),
        })
    }

    /// `SELECT x,y FROM table WHERE a = ? AND b = ?;`
    ///
    /// An empty select list selects `*`; an empty where list drops `WHERE`.
    pub fn select(table: &str, select_fields: &[&str], where_fields: &[&str]) -> Result<Self> {
        check_table(table)?;
        for field in select_fields {
            if *field != "*" {
                check_identifier(field)?;
            }
        }
        for field in where_fields {
            check_identifier(field)?;
        }

        let columns = if select_fields.is_empty() {
            "*".to_string()
        } else {
            select_fields.join(",")
        };

        let mut sql = format!("SELECT {} FROM {}", columns, table);
        if !where_fields.is_empty() {
            let predicates: Vec<String> = where_fields
                .iter()
                .map(|field| format!("{} = ?", field))
                .collect();
            sql.push_str(" WHERE ");
            sql.push_str(&predicates.join(" AND "));
        }
        sql.push(';');

        Ok(Self {
            sql,
            placeholders: where_fields.len(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.sql
    }

    /// Number of `?` parameters the statement expects
    pub fn placeholders(&self) -> usize {
        self.placeholders
    }

    fn check_params(&self, params: &[Value]) -> Result<()> {
        if params.len() != self.placeholders {
            anyhow::bail!(
                "`{}` expects {} parameters, got {}",
                self.sql,
                self.placeholders,
                params.len()
            );
        }
        Ok(())
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

impl AsRef<str> for Statement {
    fn as_ref(&self) -> &str {
        &self.sql
    }
}

/// Plain column names only: letters, digits, `_` and `$`.
fn check_identifier(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
    if !valid {
        anyhow::bail!("Invalid SQL identifier: {:?}", name);
    }
    Ok(())
}

/// A table name, optionally qualified as `schema.table`.
fn check_table(name: &str) -> Result<()> {
    match name.split_once('.') {
        Some((schema, table)) => {
            check_identifier(schema)?;
            check_identifier(table)
        }
        None => check_identifier(name),
    }
}

/// A row type whose fields map one-to-one onto table columns.
pub trait Record {
    /// Column names, in the order `values` returns them.
    fn fields() -> &'static [&'static str];

    fn values(&self) -> Vec<Value>;
}

/// Runs closures in scopes of one session, injecting the cursor and,
/// for `insert`/`select`, the generated statement.
pub struct SSqlBuilder<'s> {
    ssql: &'s SSql,
}

impl<'s> SSqlBuilder<'s> {
    pub fn new(ssql: &'s SSql) -> Self {
        Self { ssql }
    }

    /// Run `f` with a cursor; commit on `Ok`, roll back on `Err`.
    pub async fn base<F, R>(&self, f: F) -> Result<R>
    where
        F: for<'c> FnOnce(&'c mut Cursor<'_>) -> BoxFuture<'c, Result<R>>,
    {
        self.ssql.scope(f).await
    }

    /// Run `f` with an INSERT statement for `fields` and a cursor.
    pub async fn insert<F, R>(&self, table: &str, fields: &[&str], f: F) -> Result<R>
    where
        F: for<'c> FnOnce(Statement, &'c mut Cursor<'_>) -> BoxFuture<'c, Result<R>>,
    {
        let statement = Statement::insert(table, fields)?;
        tracing::debug!("Built statement: {}", statement);
        self.ssql.scope(move |cursor| f(statement, cursor)).await
    }

    /// Run `f` with a SELECT statement and a cursor.
    pub async fn select<F, R>(
        &self,
        table: &str,
        select_fields: &[&str],
        where_fields: &[&str],
        f: F,
    ) -> Result<R>
    where
        F: for<'c> FnOnce(Statement, &'c mut Cursor<'_>) -> BoxFuture<'c, Result<R>>,
    {
        let statement = Statement::select(table, select_fields, where_fields)?;
        tracing::debug!("Built statement: {}", statement);
        self.ssql.scope(move |cursor| f(statement, cursor)).await
    }

    /// Insert one record; returns the generated id, if any.
    pub async fn insert_record<T: Record>(&self, table: &str, record: &T) -> Result<Option<u64>> {
        let statement = Statement::insert(table, T::fields())?;
        let values = record.values();
        statement.check_params(&values)?;

        self.ssql
            .scope(move |cursor| {
                Box::pin(async move {
                    cursor.execute(statement.as_str(), &values).await?;
                    Ok(cursor.last_insert_id())
                })
            })
            .await
    }

    /// Select `select_fields` from rows matching every field of `filter`.
    pub async fn select_where<T: Record>(
        &self,
        table: &str,
        select_fields: &[&str],
        filter: &T,
    ) -> Result<Vec<ResultRow>> {
        let statement = Statement::select(table, select_fields, T::fields())?;
        let values = filter.values();
        statement.check_params(&values)?;

        self.ssql
            .scope(move |cursor| {
                Box::pin(async move {
                    cursor.execute(statement.as_str(), &values).await?;
                    Ok(cursor.fetch_all())
                })
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct User {
        name: String,
        age: u32,
    }

    impl Record for User {
        fn fields() -> &'static [&'static str] {
            &["name", "age"]
        }

        fn values(&self) -> Vec<Value> {
            vec![self.name.as_str().into(), self.age.into()]
        }
    }

    #[test]
    fn test_insert_statement() {
        let statement = Statement::insert("users", &["name", "age", "email"]).unwrap();
        assert_eq!(
            statement.as_str(),
            "INSERT INTO users (name,age,email) VALUES (?,?,?);"
        );
        assert_eq!(statement.placeholders(), 3);
    }

    #[test]
    fn test_insert_requires_fields() {
        assert!(Statement::insert("users", &[]).is_err());
    }

    #[test]
    fn test_select_statement() {
        let statement = Statement::select("users", &["id", "email"], &["name", "age"]).unwrap();
        assert_eq!(
            statement.as_str(),
            "SELECT id,email FROM users WHERE name = ? AND age = ?;"
        );
        assert_eq!(statement.placeholders(), 2);
    }

    #[test]
    fn test_select_defaults() {
        let all = Statement::select("users", &[], &[]).unwrap();
        assert_eq!(all.as_str(), "SELECT * FROM users;");
        assert_eq!(all.placeholders(), 0);

        let star = Statement::select("app.users", &["*"], &["id"]).unwrap();
        assert_eq!(star.to_string(), "SELECT * FROM app.users WHERE id = ?;");
    }

    #[test]
    fn test_rejects_bad_identifiers() {
        assert!(Statement::insert("users; DROP TABLE users", &["a"]).is_err());
        assert!(Statement::insert("users", &["a b"]).is_err());
        assert!(Statement::insert("users", &[""]).is_err());
        assert!(Statement::select("users", &["id"], &["name = 'x' OR 1"]).is_err());
        assert!(Statement::select("a.b.c", &[], &[]).is_err());
        assert!(Statement::select("`users`", &[], &[]).is_err());
    }

    #[test]
    fn test_record_statements() {
        let user = User {
            name: "ada".to_string(),
            age: 36,
        };

        let insert = Statement::insert("users", User::fields()).unwrap();
        assert_eq!(insert.as_str(), "INSERT INTO users (name,age) VALUES (?,?);");
        assert!(insert.check_params(&user.values()).is_ok());

        let select = Statement::select("users", &["id"], User::fields()).unwrap();
        assert_eq!(select.as_str(), "SELECT id FROM users WHERE name = ? AND age = ?;");
        assert_eq!(
            user.values(),
            vec![Value::Text("ada".to_string()), Value::UInt(36)]
        );
    }

    #[test]
    fn test_param_count_mismatch() {
        let statement = Statement::insert("users", &["name", "age"]).unwrap();
        let err = statement.check_params(&[Value::Null]).unwrap_err();
        assert!(err.to_string().contains("expects 2 parameters, got 1"));
    }
}
