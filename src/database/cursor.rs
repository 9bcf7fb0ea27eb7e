use anyhow::{Context, Result};
use futures::TryStreamExt;
use sqlx::mysql::{MySqlArguments, MySqlConnection, MySqlRow};
use sqlx::query::Query;
use sqlx::{Either, Executor, MySql, Transaction};
use std::collections::VecDeque;
use std::sync::Arc;

use super::decode::{column_metadata, convert_rows};
use super::types::{ResultColumn, ResultRow, Value};

/// Outcome of the last statement run through a [`Cursor`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    columns: Vec<ResultColumn>,
    rows: VecDeque<ResultRow>,
    row_count: Option<u64>,
    last_insert_id: Option<u64>,
    returns_rows: bool,
}

impl ResultSet {
    /// Rows returned by a SELECT-like statement
    pub fn from_rows(columns: Arc<[ResultColumn]>, rows: Vec<ResultRow>) -> Self {
        Self {
            columns: columns.to_vec(),
            row_count: Some(rows.len() as u64),
            rows: rows.into(),
            last_insert_id: None,
            returns_rows: true,
        }
    }

    /// Result of INSERT/UPDATE/DELETE/DDL
    pub fn from_modification(rows_affected: u64, last_insert_id: u64) -> Self {
        Self {
            row_count: Some(rows_affected),
            // MySQL reports 0 when nothing was generated
            last_insert_id: (last_insert_id != 0).then_some(last_insert_id),
            ..Self::default()
        }
    }

    pub fn columns(&self) -> &[ResultColumn] {
        &self.columns
    }

    /// Whether the statement produced a result set, even an empty one.
    pub fn returns_rows(&self) -> bool {
        self.returns_rows
    }

    /// Rows returned, or rows affected; `None` before any statement ran.
    pub fn row_count(&self) -> Option<u64> {
        self.row_count
    }

    pub fn last_insert_id(&self) -> Option<u64> {
        self.last_insert_id
    }

    pub fn fetch_one(&mut self) -> Option<ResultRow> {
        self.rows.pop_front()
    }

    pub fn fetch_many(&mut self, size: usize) -> Vec<ResultRow> {
        let size = size.min(self.rows.len());
        self.rows.drain(..size).collect()
    }

    pub fn fetch_all(&mut self) -> Vec<ResultRow> {
        self.rows.drain(..).collect()
    }
}

fn bind_all<'q>(sql: &'q str, params: &'q [Value]) -> Query<'q, MySql, MySqlArguments> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, value| value.bind_to(query))
}

/// Whether a statement produces a result set rather than an affected-row count.
///
/// Only the leading keyword is looked at, after comments. Statements like
/// `CALL` may go either way and report `false`; [`Cursor::execute`] keeps
/// whatever rows the server actually sends.
pub fn is_result_query(sql: &str) -> bool {
    let first_word = skip_comments(sql)
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();

    matches!(
        first_word.as_str(),
        "select" | "with" | "show" | "describe" | "desc" | "explain" | "values" | "table"
    )
}

/// Strip leading whitespace, `(`, `/* */`, `-- ` and `#` comments.
fn skip_comments(mut sql: &str) -> &str {
    loop {
        sql = sql.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
        if let Some(rest) = sql.strip_prefix("/*") {
            sql = rest.split_once("*/").map_or("", |(_, after)| after);
        } else if sql.starts_with("-- ") || sql.starts_with("--\n") || sql.starts_with('#') {
            sql = sql.split_once('\n').map_or("", |(_, after)| after);
        } else {
            return sql;
        }
    }
}

/// `execute_many` is for batches of INSERT/UPDATE/DELETE.
fn check_batch_statement(sql: &str) -> Result<()> {
    if is_result_query(sql) {
        anyhow::bail!("execute_many can't run row-returning statements: {}", sql);
    }
    Ok(())
}

/// What the server sent back for one statement, before decoding.
#[derive(Default)]
struct RawOutcome {
    rows: Vec<MySqlRow>,
    rows_affected: u64,
    last_insert_id: u64,
}

/// A cursor over the transaction of one [`SSql::scope`](super::SSql::scope).
///
/// Statements run immediately; rows of result-returning statements are
/// buffered and drained with the `fetch_*` methods.
pub struct Cursor<'c> {
    tx: Transaction<'c, MySql>,
    results: ResultSet,
}

impl<'c> Cursor<'c> {
    pub(crate) fn new(tx: Transaction<'c, MySql>) -> Self {
        Self {
            tx,
            results: ResultSet::default(),
        }
    }

    pub(crate) fn into_transaction(self) -> Transaction<'c, MySql> {
        self.tx
    }

    /// Run one statement with `?` placeholders bound to `params`.
    ///
    /// Without params the statement goes over the text protocol, so
    /// statements MySQL can't prepare (`USE`, some `SHOW` forms) still work.
    /// Rows are buffered whenever the server sends any; for statements with
    /// several result sets (`CALL`) only the first is kept.
    /// Returns the number of rows fetched or affected.
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        tracing::debug!("Executing: {} ({} params)", sql, params.len());

        let raw = self
            .run(sql, params)
            .await
            .with_context(|| format!("Statement failed: {}", sql))?;

        self.results = if !raw.rows.is_empty() {
            let (columns, rows) = convert_rows(&raw.rows)?;
            ResultSet::from_rows(columns, rows)
        } else if is_result_query(sql) {
            let columns = self.describe_columns(sql).await;
            ResultSet::from_rows(columns, Vec::new())
        } else {
            ResultSet::from_modification(raw.rows_affected, raw.last_insert_id)
        };

        Ok(self.results.row_count().unwrap_or_default())
    }

    async fn run(&mut self, sql: &str, params: &[Value]) -> Result<RawOutcome, sqlx::Error> {
        let conn: &mut MySqlConnection = &mut self.tx;
        let mut stream = if params.is_empty() {
            conn.fetch_many(sql)
        } else {
            conn.fetch_many(bind_all(sql, params))
        };

        let mut raw = RawOutcome::default();
        let mut first_set_done = false;
        while let Some(step) = stream.try_next().await? {
            match step {
                Either::Left(done) => {
                    raw.rows_affected += done.rows_affected();
                    if done.last_insert_id() != 0 {
                        raw.last_insert_id = done.last_insert_id();
                    }
                    first_set_done |= !raw.rows.is_empty();
                }
                Either::Right(row) if !first_set_done => raw.rows.push(row),
                Either::Right(_) => {}
            }
        }
        Ok(raw)
    }

    /// Column metadata for a result set that came back empty.
    async fn describe_columns(&mut self, sql: &str) -> Arc<[ResultColumn]> {
        let conn: &mut MySqlConnection = &mut self.tx;
        match conn.describe(sql).await {
            Ok(described) => column_metadata(described.columns()),
            Err(e) => {
                tracing::debug!("Could not describe `{}`: {}", sql, e);
                Arc::from(Vec::new())
            }
        }
    }

    /// Run the same statement once per parameter set; returns total rows affected.
    ///
    /// Row-returning statements are rejected.
    pub async fn execute_many(&mut self, sql: &str, param_sets: &[Vec<Value>]) -> Result<u64> {
        check_batch_statement(sql)?;

        let mut total = 0;
        let mut last_insert_id = 0;
        for params in param_sets {
            total += self.execute(sql, params).await?;
            if self.results.returns_rows() {
                anyhow::bail!("execute_many can't run row-returning statements: {}", sql);
            }
            if let Some(id) = self.results.last_insert_id() {
                last_insert_id = id;
            }
        }
        self.results = ResultSet::from_modification(total, last_insert_id);
        Ok(total)
    }

    pub fn fetch_one(&mut self) -> Option<ResultRow> {
        self.results.fetch_one()
    }

    pub fn fetch_many(&mut self, size: usize) -> Vec<ResultRow> {
        self.results.fetch_many(size)
    }

    pub fn fetch_all(&mut self) -> Vec<ResultRow> {
        self.results.fetch_all()
    }

    pub fn columns(&self) -> &[ResultColumn] {
        self.results.columns()
    }

    /// Whether the last statement produced a result set, even an empty one.
    pub fn returns_rows(&self) -> bool {
        self.results.returns_rows()
    }

    pub fn row_count(&self) -> Option<u64> {
        self.results.row_count()
    }

    pub fn last_insert_id(&self) -> Option<u64> {
        self.results.last_insert_id()
    }

    /// The connection inside the scope's transaction, for direct sqlx use.
    pub fn connection(&mut self) -> &mut MySqlConnection {
        &mut self.tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(n: i64) -> ResultSet {
        let columns: Arc<[ResultColumn]> = vec![ResultColumn {
            name: "n".to_string(),
            type_name: "BIGINT".to_string(),
            ordinal: 0,
        }]
        .into();
        let rows = (0..n)
            .map(|i| ResultRow::new(columns.clone(), vec![Value::Int(i)]))
            .collect();
        ResultSet::from_rows(columns, rows)
    }

    #[test]
    fn test_fetch_order() {
        let mut results = rows(5);
        assert_eq!(results.row_count(), Some(5));
        assert_eq!(results.columns()[0].name, "n");

        assert_eq!(results.fetch_one().unwrap().get(0), Some(&Value::Int(0)));
        let two = results.fetch_many(2);
        assert_eq!(two.len(), 2);
        assert_eq!(two[1].get(0), Some(&Value::Int(2)));

        let rest = results.fetch_all();
        assert_eq!(rest.len(), 2);
        assert!(results.fetch_one().is_none());
        assert!(results.fetch_all().is_empty());
        // row_count reflects the statement, not what is left to fetch
        assert_eq!(results.row_count(), Some(5));
    }

    #[test]
    fn test_fetch_many_past_end() {
        let mut results = rows(2);
        assert_eq!(results.fetch_many(10).len(), 2);
        assert!(results.fetch_many(1).is_empty());
    }

    #[test]
    fn test_modification_result() {
        let results = ResultSet::from_modification(3, 0);
        assert_eq!(results.row_count(), Some(3));
        assert_eq!(results.last_insert_id(), None);
        assert!(results.columns().is_empty());

        let inserted = ResultSet::from_modification(1, 42);
        assert_eq!(inserted.last_insert_id(), Some(42));
    }

    #[test]
    fn test_empty_result_set() {
        let mut results = ResultSet::default();
        assert_eq!(results.row_count(), None);
        assert!(results.fetch_one().is_none());
    }

    #[test]
    fn test_is_result_query() {
        assert!(is_result_query("SELECT 1"));
        assert!(is_result_query("  select * from t"));
        assert!(is_result_query("(SELECT 1) UNION (SELECT 2)"));
        assert!(is_result_query("WITH x AS (SELECT 1) SELECT * FROM x"));
        assert!(is_result_query("SHOW DATABASES"));
        assert!(is_result_query("describe users"));
        assert!(is_result_query("EXPLAIN SELECT 1"));

        assert!(!is_result_query("INSERT INTO t (a) VALUES (?)"));
        assert!(!is_result_query("UPDATE t SET a = 1"));
        assert!(!is_result_query("DELETE FROM t"));
        assert!(!is_result_query("CREATE TABLE t (id INT)"));
        assert!(!is_result_query("selected_things"));
        assert!(!is_result_query(""));
    }

    #[test]
    fn test_is_result_query_after_comments() {
        assert!(is_result_query("/* report */ SELECT 1"));
        assert!(is_result_query("-- note\nSELECT 1"));
        assert!(is_result_query("# note\n  show tables"));
        assert!(is_result_query("/* a */ /* b */\n-- c\n(SELECT 1)"));
        assert!(!is_result_query("/* SELECT */ DELETE FROM t"));
        assert!(!is_result_query("-- SELECT\nUPDATE t SET a = 1"));
        assert!(!is_result_query("/* never closed SELECT 1"));
        assert!(!is_result_query("CALL list_users()"));
    }

    #[test]
    fn test_result_set_kinds() {
        assert!(rows(0).returns_rows());
        assert!(rows(0).columns().len() == 1);
        assert!(!ResultSet::from_modification(1, 0).returns_rows());
        assert!(!ResultSet::default().returns_rows());
    }

    #[test]
    fn test_batch_statement_check() {
        assert!(check_batch_statement("INSERT INTO t (a) VALUES (?)").is_ok());
        assert!(check_batch_statement("UPDATE t SET a = ? WHERE id = ?").is_ok());
        let err = check_batch_statement("/* x */ SELECT * FROM t WHERE a = ?").unwrap_err();
        assert!(err.to_string().contains("row-returning"));
    }
}
