use std::path::PathBuf;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

use regex::Regex;
use rusqlite::Connection;
use rusqlite::types::ValueRef;
use serde::Serialize;
use thiserror::Error;

/// Hard cap on how many statements one model reply may yield.
pub const MAX_STATEMENTS: usize = 50;

static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:[a-zA-Z]*\n)?(.*?)```").expect("valid fence regex"));
static SQL_KEYWORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(select|with|insert|update|delete|drop|create|alter|truncate|replace|pragma|attach|vacuum|grant|revoke)\b",
    )
    .expect("valid keyword regex")
});
static LIMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\blimit\s+(\d+)").expect("valid limit regex"));

#[derive(Debug, Error)]
pub enum EngineInitError {
    #[error("cannot open database engine at '{dsn}': {source}")]
    Open {
        dsn: String,
        source: rusqlite::Error,
    },
    #[error("unsupported database dsn '{0}', expected sqlite:<path> or sqlite::memory:")]
    UnsupportedDsn(String),
    #[error("cannot create database directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum QueryValidationError {
    #[error("no SQL query found in model output")]
    NoQueryFound,
    #[error("too many statements: {count} exceeds the cap of {limit}")]
    TooManyStatements { count: usize, limit: usize },
    #[error("disallowed statement type: {0}")]
    DisallowedStatement(String),
}

#[derive(Debug, Error)]
pub enum QueryExecutionError {
    #[error("query execution failed for '{statement}': {source}")]
    Statement {
        statement: String,
        source: rusqlite::Error,
    },
}

/// Shared handle to the relational engine. Cheap to clone; the rotation
/// job hands the same handle to each new SQL agent instead of reopening.
#[derive(Clone)]
pub struct EngineHandle {
    conn: Arc<Mutex<Connection>>,
    dsn: String,
}

impl EngineHandle {
    pub fn dsn(&self) -> &str {
        &self.dsn
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cheap liveness probe used by startup checks.
    pub fn ping(&self) -> Result<(), QueryExecutionError> {
        let conn = self.lock();
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .map_err(|source| QueryExecutionError::Statement {
                statement: "SELECT 1".to_string(),
                source,
            })
    }

    /// Run raw DDL/DML. Deployment bootstrap and tests only; the request
    /// path never goes through here.
    pub fn execute_batch(&self, sql: &str) -> Result<(), QueryExecutionError> {
        let conn = self.lock();
        conn.execute_batch(sql)
            .map_err(|source| QueryExecutionError::Statement {
                statement: sql.to_string(),
                source,
            })
    }
}

pub fn create_engine(dsn: &str) -> Result<EngineHandle, EngineInitError> {
    let trimmed = dsn.trim();
    let path = if let Some(rest) = trimmed.strip_prefix("sqlite://") {
        rest
    } else if let Some(rest) = trimmed.strip_prefix("sqlite:") {
        rest
    } else if trimmed.contains("://") {
        return Err(EngineInitError::UnsupportedDsn(trimmed.to_string()));
    } else {
        trimmed
    };

    let conn = if path == ":memory:" {
        Connection::open_in_memory()
    } else {
        let path = PathBuf::from(path);
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| EngineInitError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        Connection::open(&path)
    }
    .map_err(|source| EngineInitError::Open {
        dsn: trimmed.to_string(),
        source,
    })?;

    Ok(EngineHandle {
        conn: Arc::new(Mutex::new(conn)),
        dsn: trimmed.to_string(),
    })
}

/// Statements that passed the safety gate: read-only, capped in number,
/// each carrying an enforced row limit. Scoped to one request.
#[derive(Debug, Clone)]
pub struct ValidatedQuerySet {
    statements: Vec<String>,
}

impl ValidatedQuerySet {
    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn joined(&self) -> String {
        self.statements.join("; ")
    }
}

/// Pull runnable SQL out of a model reply and bound it.
///
/// The model may wrap SQL in narrative or code fences; fenced content is
/// preferred when present. The whole batch is rejected when nothing
/// extractable remains, when the statement count exceeds
/// [`MAX_STATEMENTS`], or when any statement is not a read-only query.
pub fn verify_and_extract_sql_query(
    text: &str,
    max_result_rows: u32,
) -> Result<ValidatedQuerySet, QueryValidationError> {
    let body = extract_candidate_sql(text);

    let mut statements = Vec::new();
    for piece in body.split(';') {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        // Narrative fragments with no SQL keyword are dropped silently;
        // fragments led by a write verb poison the whole batch.
        let Some(found) = SQL_KEYWORD_RE.find(piece) else {
            continue;
        };
        let keyword = found.as_str().to_lowercase();
        let statement = piece[found.start()..].trim().to_string();
        if keyword != "select" && keyword != "with" {
            return Err(QueryValidationError::DisallowedStatement(display_prefix(
                &statement,
            )));
        }
        statements.push(statement);
    }

    if statements.is_empty() {
        return Err(QueryValidationError::NoQueryFound);
    }
    if statements.len() > MAX_STATEMENTS {
        return Err(QueryValidationError::TooManyStatements {
            count: statements.len(),
            limit: MAX_STATEMENTS,
        });
    }

    let statements = statements
        .into_iter()
        .map(|statement| enforce_row_limit(statement, max_result_rows))
        .collect();
    Ok(ValidatedQuerySet { statements })
}

fn extract_candidate_sql(text: &str) -> String {
    let fenced: Vec<&str> = FENCE_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();
    if fenced.is_empty() {
        text.to_string()
    } else {
        fenced.join(";\n")
    }
}

fn enforce_row_limit(mut statement: String, max_result_rows: u32) -> String {
    // The last LIMIT is taken as the outer query's; earlier matches belong
    // to subqueries and are left alone.
    let last = LIMIT_RE
        .captures_iter(&statement)
        .last()
        .and_then(|caps| match (caps.get(0), caps.get(1)) {
            (Some(whole), Some(number)) => Some((whole.range(), number.as_str().to_string())),
            _ => None,
        });
    match last {
        Some((range, number)) => {
            let current = number.parse::<u64>().unwrap_or(u64::MAX);
            if current > u64::from(max_result_rows) {
                statement.replace_range(range, &format!("LIMIT {max_result_rows}"));
            }
            statement
        }
        None => format!("{statement} LIMIT {max_result_rows}"),
    }
}

fn display_prefix(statement: &str) -> String {
    const MAX_DISPLAY: usize = 80;
    if statement.len() <= MAX_DISPLAY {
        statement.to_string()
    } else {
        let cut = statement
            .char_indices()
            .take_while(|(idx, _)| *idx < MAX_DISPLAY)
            .last()
            .map(|(idx, ch)| idx + ch.len_utf8())
            .unwrap_or(statement.len());
        format!("{}...", &statement[..cut])
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatementResult {
    pub statement: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Accumulated result of one validated batch, keyed by statement order.
#[derive(Debug, Clone, Serialize)]
pub struct QueryData {
    pub results: Vec<StatementResult>,
}

pub fn execute_queries(
    engine: &EngineHandle,
    queries: &ValidatedQuerySet,
) -> Result<QueryData, QueryExecutionError> {
    let conn = engine.lock();
    let mut results = Vec::with_capacity(queries.len());
    for statement in queries.statements() {
        results.push(run_statement(&conn, statement)?);
    }
    Ok(QueryData { results })
}

fn run_statement(
    conn: &Connection,
    statement: &str,
) -> Result<StatementResult, QueryExecutionError> {
    let fail = |source| QueryExecutionError::Statement {
        statement: statement.to_string(),
        source,
    };

    let mut prepared = conn.prepare(statement).map_err(fail)?;
    let columns: Vec<String> = prepared
        .column_names()
        .iter()
        .map(|name| name.to_string())
        .collect();
    let column_count = columns.len();

    let mut rows = prepared.query([]).map_err(fail)?;
    let mut collected = Vec::new();
    while let Some(row) = rows.next().map_err(fail)? {
        let mut cells = Vec::with_capacity(column_count);
        for idx in 0..column_count {
            cells.push(render_value(row.get_ref(idx).map_err(fail)?));
        }
        collected.push(cells);
    }

    Ok(StatementResult {
        statement: statement.to_string(),
        columns,
        rows: collected,
    })
}

fn render_value(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(value) => value.to_string(),
        ValueRef::Real(value) => value.to_string(),
        ValueRef::Text(text) => String::from_utf8_lossy(text).into_owned(),
        ValueRef::Blob(blob) => format!("<{} bytes>", blob.len()),
    }
}

/// True iff every statement in the batch returned zero rows. The pipeline
/// substitutes a sentinel payload in that case so the summarizing agent
/// never has to distinguish empty from absent.
pub fn is_empty_result(data: &QueryData) -> bool {
    data.results.iter().all(|result| result.rows.is_empty())
}
