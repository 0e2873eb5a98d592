//! Statement instrumentation and EXPLAIN collection.
//!
//! Every statement a [`Connection`](crate::Connection) runs is reported once through
//! [`instrument`]: a `tracing` debug event carrying the SQL, its name and the rendered binds.
//! When an [`ExplainCollector`] is switched on, successful reads and writes are also kept as
//! `(sql, binds)` pairs so they can be explained afterwards.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

use crate::types::RowValues;

/// Statement names that are never collected.
pub const IGNORED_NAMES: [&str; 2] = ["SCHEMA", "EXPLAIN"];

/// Name given to statements run through `execute` and `select_all`.
pub const DEFAULT_NAME: &str = "SQL";

lazy_static! {
    static ref EXPLAINABLE: Regex =
        Regex::new(r"(?i)\A\s*(select|update|delete|insert)\b").expect("static explain pattern");
}

/// A collected statement and the binds it ran with.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectedQuery {
    pub sql: String,
    pub binds: Vec<RowValues>,
}

#[derive(Debug, Default)]
struct CollectorState {
    collecting: bool,
    queries: Vec<CollectedQuery>,
}

/// Shared handle to one connection's EXPLAIN collector.
#[derive(Debug, Clone, Default)]
pub struct ExplainCollector {
    state: Arc<Mutex<CollectorState>>,
}

impl ExplainCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CollectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_collecting(&self) -> bool {
        self.lock().collecting
    }

    pub fn set_collecting(&self, collecting: bool) {
        self.lock().collecting = collecting;
    }

    /// Keep `sql` if collection is on, the statement succeeded, its name is not ignored and
    /// it is a read or a write.
    pub fn record(&self, name: &str, sql: &str, binds: &[RowValues], failed: bool) {
        let mut state = self.lock();
        if !state.collecting || failed || !is_explainable(name, sql) {
            return;
        }
        state.queries.push(CollectedQuery {
            sql: sql.to_owned(),
            binds: binds.to_vec(),
        });
    }

    #[must_use]
    pub fn queries(&self) -> Vec<CollectedQuery> {
        self.lock().queries.clone()
    }

    /// Drain the collected queries, leaving collection switched as it was.
    pub fn take(&self) -> Vec<CollectedQuery> {
        std::mem::take(&mut self.lock().queries)
    }

    /// Stop collecting and forget everything collected so far.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.collecting = false;
        state.queries.clear();
    }
}

fn is_explainable(name: &str, sql: &str) -> bool {
    !IGNORED_NAMES.contains(&name) && EXPLAINABLE.is_match(sql)
}

/// `[1, "alice", NULL]`-style rendering for log lines.
#[must_use]
pub fn render_binds(binds: &[RowValues]) -> String {
    let rendered: Vec<String> = binds
        .iter()
        .map(|bind| match bind {
            RowValues::Int(v) => v.to_string(),
            RowValues::Float(v) => v.to_string(),
            RowValues::Text(v) => format!("{v:?}"),
            RowValues::Bool(v) => v.to_string(),
            RowValues::Timestamp(v) => format!("'{}'", v.format("%Y-%m-%d %H:%M:%S%.f")),
            RowValues::Null => "NULL".to_string(),
            RowValues::JSON(v) => v.to_string(),
            RowValues::Blob(v) => format!("<{} bytes>", v.len()),
        })
        .collect();
    format!("[{}]", rendered.join(", "))
}

/// Report one finished statement.
pub(crate) fn instrument(
    conn_id: u64,
    collector: Option<&ExplainCollector>,
    name: &str,
    sql: &str,
    binds: &[RowValues],
    failed: bool,
) {
    debug!(
        conn_id,
        name,
        sql,
        binds = %render_binds(binds),
        failed,
        "sql"
    );
    if let Some(collector) = collector {
        collector.record(name, sql, binds, failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collecting() -> ExplainCollector {
        let collector = ExplainCollector::new();
        collector.set_collecting(true);
        collector
    }

    #[test]
    fn failed_statements_are_not_collected() {
        let collector = collecting();
        collector.record(DEFAULT_NAME, "select 1 from users", &[], true);
        assert!(collector.queries().is_empty());
    }

    #[test]
    fn ignored_names_are_not_collected() {
        let collector = collecting();
        for name in IGNORED_NAMES {
            collector.record(name, "select 1 from users", &[], false);
        }
        assert!(collector.queries().is_empty());
    }

    #[test]
    fn nothing_is_collected_while_switched_off() {
        let collector = ExplainCollector::new();
        collector.record(DEFAULT_NAME, "select 1 from users", &[RowValues::Int(1)], false);
        assert!(collector.queries().is_empty());
    }

    #[test]
    fn collects_sql_with_its_binds() {
        let collector = collecting();
        let binds = vec![RowValues::Int(1), RowValues::Int(2)];
        collector.record(DEFAULT_NAME, "select 1 from users", &binds, false);
        assert_eq!(
            collector.queries(),
            vec![CollectedQuery {
                sql: "select 1 from users".into(),
                binds,
            }]
        );
    }

    #[test]
    fn only_whole_keyword_reads_and_writes_are_collected() {
        let collector = collecting();
        collector.record(DEFAULT_NAME, "SHOW max_identifier_length", &[], false);
        collector.record(DEFAULT_NAME, "select_db yo_mama", &[], false);
        assert!(collector.queries().is_empty());

        collector.record(DEFAULT_NAME, "  UPDATE t SET x = 1", &[], false);
        assert_eq!(collector.take().len(), 1);
        assert!(collector.queries().is_empty());
        assert!(collector.is_collecting());
    }

    #[test]
    fn binds_render_for_logging() {
        let binds = [
            RowValues::Int(10),
            RowValues::Text("alice".into()),
            RowValues::Null,
            RowValues::Blob(vec![0, 1, 2]),
        ];
        assert_eq!(render_binds(&binds), r#"[10, "alice", NULL, <3 bytes>]"#);
        assert_eq!(render_binds(&[]), "[]");
    }
}
