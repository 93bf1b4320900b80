//! Ledger client boundary.
//!
//! The growth engine only sees [`LedgerClient`]: hand it a query, get back
//! rows or the absent signal (`Ok(None)`) when nothing matched. Transport
//! failures are `Err` and are never confused with "no data".

use crate::queries::{LedgerQuery, QueryKind};
use crate::schemas::parse_timestamp;
use async_trait::async_trait;
use serde::Deserialize;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

/// One result row, keyed by column name
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Ordered rows returned by a query
pub type RecordSet = Vec<Row>;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON-RPC error: code={code}, message={message}")]
    JsonRpc { code: i64, message: String },

    #[error("Deserialization error: {0}")]
    Deserialize(#[from] serde_json::Error),

    #[error("Query run {run_id} ended in state {state}: {message}")]
    QueryFailed {
        run_id: String,
        state: String,
        message: String,
    },

    #[error("Query run {run_id} did not finish within {secs}s")]
    Timeout { run_id: String, secs: u64 },

    #[error("Rate limit exceeded after {0} retries")]
    RateLimitExceeded(u32),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Executes read-only queries against a transaction ledger.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Run `query`. `Ok(None)` means the query matched zero rows.
    async fn execute(&self, query: &LedgerQuery) -> Result<Option<RecordSet>, LedgerError>;
}

#[async_trait]
impl<T: LedgerClient + ?Sized> LedgerClient for std::sync::Arc<T> {
    async fn execute(&self, query: &LedgerQuery) -> Result<Option<RecordSet>, LedgerError> {
        (**self).execute(query).await
    }
}

#[async_trait]
impl<T: LedgerClient + ?Sized> LedgerClient for Box<T> {
    async fn execute(&self, query: &LedgerQuery) -> Result<Option<RecordSet>, LedgerError> {
        (**self).execute(query).await
    }
}

/// Fixture file layout for [`MemoryLedger::from_json_file`]
#[derive(Debug, Default, Deserialize)]
pub struct LedgerFixture {
    #[serde(default)]
    pub transfers: RecordSet,
    #[serde(default)]
    pub labels: RecordSet,
    #[serde(default)]
    pub contracts: RecordSet,
}

/// In-memory ledger answering queries by address membership.
///
/// Used for offline replays and as the test double for the growth engine.
/// Every executed query is recorded and can be inspected with
/// [`MemoryLedger::executed`].
#[derive(Debug, Default)]
pub struct MemoryLedger {
    transfers: RecordSet,
    labels: RecordSet,
    contracts: RecordSet,
    log: Mutex<Vec<LedgerQuery>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixture(fixture: LedgerFixture) -> Self {
        Self {
            transfers: fixture.transfers,
            labels: fixture.labels,
            contracts: fixture.contracts,
            log: Mutex::new(Vec::new()),
        }
    }

    /// Load a JSON fixture with `transfers`, `labels` and `contracts` arrays
    pub fn from_json_file(path: &Path) -> Result<Self, LedgerError> {
        let contents = std::fs::read_to_string(path)?;
        let fixture: LedgerFixture = serde_json::from_str(&contents)?;
        Ok(Self::from_fixture(fixture))
    }

    pub fn with_transfer(mut self, row: Row) -> Self {
        self.transfers.push(row);
        self
    }

    pub fn with_label(mut self, row: Row) -> Self {
        self.labels.push(row);
        self
    }

    pub fn with_contract(mut self, row: Row) -> Self {
        self.contracts.push(row);
        self
    }

    /// Queries executed so far, in order
    pub fn executed(&self) -> Vec<LedgerQuery> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    fn matches(row: &Row, column: &str, wanted: &HashSet<&str>) -> bool {
        row.get(column)
            .and_then(|v| v.as_str())
            .map_or(false, |v| wanted.contains(v.to_lowercase().as_str()))
    }

    /// Sortable value of `column`: numbers, numeric strings or timestamps
    fn rank_key(row: &Row, column: &str) -> Option<f64> {
        match row.get(column)? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .or_else(|| parse_timestamp(s).map(|ts| ts.timestamp_millis() as f64)),
            _ => None,
        }
    }

    /// Largest first, nulls last; ties keep fixture order
    fn rank_rows(rows: &mut RecordSet, column: &str) {
        rows.sort_by(|a, b| {
            match (Self::rank_key(a, column), Self::rank_key(b, column)) {
                (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        });
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn execute(&self, query: &LedgerQuery) -> Result<Option<RecordSet>, LedgerError> {
        if let Ok(mut log) = self.log.lock() {
            log.push(query.clone());
        }

        let wanted: HashSet<&str> = query.addresses.iter().map(String::as_str).collect();

        let mut rows: RecordSet = match query.kind {
            QueryKind::Transfers => self
                .transfers
                .iter()
                .filter(|r| {
                    Self::matches(r, "from_address", &wanted)
                        || Self::matches(r, "to_address", &wanted)
                })
                .cloned()
                .collect(),
            QueryKind::Labels => self
                .labels
                .iter()
                .filter(|r| Self::matches(r, "address", &wanted))
                .cloned()
                .collect(),
            QueryKind::Contracts => self
                .contracts
                .iter()
                .filter(|r| Self::matches(r, "address", &wanted))
                .cloned()
                .collect(),
        };

        if let Some(rank_by) = query.rank_by {
            Self::rank_rows(&mut rows, rank_by.column());
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }

        debug!(
            "Memory ledger answered {} query over {} addresses with {} rows",
            query.kind,
            query.addresses.len(),
            rows.len()
        );

        Ok(if rows.is_empty() { None } else { Some(rows) })
    }
}
