//! Data schemas for the graph grower.
//!
//! Canonical definitions of the records returned by the ledger and of the
//! state tuple threaded between growth steps.

use crate::ethereum::Address;
use crate::ledger::Row;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Schema version for tracking changes
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Address → display label
pub type LabelMap = BTreeMap<Address, String>;

/// Display label → every address sharing it
pub type ReverseLabelMap = BTreeMap<String, BTreeSet<Address>>;

/// A ledger row that could not be turned into a typed record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedRecord {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("field '{field}' has invalid value: {value}")]
    InvalidField { field: &'static str, value: String },
}

// ============================================================================
// PART A: Transfer Schema
// ============================================================================

/// One token or native-currency transfer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferRecord {
    /// Token symbol; `None` usually means an unverified (spam) token
    pub symbol: Option<String>,

    pub decimals: Option<i64>,

    pub amount: Option<f64>,

    pub amount_usd: Option<f64>,

    /// Transaction hash, unique within the deduplicated dataset
    pub tx_hash: String,

    pub from_address: Address,

    pub to_address: Address,

    pub block_timestamp: DateTime<Utc>,
}

impl TransferRecord {
    /// Both endpoints of the transfer
    pub fn endpoints(&self) -> [&Address; 2] {
        [&self.from_address, &self.to_address]
    }
}

impl TryFrom<&Row> for TransferRecord {
    type Error = MalformedRecord;

    fn try_from(row: &Row) -> Result<Self, Self::Error> {
        Ok(Self {
            symbol: opt_str(row, "symbol"),
            decimals: opt_i64(row, "decimals")?,
            amount: opt_f64(row, "amount")?,
            amount_usd: opt_f64(row, "amount_usd")?,
            tx_hash: req_str(row, "tx_hash")?,
            from_address: Address::new(req_str(row, "from_address")?),
            to_address: Address::new(req_str(row, "to_address")?),
            block_timestamp: req_timestamp(row, "block_timestamp")?,
        })
    }
}

// ============================================================================
// PART B: Label / Contract Schemas
// ============================================================================

/// Row of the curated label table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabelRow {
    pub address: Address,
    pub label: String,
    pub label_subtype: Option<String>,
    pub label_type: Option<String>,
}

impl TryFrom<&Row> for LabelRow {
    type Error = MalformedRecord;

    fn try_from(row: &Row) -> Result<Self, Self::Error> {
        Ok(Self {
            address: Address::new(req_str(row, "address")?),
            label: req_str(row, "label")?,
            label_subtype: opt_str(row, "label_subtype"),
            label_type: opt_str(row, "label_type"),
        })
    }
}

/// Row of the contract metadata table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContractRow {
    pub address: Address,
    pub name: Option<String>,
    /// Contract symbol, used as a display label when present
    pub label: Option<String>,
}

impl TryFrom<&Row> for ContractRow {
    type Error = MalformedRecord;

    fn try_from(row: &Row) -> Result<Self, Self::Error> {
        Ok(Self {
            address: Address::new(req_str(row, "address")?),
            name: opt_str(row, "name"),
            label: opt_str(row, "label"),
        })
    }
}

// ============================================================================
// PART C: Growth State
// ============================================================================

/// State tuple threaded by the caller between growth steps
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GrowState {
    /// Number of growth steps applied so far
    pub step: u32,

    /// Addresses to query in the next step
    pub frontier: BTreeSet<Address>,

    /// Addresses that must never re-enter the frontier
    pub exclusions: BTreeSet<Address>,

    pub labels: LabelMap,

    pub reverse_labels: ReverseLabelMap,

    /// Known contract accounts
    pub contracts: BTreeSet<Address>,

    /// Deduplicated union of every transfer seen so far
    #[serde(skip)]
    pub dataset: Vec<TransferRecord>,
}

impl GrowState {
    /// Fresh state rooted at `seeds`
    pub fn seeded(
        seeds: impl IntoIterator<Item = Address>,
        exclusions: impl IntoIterator<Item = Address>,
    ) -> Self {
        Self {
            frontier: seeds.into_iter().collect(),
            exclusions: exclusions.into_iter().collect(),
            ..Self::default()
        }
    }

    /// True once a step produced no further addresses to grow
    pub fn is_converged(&self) -> bool {
        self.frontier.is_empty()
    }
}

// ============================================================================
// Metadata Schema
// ============================================================================

/// Run metadata for reproducibility and auditing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub schema_version: String,

    pub run_timestamp: DateTime<Utc>,

    pub steps: u32,

    pub converged: bool,

    pub record_counts: RecordCounts,

    /// Git commit hash (if available)
    pub git_commit: Option<String>,

    pub grower_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RecordCounts {
    pub transfers: usize,
    pub labeled_addresses: usize,
    pub distinct_labels: usize,
    pub contracts: usize,
    pub exclusions: usize,
    pub frontier: usize,
}

impl RunMetadata {
    pub fn from_state(state: &GrowState) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            run_timestamp: Utc::now(),
            steps: state.step,
            converged: state.is_converged(),
            record_counts: RecordCounts {
                transfers: state.dataset.len(),
                labeled_addresses: state.labels.len(),
                distinct_labels: state.reverse_labels.len(),
                contracts: state.contracts.len(),
                exclusions: state.exclusions.len(),
                frontier: state.frontier.len(),
            },
            git_commit: get_git_commit(),
            grower_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

fn get_git_commit() -> Option<String> {
    std::process::Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .and_then(|output| {
            if output.status.success() {
                String::from_utf8(output.stdout)
                    .ok()
                    .map(|s| s.trim().to_string())
            } else {
                None
            }
        })
}

// ============================================================================
// Row field helpers
// ============================================================================

fn field<'a>(row: &'a Row, name: &str) -> Option<&'a Value> {
    row.get(name).filter(|v| !v.is_null())
}

fn opt_str(row: &Row, name: &str) -> Option<String> {
    match field(row, name)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::String(_) => None,
        other => Some(other.to_string()),
    }
}

fn req_str(row: &Row, name: &'static str) -> Result<String, MalformedRecord> {
    opt_str(row, name).ok_or(MalformedRecord::MissingField(name))
}

fn opt_f64(row: &Row, name: &'static str) -> Result<Option<f64>, MalformedRecord> {
    let Some(value) = field(row, name) else {
        return Ok(None);
    };
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.map(Some).ok_or_else(|| MalformedRecord::InvalidField {
        field: name,
        value: value.to_string(),
    })
}

fn opt_i64(row: &Row, name: &'static str) -> Result<Option<i64>, MalformedRecord> {
    let Some(value) = field(row, name) else {
        return Ok(None);
    };
    let parsed = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(integral)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(integral))
        }
        _ => None,
    };
    parsed.map(Some).ok_or_else(|| MalformedRecord::InvalidField {
        field: name,
        value: value.to_string(),
    })
}

/// `18.0` is fine, `0.5` is not an integer
fn integral(f: f64) -> Option<i64> {
    (f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64).then(|| f as i64)
}

fn req_timestamp(row: &Row, name: &'static str) -> Result<DateTime<Utc>, MalformedRecord> {
    let raw = req_str(row, name)?;
    parse_timestamp(&raw).ok_or(MalformedRecord::InvalidField { field: name, value: raw })
}

/// Parse the timestamp formats the ledger emits (RFC 3339 or naive UTC)
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}
