//! SQL builders for the three ledger query shapes.
//!
//! All queries are read-only and target the `ethereum.core` schema. Address
//! sets are lowercased and rendered as a parenthesised membership list, so a
//! single address never degrades into a scalar comparison.

use crate::ethereum::Address;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Which query shape a [`LedgerQuery`] carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Transfers,
    Labels,
    Contracts,
}

impl std::fmt::Display for QueryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryKind::Transfers => write!(f, "transfers"),
            QueryKind::Labels => write!(f, "labels"),
            QueryKind::Contracts => write!(f, "contracts"),
        }
    }
}

/// Column used to pick which transfers survive the row limit
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RankBy {
    /// Largest USD value first
    #[default]
    AmountUsd,
    /// Largest raw token amount first
    Amount,
    /// Most recent transfer first
    BlockTimestamp,
}

impl RankBy {
    pub fn column(&self) -> &'static str {
        match self {
            RankBy::AmountUsd => "amount_usd",
            RankBy::Amount => "amount",
            RankBy::BlockTimestamp => "block_timestamp",
        }
    }
}

impl FromStr for RankBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "amount_usd" => Ok(RankBy::AmountUsd),
            "amount" => Ok(RankBy::Amount),
            "block_timestamp" => Ok(RankBy::BlockTimestamp),
            other => Err(format!(
                "unknown rank column '{}' (expected amount_usd, amount or block_timestamp)",
                other
            )),
        }
    }
}

/// A query ready for the ledger.
///
/// `sql` is what gets executed; `kind` and `addresses` describe it so that
/// offline ledgers can answer without parsing SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerQuery {
    pub kind: QueryKind,
    /// Lowercased addresses the query filters on
    pub addresses: Vec<String>,
    /// Row cap, transfers only
    pub limit: Option<usize>,
    /// Ordering applied before `limit`, largest first with nulls last
    pub rank_by: Option<RankBy>,
    pub sql: String,
}

/// Lowercase, quote-escape and sort an address set for rendering
fn normalized_addresses<'a>(addresses: impl IntoIterator<Item = &'a Address>) -> Vec<String> {
    let mut out: Vec<String> = addresses
        .into_iter()
        .map(|a| a.normalized().replace('\'', "''"))
        .collect();
    out.sort();
    out.dedup();
    out
}

/// Render a SQL membership list: `('a')`, `('a', 'b')`, or `(NULL)` when empty
pub fn to_lowercase_tuple(addresses: &[String]) -> String {
    if addresses.is_empty() {
        return "(NULL)".to_string();
    }
    let quoted: Vec<String> = addresses.iter().map(|a| format!("'{}'", a)).collect();
    format!("({})", quoted.join(", "))
}

/// Transfers touching any of `addresses`, token and native ETH, top `limit` by `rank_by`
pub fn build_transfer_query<'a>(
    addresses: impl IntoIterator<Item = &'a Address>,
    limit: usize,
    rank_by: RankBy,
) -> LedgerQuery {
    let addresses = normalized_addresses(addresses);
    let members = to_lowercase_tuple(&addresses);
    let rank = rank_by.column();

    let sql = format!(
        r#"
    WITH
    tokens_from AS
    (
        SELECT  symbol,
                decimals,
                amount,
                amount_usd,
                tx_hash,
                from_address,
                to_address,
                block_timestamp
        FROM ethereum.core.ez_token_transfers
        WHERE lower(from_address) IN {members}
    ),

    tokens_to AS
    (
        SELECT  symbol,
                decimals,
                amount,
                amount_usd,
                tx_hash,
                from_address,
                to_address,
                block_timestamp
        FROM ethereum.core.ez_token_transfers
        WHERE lower(to_address) IN {members}
    ),

    eth_from AS
    (
        SELECT  'ETH' AS symbol,
                18 AS decimals,
                amount,
                amount_usd,
                tx_hash,
                eth_from_address AS from_address,
                eth_to_address AS to_address,
                block_timestamp
        FROM ethereum.core.ez_eth_transfers
        WHERE lower(eth_from_address) IN {members}
    ),

    eth_to AS
    (
        SELECT  'ETH' AS symbol,
                18 AS decimals,
                amount,
                amount_usd,
                tx_hash,
                eth_from_address AS from_address,
                eth_to_address AS to_address,
                block_timestamp
        FROM ethereum.core.ez_eth_transfers
        WHERE lower(eth_to_address) IN {members}
    ),

    tokens AS
    (
      SELECT * FROM tokens_from
      UNION ALL
      SELECT * FROM tokens_to
    ),

    eth AS
    (
      SELECT * FROM eth_from
      UNION ALL
      SELECT * FROM eth_to
    )

    SELECT DISTINCT * FROM tokens
    UNION ALL
    SELECT DISTINCT * FROM eth
    ORDER BY {rank} DESC NULLS LAST
    LIMIT {limit}
    "#
    );

    LedgerQuery {
        kind: QueryKind::Transfers,
        addresses,
        limit: Some(limit),
        rank_by: Some(rank_by),
        sql,
    }
}

/// Curated labels for `addresses`
pub fn build_label_query<'a>(addresses: impl IntoIterator<Item = &'a Address>) -> LedgerQuery {
    let addresses = normalized_addresses(addresses);
    let sql = format!(
        r#"
    SELECT address, label, label_subtype, label_type
    FROM ethereum.core.dim_labels
    WHERE lower(address) IN {}
    "#,
        to_lowercase_tuple(&addresses)
    );
    LedgerQuery {
        kind: QueryKind::Labels,
        addresses,
        limit: None,
        rank_by: None,
        sql,
    }
}

/// Contract metadata for `addresses`; the contract symbol doubles as a label
pub fn build_contract_query<'a>(addresses: impl IntoIterator<Item = &'a Address>) -> LedgerQuery {
    let addresses = normalized_addresses(addresses);
    let sql = format!(
        r#"
    SELECT address, name, symbol AS label
    FROM ethereum.core.dim_contracts
    WHERE lower(address) IN {}
    "#,
        to_lowercase_tuple(&addresses)
    );
    LedgerQuery {
        kind: QueryKind::Contracts,
        addresses,
        limit: None,
        rank_by: None,
        sql,
    }
}
