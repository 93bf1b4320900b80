//! Flipside JSON-RPC ledger client with rate limiting and bounded retry.
//!
//! A query goes through three calls:
//! - `createQueryRun` submits the SQL and returns a run id
//! - `getQueryRun` is polled until the run reaches a terminal state
//! - `getQueryRunResults` is paged until every row has been read
//!
//! Transient transport failures (network errors, HTTP 429/5xx) are retried
//! with exponential backoff up to `max_retries`. Everything else, including a
//! failed query run, is surfaced to the caller as a [`LedgerError`].

use crate::config::{LedgerConfig, RateLimitConfig};
use crate::ledger::{LedgerClient, LedgerError, RecordSet, Row};
use crate::queries::LedgerQuery;
use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// JSON-RPC request structure
#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a, P: Serialize> {
    jsonrpc: &'static str,
    method: &'a str,
    params: P,
    id: u64,
}

/// JSON-RPC response structure
#[derive(Debug, Deserialize)]
struct JsonRpcResponse<R> {
    result: Option<R>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryRun {
    id: String,
    state: String,
    error_name: Option<String>,
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryRunEnvelope {
    query_run: QueryRun,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultsPage {
    #[serde(default)]
    column_names: Vec<String>,
    #[serde(default)]
    rows: Option<Vec<Value>>,
    page: Option<PageInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    current_page_number: u32,
    total_pages: u32,
    total_rows: Option<u64>,
}

/// Lifecycle of a query run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Success,
    Failed,
    Canceled,
}

impl RunState {
    pub fn parse(state: &str) -> Self {
        match state {
            "QUERY_STATE_SUCCESS" => RunState::Success,
            "QUERY_STATE_FAILED" => RunState::Failed,
            "QUERY_STATE_CANCELED" => RunState::Canceled,
            // READY, RUNNING, STREAMING_RESULTS
            _ => RunState::Pending,
        }
    }
}

/// Rate-limited Flipside client.
pub struct FlipsideClient {
    client: reqwest::Client,
    config: LedgerConfig,
    rate_limits: RateLimitConfig,
    rate_limiter: RateLimiter<
        governor::state::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
    request_id: AtomicU64,
}

impl FlipsideClient {
    pub fn new(config: LedgerConfig, rate_limits: RateLimitConfig) -> Result<Self, LedgerError> {
        let quota = Quota::per_second(
            NonZeroU32::new(rate_limits.requests_per_second).unwrap_or(NonZeroU32::MIN),
        );
        let rate_limiter = RateLimiter::direct(quota);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .pool_max_idle_per_host(4)
            .tcp_keepalive(Duration::from_secs(30))
            .user_agent(concat!("eth-graph-grower/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            config,
            rate_limits,
            rate_limiter,
            request_id: AtomicU64::new(1),
        })
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// HTTP statuses worth retrying
    fn is_transient_status(status: u16) -> bool {
        status == 429 || (500..600).contains(&status)
    }

    /// Make a single RPC call, retrying transient transport failures.
    async fn call<P: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        params: P,
    ) -> Result<R, LedgerError> {
        let mut delay = Duration::from_millis(self.rate_limits.base_delay_ms);
        let max_delay = Duration::from_secs(30);
        let max_retries = self.rate_limits.max_retries;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            self.rate_limiter.until_ready().await;

            let request = JsonRpcRequest {
                jsonrpc: "2.0",
                method,
                params: &params,
                id: self.next_id(),
            };

            let send_result = self
                .client
                .post(&self.config.base_url)
                .header("x-api-key", &self.config.api_key)
                .json(&request)
                .send()
                .await;

            let response = match send_result {
                Ok(resp) => resp,
                Err(e) if attempt <= max_retries => {
                    warn!(
                        "[attempt {}] Network error on {}: {}, retrying in {:?}",
                        attempt, method, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(max_delay);
                    continue;
                }
                Err(e) => return Err(LedgerError::Http(e)),
            };

            let status = response.status().as_u16();
            if Self::is_transient_status(status) {
                if attempt > max_retries {
                    return Err(LedgerError::RateLimitExceeded(max_retries));
                }
                warn!(
                    "[attempt {}] HTTP {} on {}, retrying in {:?}",
                    attempt, status, method, delay
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(max_delay);
                continue;
            }

            let response = response.error_for_status()?;
            let json_response: JsonRpcResponse<R> = response.json().await?;

            if let Some(error) = json_response.error {
                return Err(LedgerError::JsonRpc {
                    code: error.code,
                    message: error.message,
                });
            }

            return json_response.result.ok_or_else(|| {
                LedgerError::InvalidResponse(format!("missing result in {} response", method))
            });
        }
    }

    /// Submit `sql` and return the query run id
    async fn create_query_run(&self, sql: &str) -> Result<String, LedgerError> {
        let params = [json!({
            "resultTTLHours": self.config.result_ttl_hours,
            "maxAgeMinutes": self.config.max_age_minutes,
            "sql": sql,
            "tags": { "source": "eth-graph-grower" },
            "dataSource": "snowflake-default",
            "dataProvider": "flipside"
        })];
        let envelope: QueryRunEnvelope = self.call("createQueryRun", params).await?;
        debug!(
            "Created query run {} (state {})",
            envelope.query_run.id, envelope.query_run.state
        );
        Ok(envelope.query_run.id)
    }

    /// Poll until the run finishes, fails, or exceeds the configured timeout
    async fn wait_for_run(&self, run_id: &str) -> Result<(), LedgerError> {
        let started = Instant::now();
        let timeout = Duration::from_secs(self.config.query_timeout_secs);
        let poll = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            let envelope: QueryRunEnvelope = self
                .call("getQueryRun", [json!({ "queryRunId": run_id })])
                .await?;
            let run = envelope.query_run;

            match RunState::parse(&run.state) {
                RunState::Success => {
                    debug!("Query run {} finished in {:?}", run_id, started.elapsed());
                    return Ok(());
                }
                RunState::Failed | RunState::Canceled => {
                    return Err(LedgerError::QueryFailed {
                        run_id: run_id.to_string(),
                        state: run.state,
                        message: run
                            .error_message
                            .or(run.error_name)
                            .unwrap_or_else(|| "no error message".to_string()),
                    });
                }
                RunState::Pending => {}
            }

            if started.elapsed() >= timeout {
                if let Err(e) = self
                    .call::<_, Value>("cancelQueryRun", [json!({ "queryRunId": run_id })])
                    .await
                {
                    warn!("Failed to cancel timed-out query run {}: {}", run_id, e);
                }
                return Err(LedgerError::Timeout {
                    run_id: run_id.to_string(),
                    secs: self.config.query_timeout_secs,
                });
            }

            tokio::time::sleep(poll).await;
        }
    }

    /// Read every result page of a finished run
    async fn fetch_results(&self, run_id: &str) -> Result<RecordSet, LedgerError> {
        let mut records = RecordSet::new();
        let mut page_number: u32 = 1;

        loop {
            let params = [json!({
                "queryRunId": run_id,
                "format": "json",
                "page": { "number": page_number, "size": self.config.page_size }
            })];
            let page: ResultsPage = self.call("getQueryRunResults", params).await?;

            let rows = page.rows.unwrap_or_default();
            records.extend(rows_to_records(&page.column_names, rows)?);

            match page.page {
                Some(info) if info.current_page_number < info.total_pages => {
                    debug!(
                        "Run {} page {}/{}: {} rows so far (total {:?})",
                        run_id,
                        info.current_page_number,
                        info.total_pages,
                        records.len(),
                        info.total_rows
                    );
                    page_number = info.current_page_number + 1;
                }
                _ => break,
            }
        }

        Ok(records)
    }
}

/// Turn result rows into keyed records.
///
/// Rows may arrive as objects (already keyed) or as positional arrays that
/// line up with `column_names`. Column names are lowercased either way.
pub fn rows_to_records(column_names: &[String], rows: Vec<Value>) -> Result<RecordSet, LedgerError> {
    rows.into_iter()
        .map(|row| match row {
            Value::Object(map) => Ok(map
                .into_iter()
                .map(|(k, v)| (k.to_lowercase(), v))
                .collect::<Row>()),
            Value::Array(values) => {
                if values.len() != column_names.len() {
                    return Err(LedgerError::InvalidResponse(format!(
                        "row has {} values but {} columns",
                        values.len(),
                        column_names.len()
                    )));
                }
                Ok(column_names
                    .iter()
                    .map(|c| c.to_lowercase())
                    .zip(values)
                    .collect::<Row>())
            }
            other => Err(LedgerError::InvalidResponse(format!(
                "unexpected row shape: {}",
                other
            ))),
        })
        .collect()
}

#[async_trait]
impl LedgerClient for FlipsideClient {
    async fn execute(&self, query: &LedgerQuery) -> Result<Option<RecordSet>, LedgerError> {
        info!(
            "Running {} query for {} addresses",
            query.kind,
            query.addresses.len()
        );

        let run_id = self.create_query_run(&query.sql).await?;
        self.wait_for_run(&run_id).await?;
        let records = self.fetch_results(&run_id).await?;

        info!("{} query returned {} rows", query.kind, records.len());

        Ok(if records.is_empty() { None } else { Some(records) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state_parse() {
        assert_eq!(RunState::parse("QUERY_STATE_SUCCESS"), RunState::Success);
        assert_eq!(RunState::parse("QUERY_STATE_FAILED"), RunState::Failed);
        assert_eq!(RunState::parse("QUERY_STATE_CANCELED"), RunState::Canceled);
        assert_eq!(RunState::parse("QUERY_STATE_RUNNING"), RunState::Pending);
        assert_eq!(RunState::parse("QUERY_STATE_READY"), RunState::Pending);
    }

    #[test]
    fn test_is_transient_status() {
        assert!(FlipsideClient::is_transient_status(429));
        assert!(FlipsideClient::is_transient_status(503));
        assert!(!FlipsideClient::is_transient_status(400));
        assert!(!FlipsideClient::is_transient_status(200));
    }

    #[test]
    fn test_positional_rows() {
        let columns = vec!["ADDRESS".to_string(), "LABEL".to_string()];
        let rows = vec![json!(["0xb", "Binance"]), json!(["0xc", null])];
        let records = rows_to_records(&columns, rows).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["label"], "Binance");
        assert!(records[1]["label"].is_null());
    }

    #[test]
    fn test_object_rows() {
        let rows = vec![json!({"Address": "0xb", "label": "Binance"})];
        let records = rows_to_records(&[], rows).unwrap();
        assert_eq!(records[0]["address"], "0xb");
    }

    #[test]
    fn test_ragged_rows_rejected() {
        let columns = vec!["address".to_string()];
        let rows = vec![json!(["0xb", "extra"])];
        assert!(matches!(
            rows_to_records(&columns, rows),
            Err(LedgerError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_results_page_decoding() {
        let raw = json!({
            "columnNames": ["tx_hash"],
            "columnTypes": ["string"],
            "rows": [["0x1"]],
            "page": {"currentPageNumber": 1, "currentPageSize": 1, "totalRows": 1, "totalPages": 1}
        });
        let page: ResultsPage = serde_json::from_value(raw).unwrap();
        assert_eq!(page.column_names, vec!["tx_hash"]);
        let info = page.page.unwrap();
        assert_eq!(info.total_pages, 1);
        assert_eq!(info.total_rows, Some(1));
    }
}
