//! Frontier expansion over the ledger.
//!
//! One growth step queries transfers for the current frontier, classifies
//! every address it touches, folds the transfers into the accumulated
//! dataset and works out the next frontier. Steps are pure over
//! [`GrowState`]: the input state is borrowed and a new one is returned.
//!
//! The caller owns the loop. [`FrontierEngine::grow_until_converged`] is the
//! stock driver; it stops once a step returns an empty frontier.

use crate::classify::{classify, merge_contracts, real_labelled, reverse_labels, unlabelled};
use crate::ethereum::{Address, HexPrefixConvention, LabelConvention};
use crate::ledger::{LedgerClient, LedgerError, RecordSet, Row};
use crate::queries::{build_contract_query, build_label_query, build_transfer_query, RankBy};
use crate::schemas::{ContractRow, GrowState, LabelRow, MalformedRecord, TransferRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum GrowError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Per-step options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GrowOptions {
    /// Drop transfers whose token has no symbol
    #[serde(default = "default_true")]
    pub drop_spam: bool,

    /// Drop transfers of these token symbols
    #[serde(default)]
    pub spam_symbols: BTreeSet<String>,

    /// Row cap per transfer query
    #[serde(default = "default_connection_limit")]
    pub connection_limit: usize,

    /// Which transfers make the cut under `connection_limit`
    #[serde(default)]
    pub rank_by: RankBy,

    /// Stop growing through addresses that carry a real label
    #[serde(default = "default_true")]
    pub stop_at_label: bool,
}

fn default_true() -> bool {
    true
}

fn default_connection_limit() -> usize {
    500
}

impl Default for GrowOptions {
    fn default() -> Self {
        Self {
            drop_spam: true,
            spam_symbols: BTreeSet::new(),
            connection_limit: default_connection_limit(),
            rank_by: RankBy::default(),
            stop_at_label: true,
        }
    }
}

/// Where a growth step currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowPhase {
    Idle,
    QueryingTransfers,
    QueryingContracts,
    QueryingLabels,
    Merging,
    Done,
}

impl std::fmt::Display for GrowPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            GrowPhase::Idle => "idle",
            GrowPhase::QueryingTransfers => "querying_transfers",
            GrowPhase::QueryingContracts => "querying_contracts",
            GrowPhase::QueryingLabels => "querying_labels",
            GrowPhase::Merging => "merging",
            GrowPhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Why a transfer was filtered out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpamReason {
    NullSymbol,
    DenylistedSymbol,
    ZeroDecimals,
}

/// Counters for one growth step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepReport {
    /// Phases entered, in order
    pub phases: Vec<GrowPhase>,
    pub queried: usize,
    pub transfer_rows: usize,
    pub malformed: usize,
    pub null_symbol: usize,
    pub denylisted: usize,
    pub zero_decimals: usize,
    pub kept: usize,
    pub duplicates_removed: usize,
    pub contract_rows: usize,
    pub label_rows: usize,
}

impl StepReport {
    fn enter(&mut self, phase: GrowPhase) {
        debug!("Growth step phase -> {}", phase);
        self.phases.push(phase);
    }

    /// True if the step bailed out because nothing was left to query
    pub fn short_circuited(&self) -> bool {
        self.queried == 0
    }
}

/// Result of a growth step with its counters
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub state: GrowState,
    pub report: StepReport,
}

/// Classify a transfer as spam, if it is
pub fn spam_reason(record: &TransferRecord, options: &GrowOptions) -> Option<SpamReason> {
    if record.decimals == Some(0) {
        return Some(SpamReason::ZeroDecimals);
    }
    match &record.symbol {
        None if options.drop_spam => Some(SpamReason::NullSymbol),
        Some(symbol) if options.spam_symbols.contains(symbol) => Some(SpamReason::DenylistedSymbol),
        _ => None,
    }
}

/// Append `new` to `accumulated`, keeping the last merged copy of each tx hash.
///
/// Returns the merged dataset and how many duplicates were removed.
pub fn merge_dataset(
    accumulated: &[TransferRecord],
    new: Vec<TransferRecord>,
) -> (Vec<TransferRecord>, usize) {
    let combined: Vec<TransferRecord> = accumulated.iter().cloned().chain(new).collect();
    let total = combined.len();

    let mut seen = HashSet::new();
    let mut deduped: Vec<TransferRecord> = combined
        .into_iter()
        .rev()
        .filter(|t| seen.insert(t.tx_hash.clone()))
        .collect();
    deduped.reverse();

    let removed = total - deduped.len();
    (deduped, removed)
}

/// Parse rows into typed records, dropping malformed ones
fn parse_rows<T>(rows: Option<RecordSet>, what: &str, malformed: &mut usize) -> Vec<T>
where
    T: for<'a> TryFrom<&'a Row, Error = MalformedRecord>,
{
    let rows = rows.unwrap_or_default();
    let mut parsed = Vec::with_capacity(rows.len());
    for row in &rows {
        match T::try_from(row) {
            Ok(record) => parsed.push(record),
            Err(e) => {
                *malformed += 1;
                warn!("Dropping malformed {} row: {}", what, e);
            }
        }
    }
    parsed
}

/// Drives growth steps against a ledger.
pub struct FrontierEngine<C> {
    client: C,
    convention: Box<dyn LabelConvention>,
}

impl<C: LedgerClient> FrontierEngine<C> {
    /// Engine using the `0x` hex-prefix label convention
    pub fn new(client: C) -> Self {
        Self::with_convention(client, HexPrefixConvention::default())
    }

    pub fn with_convention(client: C, convention: impl LabelConvention + 'static) -> Self {
        Self {
            client,
            convention: Box::new(convention),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Run one growth step and return the next state
    pub async fn grow_step(
        &self,
        state: &GrowState,
        options: &GrowOptions,
    ) -> Result<GrowState, GrowError> {
        self.grow_step_with_report(state, options)
            .await
            .map(|outcome| outcome.state)
    }

    /// Run one growth step, returning the next state and its counters
    pub async fn grow_step_with_report(
        &self,
        state: &GrowState,
        options: &GrowOptions,
    ) -> Result<StepOutcome, GrowError> {
        let mut report = StepReport::default();
        report.enter(GrowPhase::Idle);

        let queried: BTreeSet<Address> = state
            .frontier
            .difference(&state.exclusions)
            .cloned()
            .collect();
        report.queried = queried.len();

        if queried.is_empty() {
            info!(
                "Step {}: frontier exhausted ({} excluded), nothing to grow",
                state.step + 1,
                state.frontier.len()
            );
            let mut next = state.clone();
            next.frontier.clear();
            report.enter(GrowPhase::Done);
            return Ok(StepOutcome { state: next, report });
        }

        info!(
            "=== Step {}: growing from {} addresses ({} filtered by exclusions) ===",
            state.step + 1,
            queried.len(),
            state.frontier.len() - queried.len()
        );

        report.enter(GrowPhase::QueryingTransfers);
        let transfer_query =
            build_transfer_query(&queried, options.connection_limit, options.rank_by);
        let transfer_rows = self.client.execute(&transfer_query).await?;

        let mut labels = state.labels.clone();
        let mut contracts = state.contracts.clone();
        let mut dataset = state.dataset.clone();

        match transfer_rows {
            None => {
                info!("No transfers found, keeping prior labels, contracts and dataset");
            }
            Some(rows) => {
                report.transfer_rows = rows.len();
                let survivors = self.filter_transfers(rows, options, &mut report);

                let candidates: BTreeSet<Address> = survivors
                    .iter()
                    .flat_map(|t| t.endpoints())
                    .cloned()
                    .collect();
                debug!("{} candidate addresses to classify", candidates.len());

                let (contract_rows, label_rows) = if candidates.is_empty() {
                    (Vec::new(), Vec::new())
                } else {
                    report.enter(GrowPhase::QueryingContracts);
                    let rows = self.client.execute(&build_contract_query(&candidates)).await?;
                    let contract_rows: Vec<ContractRow> =
                        parse_rows(rows, "contract", &mut report.malformed);

                    report.enter(GrowPhase::QueryingLabels);
                    let rows = self.client.execute(&build_label_query(&candidates)).await?;
                    let label_rows: Vec<LabelRow> =
                        parse_rows(rows, "label", &mut report.malformed);

                    (contract_rows, label_rows)
                };
                report.contract_rows = contract_rows.len();
                report.label_rows = label_rows.len();

                report.enter(GrowPhase::Merging);
                labels = classify(
                    &survivors,
                    &contract_rows,
                    &label_rows,
                    &state.labels,
                    self.convention.as_ref(),
                );
                contracts = merge_contracts(&state.contracts, &contract_rows);

                let (merged, removed) = merge_dataset(&state.dataset, survivors);
                dataset = merged;
                report.duplicates_removed = removed;
            }
        }

        if report.phases.last() != Some(&GrowPhase::Merging) {
            report.enter(GrowPhase::Merging);
        }

        let mut exclusions = state.exclusions.clone();
        exclusions.extend(queried.iter().cloned());
        if options.stop_at_label {
            exclusions.extend(real_labelled(&labels, self.convention.as_ref()).cloned());
        }

        let frontier: BTreeSet<Address> = unlabelled(&labels, self.convention.as_ref())
            .filter(|a| !queried.contains(*a))
            .filter(|a| !exclusions.contains(*a))
            .filter(|a| !contracts.contains(*a))
            .cloned()
            .collect();

        let reverse = reverse_labels(&labels);

        info!(
            "Step {} done: {} transfers kept ({} total), {} labels, {} contracts, {} excluded, next frontier {}",
            state.step + 1,
            report.kept,
            dataset.len(),
            labels.len(),
            contracts.len(),
            exclusions.len(),
            frontier.len()
        );
        report.enter(GrowPhase::Done);

        Ok(StepOutcome {
            state: GrowState {
                step: state.step + 1,
                frontier,
                exclusions,
                labels,
                reverse_labels: reverse,
                contracts,
                dataset,
            },
            report,
        })
    }

    /// Repeat growth steps until the frontier is empty or `max_steps` ran.
    ///
    /// `on_step` sees every intermediate state, e.g. to checkpoint it.
    pub async fn grow_until_converged<E, F>(
        &self,
        mut state: GrowState,
        options: &GrowOptions,
        max_steps: u32,
        mut on_step: F,
    ) -> Result<GrowState, E>
    where
        E: From<GrowError>,
        F: FnMut(&GrowState, &StepReport) -> Result<(), E>,
    {
        for _ in 0..max_steps {
            if state.is_converged() {
                break;
            }
            let outcome = self.grow_step_with_report(&state, options).await?;
            on_step(&outcome.state, &outcome.report)?;
            state = outcome.state;
        }

        if state.is_converged() {
            info!("Converged after {} steps", state.step);
        } else {
            warn!(
                "Stopped after {} steps with {} addresses still on the frontier",
                max_steps,
                state.frontier.len()
            );
        }
        Ok(state)
    }

    fn filter_transfers(
        &self,
        rows: RecordSet,
        options: &GrowOptions,
        report: &mut StepReport,
    ) -> Vec<TransferRecord> {
        let records: Vec<TransferRecord> =
            parse_rows(Some(rows), "transfer", &mut report.malformed);

        let mut survivors = Vec::with_capacity(records.len());
        for record in records {
            match spam_reason(&record, options) {
                Some(SpamReason::NullSymbol) => report.null_symbol += 1,
                Some(SpamReason::DenylistedSymbol) => report.denylisted += 1,
                Some(SpamReason::ZeroDecimals) => report.zero_decimals += 1,
                None => survivors.push(record),
            }
        }
        report.kept = survivors.len();

        debug!(
            "Transfer filter: {} rows -> {} kept ({} malformed, {} null symbol, {} denylisted, {} zero decimals)",
            report.transfer_rows,
            report.kept,
            report.malformed,
            report.null_symbol,
            report.denylisted,
            report.zero_decimals
        );

        survivors
    }
}
