//! Persist and restore the growth state between runs.
//!
//! Layout of a checkpoint directory:
//! - `state.json`: step, frontier, exclusions, labels, contracts
//! - `transfers.parquet`: the accumulated transfer dataset, in merge order
//! - `run_metadata.json`: record counts and provenance of the last save

use crate::ethereum::Address;
use crate::schemas::{parse_timestamp, GrowState, RunMetadata, TransferRecord};
use polars::prelude::*;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

pub const STATE_FILE: &str = "state.json";
pub const TRANSFERS_FILE: &str = "transfers.parquet";
pub const METADATA_FILE: &str = "run_metadata.json";

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Polars error: {0}")]
    Polars(#[from] PolarsError),

    #[error("Corrupt transfer row {row}: {reason}")]
    CorruptRow { row: usize, reason: String },

    #[error("No checkpoint found in {0:?}")]
    NotFound(PathBuf),
}

/// A checkpoint directory
#[derive(Debug, Clone)]
pub struct Checkpoint {
    dir: PathBuf,
}

impl Checkpoint {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn transfers_path(&self) -> PathBuf {
        self.dir.join(TRANSFERS_FILE)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    pub fn exists(&self) -> bool {
        self.state_path().exists()
    }

    /// Write the full state, returning the metadata that was recorded
    pub fn save(&self, state: &GrowState) -> Result<RunMetadata, CheckpointError> {
        std::fs::create_dir_all(&self.dir)?;

        write_transfers_parquet(&state.dataset, &self.transfers_path())?;

        // state.json is written last so a readable state always has its dataset
        let tmp = self.dir.join(format!("{}.tmp", STATE_FILE));
        std::fs::write(&tmp, serde_json::to_string_pretty(state)?)?;
        std::fs::rename(&tmp, self.state_path())?;

        let metadata = RunMetadata::from_state(state);
        std::fs::write(self.metadata_path(), serde_json::to_string_pretty(&metadata)?)?;

        info!(
            "Checkpointed step {} to {:?} ({} transfers, {} on frontier)",
            state.step,
            self.dir,
            state.dataset.len(),
            state.frontier.len()
        );
        Ok(metadata)
    }

    /// Restore a state written by [`Checkpoint::save`]
    pub fn load(&self) -> Result<GrowState, CheckpointError> {
        if !self.exists() {
            return Err(CheckpointError::NotFound(self.dir.clone()));
        }

        let contents = std::fs::read_to_string(self.state_path())?;
        let mut state: GrowState = serde_json::from_str(&contents)?;

        let transfers = self.transfers_path();
        if transfers.exists() {
            state.dataset = read_transfers_parquet(&transfers)?;
        }

        info!(
            "Resumed step {} from {:?} ({} transfers, {} on frontier)",
            state.step,
            self.dir,
            state.dataset.len(),
            state.frontier.len()
        );
        Ok(state)
    }

    pub fn load_metadata(&self) -> Result<RunMetadata, CheckpointError> {
        let path = self.metadata_path();
        if !path.exists() {
            return Err(CheckpointError::NotFound(self.dir.clone()));
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

/// Write transfers to Parquet, preserving their order
pub fn write_transfers_parquet(
    transfers: &[TransferRecord],
    output_path: &Path,
) -> Result<(), CheckpointError> {
    debug!("Writing {} transfers to {:?}", transfers.len(), output_path);

    let symbols: Vec<Option<&str>> = transfers.iter().map(|t| t.symbol.as_deref()).collect();
    let decimals: Vec<Option<i64>> = transfers.iter().map(|t| t.decimals).collect();
    let amounts: Vec<Option<f64>> = transfers.iter().map(|t| t.amount).collect();
    let amounts_usd: Vec<Option<f64>> = transfers.iter().map(|t| t.amount_usd).collect();
    let tx_hashes: Vec<&str> = transfers.iter().map(|t| t.tx_hash.as_str()).collect();
    let from_addrs: Vec<&str> = transfers.iter().map(|t| t.from_address.as_str()).collect();
    let to_addrs: Vec<&str> = transfers.iter().map(|t| t.to_address.as_str()).collect();
    let timestamps: Vec<String> = transfers
        .iter()
        .map(|t| t.block_timestamp.to_rfc3339())
        .collect();

    let mut df = DataFrame::new(vec![
        Column::new("symbol".into(), symbols),
        Column::new("decimals".into(), decimals),
        Column::new("amount".into(), amounts),
        Column::new("amount_usd".into(), amounts_usd),
        Column::new("tx_hash".into(), tx_hashes),
        Column::new("from_address".into(), from_addrs),
        Column::new("to_address".into(), to_addrs),
        Column::new("block_timestamp".into(), timestamps),
    ])?;

    let file = std::fs::File::create(output_path)?;
    ParquetWriter::new(file)
        .with_compression(ParquetCompression::Zstd(None))
        .finish(&mut df)?;

    Ok(())
}

/// Read transfers written by [`write_transfers_parquet`]
pub fn read_transfers_parquet(path: &Path) -> Result<Vec<TransferRecord>, CheckpointError> {
    let file = std::fs::File::open(path)?;
    let df = ParquetReader::new(file).finish()?;

    let symbols = df.column("symbol")?.str()?;
    let decimals = df.column("decimals")?.i64()?;
    let amounts = df.column("amount")?.f64()?;
    let amounts_usd = df.column("amount_usd")?.f64()?;
    let tx_hashes = df.column("tx_hash")?.str()?;
    let from_addrs = df.column("from_address")?.str()?;
    let to_addrs = df.column("to_address")?.str()?;
    let timestamps = df.column("block_timestamp")?.str()?;

    let mut result = Vec::with_capacity(df.height());

    for i in 0..df.height() {
        let corrupt = |reason: &str| CheckpointError::CorruptRow {
            row: i,
            reason: reason.to_string(),
        };

        let raw_ts = timestamps.get(i).ok_or_else(|| corrupt("missing block_timestamp"))?;
        result.push(TransferRecord {
            symbol: symbols.get(i).map(String::from),
            decimals: decimals.get(i),
            amount: amounts.get(i),
            amount_usd: amounts_usd.get(i),
            tx_hash: tx_hashes
                .get(i)
                .ok_or_else(|| corrupt("missing tx_hash"))?
                .to_string(),
            from_address: Address::new(
                from_addrs.get(i).ok_or_else(|| corrupt("missing from_address"))?,
            ),
            to_address: Address::new(
                to_addrs.get(i).ok_or_else(|| corrupt("missing to_address"))?,
            ),
            block_timestamp: parse_timestamp(raw_ts)
                .ok_or_else(|| corrupt("unparseable block_timestamp"))?,
        });
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::reverse_labels;
    use chrono::{TimeZone, Utc};

    fn transfer(hash: &str, symbol: Option<&str>, usd: Option<f64>) -> TransferRecord {
        TransferRecord {
            symbol: symbol.map(String::from),
            decimals: symbol.map(|_| 18),
            amount: Some(2.5),
            amount_usd: usd,
            tx_hash: hash.into(),
            from_address: Address::new("0xAbC0000000000000000000000000000000000001"),
            to_address: Address::new("0xdef0000000000000000000000000000000000002"),
            block_timestamp: Utc.with_ymd_and_hms(2022, 11, 8, 18, 37, 47).unwrap(),
        }
    }

    fn sample_state() -> GrowState {
        let mut state = GrowState::seeded(
            [Address::new("0xdef0000000000000000000000000000000000002")],
            [Address::new("0xAbC0000000000000000000000000000000000001")],
        );
        state.step = 2;
        state
            .labels
            .insert(Address::new("0xAbC0000000000000000000000000000000000001"), "Binance".into());
        state.reverse_labels = reverse_labels(&state.labels);
        state
            .contracts
            .insert(Address::new("0x9990000000000000000000000000000000000009"));
        // Order matters: later copies win on dedup
        state.dataset = vec![
            transfer("h2", Some("ETH"), Some(10.0)),
            transfer("h1", None, None),
        ];
        state
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = Checkpoint::new(dir.path().join("run"));
        assert!(!checkpoint.exists());

        let state = sample_state();
        let metadata = checkpoint.save(&state).unwrap();
        assert_eq!(metadata.steps, 2);
        assert_eq!(metadata.record_counts.transfers, 2);

        let loaded = checkpoint.load().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.dataset[0].tx_hash, "h2");
        assert!(loaded.dataset[1].symbol.is_none());
        assert_eq!(
            loaded.dataset[0].from_address.as_str(),
            "0xAbC0000000000000000000000000000000000001"
        );
    }

    #[test]
    fn test_empty_dataset_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = Checkpoint::new(dir.path());
        let state = GrowState::seeded([Address::new("0xa")], std::iter::empty());

        checkpoint.save(&state).unwrap();
        let loaded = checkpoint.load().unwrap();
        assert!(loaded.dataset.is_empty());
        assert_eq!(loaded.frontier, state.frontier);
    }

    #[test]
    fn test_load_missing() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = Checkpoint::new(dir.path());
        assert!(matches!(checkpoint.load(), Err(CheckpointError::NotFound(_))));
    }

    #[test]
    fn test_metadata_written() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = Checkpoint::new(dir.path());
        checkpoint.save(&sample_state()).unwrap();

        let metadata = checkpoint.load_metadata().unwrap();
        assert_eq!(metadata.record_counts.contracts, 1);
        assert!(!metadata.converged);
    }
}
