//! Ethereum Transfer Graph Grower
//!
//! Grows a transfer graph outward from seed addresses, one frontier at a
//! time, until it reaches addresses with known real-world labels.
//!
//! # Components
//!
//! 1. **Query builder** ([`queries`]): SQL for transfers, labels and contracts
//! 2. **Ledger boundary** ([`ledger`], [`rpc`]): the `LedgerClient` trait, an
//!    in-memory ledger and the Flipside JSON-RPC client
//! 3. **Classifier** ([`classify`]): picks a display label for every address
//! 4. **Frontier engine** ([`grow`]): one pure growth step over [`GrowState`]
//! 5. **Checkpointing** ([`checkpoint`]): state JSON plus transfers Parquet
//! 6. **Renderer** ([`render`]): label-level graph as vis-network HTML
//!
//! # Example
//!
//! ```no_run
//! use eth_graph_grower::ethereum::Address;
//! use eth_graph_grower::grow::{FrontierEngine, GrowOptions};
//! use eth_graph_grower::ledger::MemoryLedger;
//! use eth_graph_grower::schemas::GrowState;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let ledger = MemoryLedger::from_json_file("ledger.json".as_ref())?;
//!     let engine = FrontierEngine::new(ledger);
//!     let seeds = [Address::new("0x28c6c06298d514db089934071355e5743bf21d60")];
//!     let state = GrowState::seeded(seeds, std::iter::empty());
//!     let next = engine.grow_step(&state, &GrowOptions::default()).await?;
//!     println!("Next frontier has {} addresses", next.frontier.len());
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod classify;
pub mod config;
pub mod ethereum;
pub mod grow;
pub mod ledger;
pub mod queries;
pub mod render;
pub mod rpc;
pub mod schemas;

// Re-export commonly used types
pub use config::GrowerConfig;
pub use grow::{FrontierEngine, GrowOptions};
pub use ledger::{LedgerClient, MemoryLedger};
pub use schemas::{GrowState, RunMetadata, TransferRecord};
