//! Address classification.
//!
//! Turns raw label and contract rows into a display label for every address
//! seen in a batch of transfers. Precedence, highest first:
//! 1. labels already known from earlier steps (sticky, never overwritten)
//! 2. curated label rows
//! 3. contract rows that carry a label
//! 4. a synthetic short label derived from the address

use crate::ethereum::{Address, LabelConvention};
use crate::schemas::{ContractRow, LabelMap, LabelRow, ReverseLabelMap, TransferRecord};
use std::collections::BTreeSet;

/// Label every endpoint of `transfers`, keeping `prior` entries untouched.
///
/// The result also carries every prior entry, so it is the complete label
/// map for the next state.
pub fn classify(
    transfers: &[TransferRecord],
    contract_rows: &[ContractRow],
    label_rows: &[LabelRow],
    prior: &LabelMap,
    convention: &dyn LabelConvention,
) -> LabelMap {
    let mut labels = LabelMap::new();

    // Lowest precedence first; later inserts overwrite
    for row in contract_rows {
        if let Some(label) = row.label.as_deref().filter(|l| !l.is_empty()) {
            labels.insert(row.address.clone(), label.to_string());
        }
    }

    for row in label_rows {
        labels.insert(row.address.clone(), row.label.clone());
    }

    for transfer in transfers {
        for address in transfer.endpoints() {
            if !labels.contains_key(address) {
                labels.insert(address.clone(), convention.short_label(address));
            }
        }
    }

    for (address, label) in prior {
        labels.insert(address.clone(), label.clone());
    }

    labels
}

/// Union of the prior contract set and every address in `contract_rows`
pub fn merge_contracts(prior: &BTreeSet<Address>, contract_rows: &[ContractRow]) -> BTreeSet<Address> {
    let mut contracts = prior.clone();
    contracts.extend(contract_rows.iter().map(|row| row.address.clone()));
    contracts
}

/// Invert a label map: label → every address carrying it
pub fn reverse_labels(labels: &LabelMap) -> ReverseLabelMap {
    let mut reverse = ReverseLabelMap::new();
    for (address, label) in labels {
        reverse
            .entry(label.clone())
            .or_default()
            .insert(address.clone());
    }
    reverse
}

/// Addresses whose label is curated rather than synthesized
pub fn real_labelled<'a>(
    labels: &'a LabelMap,
    convention: &'a dyn LabelConvention,
) -> impl Iterator<Item = &'a Address> + 'a {
    labels
        .iter()
        .filter(move |(_, label)| !convention.is_synthetic_label(label))
        .map(|(address, _)| address)
}

/// Addresses still carrying a synthetic label
pub fn unlabelled<'a>(
    labels: &'a LabelMap,
    convention: &'a dyn LabelConvention,
) -> impl Iterator<Item = &'a Address> + 'a {
    labels
        .iter()
        .filter(move |(_, label)| convention.is_synthetic_label(label))
        .map(|(address, _)| address)
}
