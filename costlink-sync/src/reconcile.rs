//! Reconciliation of spreadsheet line items with model quantities
//!
//! Produces the flat row list submitted by `save_cost_data`. A quantity
//! typed into the spreadsheet is kept; a missing one is filled from the sum
//! of the matched model quantities.

use std::collections::HashMap;

use costlink_common::code::normalize;
use costlink_common::protocol::{CostItem, QuantitySource, ReconciledItem};

use crate::matching::MatchRecord;
use crate::store::QuantityStore;

/// Flatten `items` (pre-order) and attach effective quantities and totals
///
/// **Algorithm:**
/// 1. Group match records by canonical spreadsheet code
/// 2. For each item: spreadsheet quantity if present, otherwise the sum of
///    the current store quantities of its matched model codes (falling back
///    to the quantity captured in the match record)
/// 3. `total_cost = quantity * unit_price` when both are known
pub fn reconcile(
    items: &[CostItem],
    matches: &[MatchRecord],
    store: &QuantityStore,
) -> Vec<ReconciledItem> {
    let mut by_code: HashMap<String, Vec<&MatchRecord>> = HashMap::new();
    for record in matches {
        by_code
            .entry(normalize(&record.spreadsheet_code))
            .or_default()
            .push(record);
    }

    items
        .iter()
        .flat_map(CostItem::walk)
        .map(|item| {
            let matched = by_code
                .get(&normalize(&item.code))
                .map(Vec::as_slice)
                .unwrap_or_default();
            let matched_codes: Vec<String> =
                matched.iter().map(|r| r.resolved_code.clone()).collect();

            let (quantity, quantity_source) = match item.quantity {
                Some(quantity) => (Some(quantity), QuantitySource::Spreadsheet),
                None => match model_quantity(matched, store) {
                    Some(quantity) => (Some(quantity), QuantitySource::Model),
                    None => (None, QuantitySource::Missing),
                },
            };

            ReconciledItem {
                code: item.code.clone(),
                description: item.description.clone(),
                quantity,
                unit: item.unit.clone(),
                unit_price: item.unit_price,
                total_cost: quantity.zip(item.unit_price).map(|(q, p)| q * p),
                quantity_source,
                matched_codes,
            }
        })
        .collect()
}

fn model_quantity(matched: &[&MatchRecord], store: &QuantityStore) -> Option<f64> {
    let quantities: Vec<f64> = matched
        .iter()
        .filter_map(|record| {
            store
                .lookup(&record.resolved_code)
                .map(|current| current.quantity)
                .or(record.quantity)
        })
        .collect();

    if quantities.is_empty() {
        None
    } else {
        Some(quantities.iter().sum())
    }
}
