//! Spreadsheet-to-model code matching
//!
//! Pairs spreadsheet classification codes with the model codes present in
//! the quantity store. Each run produces a fresh list of [`MatchRecord`]s.
//!
//! **Tiers (highest confidence first):**
//! 1. `Direct`: equal after normalization
//! 2. `ServerConfirmed`: listed in the backend's authoritative match set
//! 3. `Prefix`: a coarse spreadsheet code fans out to every model code
//!    below it in the hierarchy
//!
//! A spreadsheet code stops at the first tier that yields anything. A model
//! code claimed by one spreadsheet code is never claimed again.

use std::collections::{BTreeSet, HashMap, HashSet};

use costlink_common::code::{is_code_prefix, normalize};
use costlink_common::protocol::{MatchCodesResult, Provenance};
use serde::Serialize;
use tracing::debug;

use crate::store::QuantityStore;

/// Confidence tier of a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    Direct,
    ServerConfirmed,
    Prefix,
}

/// One spreadsheet code paired with one model code
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRecord {
    /// Spreadsheet code as supplied by the caller
    pub spreadsheet_code: String,
    /// Canonical model code
    pub resolved_code: String,
    pub tier: MatchTier,
    /// Model quantity held by the store, if any
    pub quantity: Option<f64>,
    pub source: Option<Provenance>,
}

/// Matching over the model codes of a [`QuantityStore`]
#[derive(Debug, Clone)]
pub struct MatchingEngine {
    store: QuantityStore,
}

impl MatchingEngine {
    pub fn new(store: QuantityStore) -> Self {
        Self { store }
    }

    /// Match using local analysis only
    pub fn compute_matches(&self, spreadsheet_codes: &[String]) -> Vec<MatchRecord> {
        self.compute_matches_with(spreadsheet_codes, None)
    }

    /// Match with an optional authoritative set from the backend
    ///
    /// Records come out grouped by spreadsheet code in input order; codes
    /// with no match produce no record (see [`unmatched_codes`]). A code
    /// repeated in the input is matched once, at its first occurrence.
    pub fn compute_matches_with(
        &self,
        spreadsheet_codes: &[String],
        server: Option<&MatchCodesResult>,
    ) -> Vec<MatchRecord> {
        let model_codes: BTreeSet<String> = self.store.codes().into_iter().collect();
        let distinct = distinct_codes(spreadsheet_codes);
        let canonical: Vec<String> = distinct.iter().map(|c| normalize(c)).collect();

        let mut claimed: HashSet<String> = HashSet::new();
        let mut resolved: Vec<Vec<(String, MatchTier)>> = vec![Vec::new(); canonical.len()];

        // Direct
        for (slot, code) in canonical.iter().enumerate() {
            if model_codes.contains(code) && claimed.insert(code.clone()) {
                resolved[slot].push((code.clone(), MatchTier::Direct));
            }
        }

        // Server-confirmed
        if let Some(server) = server {
            let mut confirmed: HashMap<String, Vec<String>> = HashMap::new();
            for pairing in &server.matches {
                confirmed
                    .entry(normalize(&pairing.spreadsheet_code))
                    .or_default()
                    .push(normalize(&pairing.model_code));
            }

            for (slot, code) in canonical.iter().enumerate() {
                if !resolved[slot].is_empty() {
                    continue;
                }
                for model_code in confirmed.get(code).into_iter().flatten() {
                    if claimed.insert(model_code.clone()) {
                        resolved[slot].push((model_code.clone(), MatchTier::ServerConfirmed));
                    }
                }
            }
        }

        // Prefix fan-out
        for (slot, code) in canonical.iter().enumerate() {
            if !resolved[slot].is_empty() {
                continue;
            }
            for model_code in &model_codes {
                if is_code_prefix(code, model_code) && claimed.insert(model_code.clone()) {
                    resolved[slot].push((model_code.clone(), MatchTier::Prefix));
                }
            }
        }

        let records: Vec<MatchRecord> = distinct
            .iter()
            .zip(resolved)
            .flat_map(|(spreadsheet_code, pairs)| {
                pairs.into_iter().map(move |(resolved_code, tier)| {
                    let record = self.store.lookup(&resolved_code);
                    MatchRecord {
                        spreadsheet_code: spreadsheet_code.to_string(),
                        quantity: record.as_ref().map(|r| r.quantity),
                        source: record.map(|r| r.provenance),
                        resolved_code,
                        tier,
                    }
                })
            })
            .collect();

        debug!(
            spreadsheet_codes = distinct.len(),
            model_codes = model_codes.len(),
            matches = records.len(),
            server_confirmed = server.is_some(),
            "Matching complete"
        );
        records
    }
}

/// Spreadsheet codes that produced no match record, each listed once
pub fn unmatched_codes(spreadsheet_codes: &[String], matches: &[MatchRecord]) -> Vec<String> {
    let matched: HashSet<&str> = matches
        .iter()
        .map(|record| record.spreadsheet_code.as_str())
        .collect();
    distinct_codes(spreadsheet_codes)
        .into_iter()
        .filter(|code| !matched.contains(code))
        .map(str::to_string)
        .collect()
}

fn distinct_codes(spreadsheet_codes: &[String]) -> Vec<&str> {
    let mut seen = HashSet::new();
    spreadsheet_codes
        .iter()
        .map(String::as_str)
        .filter(|code| seen.insert(*code))
        .collect()
}
