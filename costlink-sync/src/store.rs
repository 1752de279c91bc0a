//! Quantity Aggregation Store
//!
//! In-memory map from canonical classification code to the latest model
//! quantity. Updates overwrite (last writer wins); records are never deleted
//! during a session. Writers are the dispatcher's `quantity_update` handler
//! and tests; readers are the matching engine, reconciliation and renderers.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use costlink_common::code::{compact_key, is_code_prefix, major_key, normalize};
use costlink_common::protocol::Provenance;
use serde::Serialize;
use tracing::{debug, warn};

/// Latest quantity known for one canonical code
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuantityRecord {
    pub code: String,
    pub quantity: f64,
    pub updated_at: DateTime<Utc>,
    pub provenance: Provenance,
    pub element_count: Option<u64>,
}

/// Shared quantity store; clones refer to the same map
#[derive(Debug, Clone, Default)]
pub struct QuantityStore {
    records: Arc<RwLock<BTreeMap<String, QuantityRecord>>>,
}

impl QuantityStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, QuantityRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, QuantityRecord>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store the quantity for `raw_code`, replacing any previous value
    ///
    /// Returns `false` (and stores nothing) when the code is empty after
    /// normalization or the value is not finite.
    pub fn record_update(&self, raw_code: &str, value: f64, provenance: Provenance) -> bool {
        self.record_update_with_count(raw_code, value, provenance, None)
    }

    /// [`record_update`](Self::record_update) that also keeps the element count
    pub fn record_update_with_count(
        &self,
        raw_code: &str,
        value: f64,
        provenance: Provenance,
        element_count: Option<u64>,
    ) -> bool {
        let code = normalize(raw_code);
        if code.is_empty() {
            warn!(raw_code = %raw_code, "Ignoring quantity update without a code");
            return false;
        }
        if !value.is_finite() {
            warn!(code = %code, value, "Ignoring non-finite quantity");
            return false;
        }

        let record = QuantityRecord {
            code: code.clone(),
            quantity: value,
            updated_at: Utc::now(),
            provenance,
            element_count,
        };
        let previous = self.write().insert(code.clone(), record);
        debug!(
            code = %code,
            quantity = value,
            previous = ?previous.map(|p| p.quantity),
            "Quantity recorded"
        );
        true
    }

    /// Exact lookup on the canonical form of `raw_code`
    pub fn lookup(&self, raw_code: &str) -> Option<QuantityRecord> {
        self.read().get(&normalize(raw_code)).cloned()
    }

    /// Tiered lookup for codes that have no exact entry
    ///
    /// **Algorithm:**
    /// 1. Exact canonical match: return it alone
    /// 2. Same compact key (dots and leading zeros ignored)
    /// 3. Hierarchical prefix in either direction ("C2" <-> "C2.1")
    /// 4. Same major segment ("C2.7" ~ "C2.1")
    ///
    /// The first non-empty tier wins. Results are ordered by code.
    pub fn fuzzy_lookup(&self, raw_code: &str) -> Vec<QuantityRecord> {
        let code = normalize(raw_code);
        if code.is_empty() {
            return Vec::new();
        }

        let records = self.read();
        if let Some(record) = records.get(&code) {
            return vec![record.clone()];
        }

        let collect = |keep: &dyn Fn(&str) -> bool| -> Vec<QuantityRecord> {
            records
                .values()
                .filter(|record| keep(&record.code))
                .cloned()
                .collect()
        };

        let compact = compact_key(&code);
        let by_compact = collect(&|candidate: &str| compact_key(candidate) == compact);
        if !by_compact.is_empty() {
            return by_compact;
        }

        let by_prefix = collect(&|candidate: &str| {
            is_code_prefix(&code, candidate) || is_code_prefix(candidate, &code)
        });
        if !by_prefix.is_empty() {
            return by_prefix;
        }

        match major_key(&code) {
            Some(major) => collect(&|candidate: &str| {
                major_key(candidate).as_deref() == Some(major.as_str())
            }),
            None => Vec::new(),
        }
    }

    /// Total quantity behind `raw_code`: the exact record, else the fuzzy set
    pub fn aggregate(&self, raw_code: &str) -> Option<f64> {
        let records = self.fuzzy_lookup(raw_code);
        if records.is_empty() {
            None
        } else {
            Some(records.iter().map(|record| record.quantity).sum())
        }
    }

    /// All canonical codes, sorted
    pub fn codes(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Copy of every record, sorted by code
    pub fn snapshot(&self) -> Vec<QuantityRecord> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(codes: &[(&str, f64)]) -> QuantityStore {
        let store = QuantityStore::new();
        for (code, quantity) in codes {
            assert!(store.record_update(code, *quantity, Provenance::Model));
        }
        store
    }

    fn codes_of(records: &[QuantityRecord]) -> Vec<&str> {
        records.iter().map(|r| r.code.as_str()).collect()
    }

    #[test]
    fn test_update_overwrites_previous_value() {
        let store = QuantityStore::new();
        store.record_update("C01.01", 10.0, Provenance::Model);
        store.record_update("C1.1", 4.0, Provenance::Manual);

        let record = store.lookup("c1.1").unwrap();
        assert_eq!(record.quantity, 4.0);
        assert_eq!(record.provenance, Provenance::Manual);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_update_keeps_element_count() {
        let store = QuantityStore::new();
        store.record_update_with_count("Walls/C3.2", 12.5, Provenance::Model, Some(7));
        assert_eq!(store.lookup("C03.02").unwrap().element_count, Some(7));
    }

    #[test]
    fn test_rejects_empty_code_and_non_finite_value() {
        let store = QuantityStore::new();
        assert!(!store.record_update("   ", 1.0, Provenance::Model));
        assert!(!store.record_update("C1", f64::NAN, Provenance::Model));
        assert!(store.is_empty());
    }

    #[test]
    fn test_fuzzy_lookup_exact_wins() {
        let store = store_with(&[("C2", 1.0), ("C2.1", 2.0)]);
        assert_eq!(codes_of(&store.fuzzy_lookup("C02")), vec!["C2"]);
    }

    #[test]
    fn test_fuzzy_lookup_coarse_code_returns_children() {
        let store = store_with(&[("C2.1", 2.0), ("C2.2", 3.0), ("C20", 9.0)]);
        assert_eq!(codes_of(&store.fuzzy_lookup("C2")), vec!["C2.1", "C2.2"]);
        assert_eq!(store.aggregate("C2"), Some(5.0));
    }

    #[test]
    fn test_fuzzy_lookup_compact_tier_before_prefix() {
        let store = store_with(&[("C11.0", 1.0), ("C1.1", 2.0)]);
        assert_eq!(codes_of(&store.fuzzy_lookup("C1.10")), vec!["C11.0"]);
    }

    #[test]
    fn test_fuzzy_lookup_fine_code_finds_parent() {
        let store = store_with(&[("C2", 6.0)]);
        assert_eq!(codes_of(&store.fuzzy_lookup("C2.4")), vec!["C2"]);
    }

    #[test]
    fn test_fuzzy_lookup_major_segment_tier() {
        let store = store_with(&[("C2.1", 1.0), ("D2.7", 4.0)]);
        assert_eq!(codes_of(&store.fuzzy_lookup("C2.7")), vec!["C2.1"]);
        assert!(store.fuzzy_lookup("E9").is_empty());
        assert_eq!(store.aggregate("E9"), None);
    }

    #[test]
    fn test_snapshot_sorted_by_code() {
        let store = store_with(&[("D1", 1.0), ("A1", 1.0), ("B1", 1.0)]);
        assert_eq!(store.codes(), vec!["A1", "B1", "D1"]);
        assert_eq!(codes_of(&store.snapshot()), vec!["A1", "B1", "D1"]);
    }
}
