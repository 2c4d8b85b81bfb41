//! Merge Engine - reconciles newly extracted rows with what a destination already holds
//!
//! Existing rows are always placed before new rows, and every deduplication
//! pass keeps the *last* occurrence, so a new row wins over an existing one.

use crate::error::Result;
use crate::record::{RecordSet, Value};
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

/// How duplicate rows are detected at a stateful destination
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeStrategy {
    pub primary_key: Option<String>,
    pub dedupe_all_columns: bool,
}

impl MergeStrategy {
    pub fn new(primary_key: Option<String>, dedupe_all_columns: bool) -> Self {
        Self {
            primary_key: primary_key.filter(|k| !k.is_empty()),
            dedupe_all_columns,
        }
    }

    /// True when a load must consult existing destination data.
    pub fn is_active(&self) -> bool {
        self.primary_key.is_some() || self.dedupe_all_columns
    }

    pub fn apply(&self, new_records: RecordSet, existing_records: RecordSet) -> Result<RecordSet> {
        merge(
            new_records,
            existing_records,
            self.primary_key.as_deref(),
            self.dedupe_all_columns,
        )
    }
}

/// Produce the record set a stateful destination should hold after loading
/// `new_records` on top of `existing_records`.
pub fn merge(
    new_records: RecordSet,
    existing_records: RecordSet,
    primary_key: Option<&str>,
    dedupe_all_columns: bool,
) -> Result<RecordSet> {
    // A blank existing set carries no columns and imposes none
    let key_in_both = primary_key.map(|key| {
        new_records.has_column(key)
            && (existing_records.is_blank() || existing_records.has_column(key))
    });

    let mut merged = existing_records.concat(new_records)?;
    let combined_rows = merged.len();

    if primary_key.is_none() && !dedupe_all_columns {
        return Ok(merged);
    }

    if dedupe_all_columns {
        merged = keep_last_by(merged, |row| row.to_vec());
    }

    if let (Some(key), Some(present)) = (primary_key, key_in_both) {
        if present {
            if let Some(idx) = merged.column_index(key) {
                merged = keep_last_by(merged, |row| vec![row[idx].clone()]);
            }
        } else {
            warn!(
                "Primary key '{}' not found in both new and existing records. Skipping primary key deduplication.",
                key
            );
        }
    }

    let dropped = combined_rows - merged.len();
    if dropped > 0 {
        info!("Dropped {} duplicate records during merge.", dropped);
    }
    Ok(merged)
}

/// Rows of `merged` that `existing` does not already hold, counting multiplicity.
pub fn delta(merged: RecordSet, existing: &RecordSet) -> Result<RecordSet> {
    if existing.is_blank() || existing.is_empty() {
        return Ok(merged);
    }
    // Aligns the existing rows to merged's column order and checks the shape
    let header = RecordSet::from_parts_unchecked(merged.columns().to_vec(), Vec::new());
    let (_, existing_rows) = header.concat(existing.clone())?.into_parts();

    let mut remaining: HashMap<Vec<Value>, usize> = HashMap::new();
    for row in existing_rows {
        *remaining.entry(row).or_insert(0) += 1;
    }

    let mut out = merged;
    out.retain_rows(|row| match remaining.get_mut(row) {
        Some(count) if *count > 0 => {
            *count -= 1;
            false
        }
        _ => true,
    });
    Ok(out)
}

/// Rows of `records` whose `key` value is not already held by `existing`.
///
/// Append-only destinations cannot replace a row, so a new row for a key the
/// destination already has is skipped instead of duplicating the key.
pub fn without_existing_keys(records: RecordSet, existing: &RecordSet, key: &str) -> RecordSet {
    let (Some(idx), Some(existing_idx)) = (records.column_index(key), existing.column_index(key)) else {
        return records;
    };
    let held: HashSet<&Value> = existing.rows().iter().map(|row| &row[existing_idx]).collect();

    let before = records.len();
    let mut out = records;
    out.retain_rows(|row| !held.contains(&row[idx]));
    let skipped = before - out.len();
    if skipped > 0 {
        info!(
            "Skipped {} records whose '{}' already exists at the destination.",
            skipped, key
        );
    }
    out
}

/// Drop rows whose key repeats a later row's key.
fn keep_last_by<K, F>(records: RecordSet, key_of: F) -> RecordSet
where
    K: std::hash::Hash + Eq,
    F: Fn(&[Value]) -> K,
{
    let (columns, rows) = records.into_parts();
    let mut seen: HashSet<K> = HashSet::with_capacity(rows.len());
    let mut kept: Vec<Vec<Value>> = Vec::with_capacity(rows.len());

    for row in rows.into_iter().rev() {
        if seen.insert(key_of(&row)) {
            kept.push(row);
        }
    }
    kept.reverse();
    RecordSet::from_parts_unchecked(columns, kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use serde_json::json;

    fn set(rows: serde_json::Value) -> RecordSet {
        RecordSet::from_json_rows(rows.as_array().cloned().unwrap()).unwrap()
    }

    #[test]
    fn test_pure_append_puts_existing_first() {
        let new = set(json!([{"id": 3}, {"id": 4}]));
        let existing = set(json!([{"id": 1}, {"id": 2}]));

        let merged = merge(new, existing, None, false).unwrap();
        assert_eq!(merged, set(json!([{"id": 1}, {"id": 2}, {"id": 3}, {"id": 4}])));
    }

    #[test]
    fn test_pure_append_keeps_duplicates() {
        let new = set(json!([{"id": 1}]));
        let existing = set(json!([{"id": 1}]));
        assert_eq!(merge(new, existing, None, false).unwrap().len(), 2);
    }

    #[test]
    fn test_upsert_new_row_wins() {
        let new = set(json!([{"id": 1, "v": "new"}]));
        let existing = set(json!([{"id": 1, "v": "old"}]));

        let merged = merge(new, existing, Some("id"), false).unwrap();
        assert_eq!(merged, set(json!([{"id": 1, "v": "new"}])));
    }

    #[test]
    fn test_upsert_keeps_unmatched_rows_from_both_sides() {
        let new = set(json!([{"id": 2, "v": "b2"}, {"id": 3, "v": "c"}]));
        let existing = set(json!([{"id": 1, "v": "a"}, {"id": 2, "v": "b"}]));

        let merged = merge(new, existing, Some("id"), false).unwrap();
        assert_eq!(
            merged,
            set(json!([{"id": 1, "v": "a"}, {"id": 2, "v": "b2"}, {"id": 3, "v": "c"}]))
        );
    }

    #[test]
    fn test_all_column_dedup() {
        let new = set(json!([{"a": 1, "b": 2}, {"a": 3, "b": 4}]));
        let existing = set(json!([{"a": 1, "b": 2}]));

        let merged = merge(new, existing, None, true).unwrap();
        assert_eq!(merged, set(json!([{"a": 1, "b": 2}, {"a": 3, "b": 4}])));
    }

    #[test]
    fn test_missing_key_degrades_to_concatenation() {
        let new = set(json!([{"a": 1}, {"a": 1}]));
        let existing = set(json!([{"a": 1}]));

        let merged = merge(new, existing, Some("id"), false).unwrap();
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn test_key_dedup_treats_integral_float_as_same_key() {
        let new = set(json!([{"id": 1.0, "v": "new"}]));
        let existing = set(json!([{"id": 1, "v": "old"}]));

        let merged = merge(new, existing, Some("id"), false).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.value(0, "v"), Some(&Value::from("new")));
    }

    #[test]
    fn test_both_strategies_combined() {
        let new = set(json!([{"id": 1, "v": "x"}, {"id": 1, "v": "y"}]));
        let existing = set(json!([{"id": 1, "v": "x"}]));

        let merged = merge(new, existing, Some("id"), true).unwrap();
        assert_eq!(merged, set(json!([{"id": 1, "v": "y"}])));
    }

    #[test]
    fn test_merging_empty_new_set_is_idempotent() {
        let new = set(json!([{"id": 1, "v": "n"}, {"id": 3, "v": "c"}]));
        let existing = set(json!([{"id": 1, "v": "o"}, {"id": 2, "v": "b"}]));

        for all_cols in [false, true] {
            let once = merge(new.clone(), existing.clone(), Some("id"), all_cols).unwrap();
            let twice = merge(once.clone(), RecordSet::empty(), Some("id"), all_cols).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_mismatched_columns_fail_loudly() {
        let new = set(json!([{"id": 1, "extra": 2}]));
        let existing = set(json!([{"id": 1}]));
        assert!(matches!(
            merge(new, existing, Some("id"), false),
            Err(SyncError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_delta_drops_rows_already_present() {
        let existing = set(json!([{"id": 1, "v": "a"}, {"id": 2, "v": "b"}]));
        let new = set(json!([{"id": 2, "v": "b"}, {"id": 3, "v": "c"}]));

        let merged = merge(new, existing.clone(), Some("id"), false).unwrap();
        let appended = delta(merged, &existing).unwrap();
        assert_eq!(appended, set(json!([{"id": 3, "v": "c"}])));
    }

    #[test]
    fn test_blank_existing_still_dedups_new_rows_by_key() {
        let new = set(json!([{"id": 1, "v": "a"}, {"id": 1, "v": "b"}]));

        let merged = merge(new, RecordSet::empty(), Some("id"), false).unwrap();
        assert_eq!(merged, set(json!([{"id": 1, "v": "b"}])));
    }

    #[test]
    fn test_without_existing_keys_skips_held_keys() {
        let existing = set(json!([{"id": 1, "v": "old"}]));
        let new = set(json!([{"id": 1.0, "v": "new"}, {"id": 2, "v": "b"}]));

        let kept = without_existing_keys(new.clone(), &existing, "id");
        assert_eq!(kept, set(json!([{"id": 2, "v": "b"}])));
        assert_eq!(without_existing_keys(new.clone(), &existing, "missing"), new);
    }

    #[test]
    fn test_strategy_ignores_empty_primary_key() {
        let strategy = MergeStrategy::new(Some(String::new()), false);
        assert!(!strategy.is_active());
        assert!(MergeStrategy::new(None, true).is_active());
    }
}
