//! Canonical slot records, normalization, and reconciliation for slotwatch.

use std::collections::btree_set;
use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "slotwatch-core";

/// One observable booking slot, identified by its canonical string.
///
/// Only [`normalize`] produces records, so two records compare equal exactly
/// when their canonical strings do.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Record(String);

impl Record {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Record {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Sub-fields an extractor may know about a slot beyond its raw text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotContext {
    pub date: Option<String>,
    pub time: Option<String>,
    pub activity: Option<String>,
}

impl SlotContext {
    pub fn for_activity(label: impl Into<String>) -> Self {
        Self {
            activity: Some(label.into()),
            ..Default::default()
        }
    }
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(collapse_whitespace)
        .filter(|s| !s.is_empty())
}

/// Turn raw extracted text into a canonical record.
///
/// Whitespace is trimmed and inner runs collapse to one space. With a context
/// the key is composed as `<date> @ <time> [<activity>]`, leaving out absent
/// parts; the raw text stands in for a missing date. Returns `None` when
/// nothing identifying is left.
pub fn normalize(raw: &str, context: Option<&SlotContext>) -> Option<Record> {
    let base = collapse_whitespace(raw);
    let Some(ctx) = context else {
        return (!base.is_empty()).then_some(Record(base));
    };

    let mut key = match non_empty(ctx.date.as_deref()) {
        Some(date) => date,
        None if !base.is_empty() => base,
        None => return None,
    };
    if let Some(time) = non_empty(ctx.time.as_deref()) {
        key.push_str(" @ ");
        key.push_str(&time);
    }
    if let Some(activity) = non_empty(ctx.activity.as_deref()) {
        key.push_str(" [");
        key.push_str(&activity);
        key.push(']');
    }
    Some(Record(key))
}

/// Set of canonical records. Iteration is lexicographic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RecordSet(BTreeSet<Record>);

impl RecordSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize every raw string without context, dropping blanks.
    pub fn from_raw<I, S>(raw: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        raw.into_iter()
            .filter_map(|s| normalize(s.as_ref(), None))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_set::Iter<'_, Record> {
        self.0.iter()
    }

    pub fn difference(&self, other: &RecordSet) -> RecordSet {
        self.0.difference(&other.0).cloned().collect()
    }

    pub fn union(&self, other: &RecordSet) -> RecordSet {
        self.0.union(&other.0).cloned().collect()
    }

    /// Canonical strings in lexicographic order.
    pub fn to_strings(&self) -> Vec<String> {
        self.0.iter().map(|r| r.as_str().to_string()).collect()
    }
}

impl FromIterator<Record> for RecordSet {
    fn from_iter<T: IntoIterator<Item = Record>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<Record> for RecordSet {
    fn extend<T: IntoIterator<Item = Record>>(&mut self, iter: T) {
        self.0.extend(iter);
    }
}

impl IntoIterator for RecordSet {
    type Item = Record;
    type IntoIter = btree_set::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a RecordSet {
    type Item = &'a Record;
    type IntoIter = btree_set::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Records present in `current` but not in `seen`.
pub fn reconcile(current: &RecordSet, seen: &RecordSet) -> RecordSet {
    current.difference(seen)
}

/// How the persisted seen-state moves forward after a successful run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeenPolicy {
    /// Persist exactly what is visible now; a slot that vanishes and comes
    /// back is announced again.
    #[default]
    Replace,
    /// Remember every slot ever observed; each slot is announced once.
    Accumulate,
}

impl SeenPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            SeenPolicy::Replace => "replace",
            SeenPolicy::Accumulate => "accumulate",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "replace" => Some(SeenPolicy::Replace),
            "accumulate" => Some(SeenPolicy::Accumulate),
            _ => None,
        }
    }

    pub fn next_seen(self, seen: &RecordSet, current: &RecordSet) -> RecordSet {
        match self {
            SeenPolicy::Replace => current.clone(),
            SeenPolicy::Accumulate => seen.union(current),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> RecordSet {
        RecordSet::from_raw(items.iter().copied())
    }

    #[test]
    fn normalize_trims_and_collapses_whitespace() {
        let record = normalize("  2025-03-01   10:00\n", None).expect("record");
        assert_eq!(record.as_str(), "2025-03-01 10:00");
        assert!(normalize(" \t\n", None).is_none());
    }

    #[test]
    fn normalize_composes_context_fields() {
        let ctx = SlotContext {
            date: Some("2025-03-01".into()),
            time: Some(" 10:00 ".into()),
            activity: Some("Master Class".into()),
        };
        let record = normalize("ignored when a date is given", Some(&ctx)).expect("record");
        assert_eq!(record.as_str(), "2025-03-01 @ 10:00 [Master Class]");

        let label_only = SlotContext::for_activity("Intermediate");
        let record = normalize("Sat 2025-03-01", Some(&label_only)).expect("record");
        assert_eq!(record.as_str(), "Sat 2025-03-01 [Intermediate]");

        let blank = SlotContext::default();
        assert!(normalize("  ", Some(&blank)).is_none());
    }

    #[test]
    fn same_date_different_activity_stays_distinct() {
        let a = normalize("2025-03-01", Some(&SlotContext::for_activity("Beginner"))).unwrap();
        let b = normalize("2025-03-01", Some(&SlotContext::for_activity("Advanced"))).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn different_extraction_paths_agree() {
        let from_text = normalize("2025-03-01 @ 10:00 [Padel]", None).unwrap();
        let from_parts = normalize(
            "",
            Some(&SlotContext {
                date: Some("2025-03-01".into()),
                time: Some("10:00".into()),
                activity: Some("Padel".into()),
            }),
        )
        .unwrap();
        assert_eq!(from_text, from_parts);
    }

    #[test]
    fn record_set_deduplicates_canonically_equal_records() {
        let records = set(&["2025-01-01", " 2025-01-01 ", "2025-01-01\t"]);
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn reconcile_is_set_difference() {
        let a = set(&["2025-01-01", "2025-01-02", "2025-01-03"]);
        let b = set(&["2025-01-02", "2025-02-01"]);
        let new = reconcile(&a, &b);
        assert_eq!(new.to_strings(), vec!["2025-01-01", "2025-01-03"]);
        assert!(reconcile(&a, &a).is_empty());
        assert!(reconcile(&RecordSet::new(), &b).is_empty());
    }

    #[test]
    fn reconcile_is_idempotent() {
        let current = set(&["2025-01-01 @ 10:00"]);
        let seen = current.clone();
        assert!(reconcile(&current, &seen).is_empty());
        assert!(reconcile(&current, &seen).is_empty());
    }

    #[test]
    fn replace_policy_reannounces_reappearing_slot() {
        let policy = SeenPolicy::Replace;
        let slot = set(&["2025-01-01 @ 10:00"]);

        let seen = policy.next_seen(&slot, &RecordSet::new());
        assert!(seen.is_empty());
        assert_eq!(reconcile(&slot, &seen), slot);
    }

    #[test]
    fn accumulate_policy_remembers_vanished_slot() {
        let policy = SeenPolicy::Accumulate;
        let slot = set(&["2025-01-01 @ 10:00"]);

        let seen = policy.next_seen(&slot, &RecordSet::new());
        assert_eq!(seen, slot);
        assert!(reconcile(&slot, &seen).is_empty());
    }

    #[test]
    fn seen_policy_names_round_trip() {
        for policy in [SeenPolicy::Replace, SeenPolicy::Accumulate] {
            assert_eq!(SeenPolicy::from_name(policy.as_str()), Some(policy));
        }
        assert_eq!(SeenPolicy::from_name(" Accumulate "), Some(SeenPolicy::Accumulate));
        assert_eq!(SeenPolicy::from_name("merge"), None);
    }

    #[test]
    fn record_set_serializes_as_sorted_string_array() {
        let records = set(&["b", "a", "c"]);
        let json = serde_json::to_string(&records).expect("json");
        assert_eq!(json, r#"["a","b","c"]"#);
    }
}
