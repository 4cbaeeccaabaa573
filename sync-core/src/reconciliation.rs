//! Reconciliation Engine
//!
//! Classifies every canonical field of a loan as `match` or `mismatch`.
//! Pure: the same inputs always produce the same mappings.

use crate::config::ReconciliationConfig;
use crate::mapping::{self, FieldKind, FIELD_SPECS};
use crate::types::{ExternalLoan, FieldMapping, LocalLoan, MatchStatus, SourceOfTruth};
use chrono::{DateTime, NaiveDate};
use rust_decimal::Decimal;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Reconciler {
    currency_tolerance: Decimal,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(&ReconciliationConfig::default())
    }
}

impl Reconciler {
    pub fn new(config: &ReconciliationConfig) -> Self {
        Self {
            currency_tolerance: config.currency_tolerance.abs(),
        }
    }

    /// Build the field mappings for a loan
    ///
    /// With no LOS record every field is a mismatch.
    pub fn reconcile(&self, local: &LocalLoan, external: Option<&ExternalLoan>) -> Vec<FieldMapping> {
        FIELD_SPECS
            .iter()
            .map(|spec| {
                let local_value = mapping::local_value(local, spec.name);
                let external_value = external.and_then(|e| mapping::external_value(e, spec.name));
                let status = self.compare(spec.kind, local_value.as_deref(), external_value.as_deref());

                FieldMapping {
                    field: spec.name.to_string(),
                    local_value,
                    external_value,
                    status,
                    source_of_truth: spec.source_of_truth,
                    is_locked: spec.locked,
                }
            })
            .collect()
    }

    /// Compare two display values of a field
    pub fn compare(&self, kind: FieldKind, local: Option<&str>, external: Option<&str>) -> MatchStatus {
        let (Some(local), Some(external)) = (local, external) else {
            return MatchStatus::Mismatch;
        };

        let equal = match kind {
            FieldKind::Identifier | FieldKind::Text => exact(local, external),
            FieldKind::Currency => match (parse_amount(local), parse_amount(external)) {
                (Some(a), Some(b)) => (a - b).abs() <= self.currency_tolerance,
                _ => exact(local, external),
            },
            FieldKind::Date => match (parse_date(local), parse_date(external)) {
                (Some(a), Some(b)) => a == b,
                _ => exact(local, external),
            },
            FieldKind::Status => match mapping::app_status_for(external) {
                Some(app_status) => exact(local, app_status) || exact(local, external),
                None => exact(local, external),
            },
        };

        if equal {
            MatchStatus::Match
        } else {
            MatchStatus::Mismatch
        }
    }
}

/// Fields a commit would write: mismatched, locally owned, unlocked
pub fn commit_candidates(mappings: &[FieldMapping]) -> Vec<&FieldMapping> {
    mappings
        .iter()
        .filter(|m| {
            m.status == MatchStatus::Mismatch
                && m.source_of_truth == SourceOfTruth::Local
                && !m.is_locked
        })
        .collect()
}

/// Fields a commit pulls into the local record: mismatched and LOS-owned
///
/// The link id is excluded; it is only ever set by create-and-link.
pub fn pull_candidates(mappings: &[FieldMapping]) -> Vec<&FieldMapping> {
    mappings
        .iter()
        .filter(|m| {
            m.status == MatchStatus::Mismatch
                && m.source_of_truth == SourceOfTruth::External
                && m.field != mapping::EXTERNAL_LOAN_ID
        })
        .collect()
}

/// `Dry run: 4 matched, 2 mismatched (requestedAmount, targetCloseDate)`
pub fn dry_run_summary(mappings: &[FieldMapping]) -> String {
    let mismatched: Vec<&str> = mappings
        .iter()
        .filter(|m| m.status == MatchStatus::Mismatch)
        .map(|m| m.field.as_str())
        .collect();
    let matched = mappings.len() - mismatched.len();

    if mismatched.is_empty() {
        format!("Dry run: {} matched, 0 mismatched", matched)
    } else {
        format!(
            "Dry run: {} matched, {} mismatched ({})",
            matched,
            mismatched.len(),
            mismatched.join(", ")
        )
    }
}

fn exact(a: &str, b: &str) -> bool {
    a.trim() == b.trim()
}

fn parse_amount(value: &str) -> Option<Decimal> {
    let cleaned: String = value
        .trim()
        .chars()
        .filter(|c| *c != '$' && *c != ',' && !c.is_whitespace())
        .collect();
    Decimal::from_str(&cleaned).ok()
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(value).ok().map(|dt| dt.date_naive()))
        .or_else(|| NaiveDate::parse_from_str(value, "%m/%d/%Y").ok())
}
