//! Canonical field set shared with the LOS
//!
//! Each field names where its value lives on both sides, which side owns it,
//! and whether a commit may ever write it.

use crate::types::{ExternalLoan, LocalLoan, SourceOfTruth};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// How two values of a field are compared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Identifier,
    Text,
    Currency,
    Date,
    /// LOS status name, compared after translation to an application status
    Status,
}

/// Canonical field definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub source_of_truth: SourceOfTruth,
    pub locked: bool,
}

pub const EXTERNAL_LOAN_ID: &str = "externalLoanId";
pub const BUSINESS_NAME: &str = "businessName";
pub const REQUESTED_AMOUNT: &str = "requestedAmount";
pub const LOAN_STATUS: &str = "loanStatus";
pub const OFFICER_NAME: &str = "officerName";
pub const TARGET_CLOSE_DATE: &str = "targetCloseDate";

/// Field table, in display order
pub const FIELD_SPECS: [FieldSpec; 6] = [
    FieldSpec {
        name: EXTERNAL_LOAN_ID,
        kind: FieldKind::Identifier,
        source_of_truth: SourceOfTruth::External,
        locked: true,
    },
    FieldSpec {
        name: BUSINESS_NAME,
        kind: FieldKind::Text,
        source_of_truth: SourceOfTruth::Local,
        locked: false,
    },
    FieldSpec {
        name: REQUESTED_AMOUNT,
        kind: FieldKind::Currency,
        source_of_truth: SourceOfTruth::Local,
        locked: false,
    },
    FieldSpec {
        name: LOAN_STATUS,
        kind: FieldKind::Status,
        source_of_truth: SourceOfTruth::External,
        locked: true,
    },
    FieldSpec {
        name: OFFICER_NAME,
        kind: FieldKind::Text,
        source_of_truth: SourceOfTruth::External,
        locked: false,
    },
    FieldSpec {
        name: TARGET_CLOSE_DATE,
        kind: FieldKind::Date,
        source_of_truth: SourceOfTruth::Local,
        locked: false,
    },
];

/// LOS status name → application status
const STATUS_MAP: [(&str, &str); 11] = [
    ("New Application", "submitted"),
    ("Intake Review", "in_review"),
    ("Underwriting", "in_review"),
    ("Committee Review", "in_review"),
    ("Approved w/ Conditions", "conditional_approval"),
    ("SBA Submission", "sba_submitted"),
    ("SBA Approved", "sba_approved"),
    ("Closing", "closing"),
    ("Funded", "funded"),
    ("Declined", "declined"),
    ("Withdrawn", "withdrawn"),
];

/// Look up a field definition by canonical name
pub fn field_spec(name: &str) -> Option<&'static FieldSpec> {
    FIELD_SPECS.iter().find(|spec| spec.name == name)
}

/// Translate a LOS status name to the application status it means
pub fn app_status_for(status_name: &str) -> Option<&'static str> {
    let status_name = status_name.trim();
    STATUS_MAP
        .iter()
        .find(|(los, _)| los.eq_ignore_ascii_case(status_name))
        .map(|(_, app)| *app)
}

/// First LOS status name that means `app_status`
pub fn los_status_for(app_status: &str) -> Option<&'static str> {
    STATUS_MAP
        .iter()
        .find(|(_, app)| *app == app_status.trim())
        .map(|(los, _)| *los)
}

/// Canonical display value of a field on the local record
pub fn local_value(loan: &LocalLoan, field: &str) -> Option<String> {
    match field {
        EXTERNAL_LOAN_ID => loan.external_loan_id.clone(),
        BUSINESS_NAME => loan.business_name.clone(),
        REQUESTED_AMOUNT => loan.requested_amount.map(format_amount),
        LOAN_STATUS => Some(loan.status.clone()).filter(|s| !s.is_empty()),
        OFFICER_NAME => loan.officer_name.clone(),
        TARGET_CLOSE_DATE => loan.target_close_date.map(format_date),
        _ => None,
    }
}

/// Canonical display value of a field on the LOS record
pub fn external_value(loan: &ExternalLoan, field: &str) -> Option<String> {
    match field {
        EXTERNAL_LOAN_ID => Some(loan.id.clone()),
        BUSINESS_NAME => loan.borrower_name.clone(),
        REQUESTED_AMOUNT => loan.balance.map(format_amount),
        LOAN_STATUS => Some(loan.status_name.clone()).filter(|s| !s.is_empty()),
        OFFICER_NAME => loan.officer_name.clone(),
        TARGET_CLOSE_DATE => loan.close_date.map(format_date),
        _ => None,
    }
}

fn format_amount(amount: Decimal) -> String {
    amount.normalize().to_string()
}

fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Copy one LOS-owned field from the LOS record into the local record
///
/// Returns false for fields that are not pulled, and for LOS values with no
/// local form (an unmapped status name, a missing officer).
pub fn pull_to_local(loan: &mut LocalLoan, external: &ExternalLoan, field: &str) -> bool {
    match field {
        LOAN_STATUS => match app_status_for(&external.status_name) {
            Some(status) => {
                loan.status = status.to_string();
                true
            }
            None => false,
        },
        OFFICER_NAME => match &external.officer_name {
            Some(name) => {
                loan.officer_name = Some(name.clone());
                true
            }
            None => false,
        },
        _ => false,
    }
}

/// Values a commit writes to the LOS, in LOS field names
///
/// Only local-owned, unlocked fields have a slot here, so a patch cannot
/// carry a locked field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoanPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub borrower_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_date: Option<NaiveDate>,
}

impl LoanPatch {
    /// Copy one canonical field from the local record into the patch
    ///
    /// Returns false for fields the patch cannot carry.
    pub fn set_from_local(&mut self, loan: &LocalLoan, field: &str) -> bool {
        match field {
            BUSINESS_NAME => {
                self.borrower_name = loan.business_name.clone();
                self.borrower_name.is_some()
            }
            REQUESTED_AMOUNT => {
                self.balance = loan.requested_amount;
                self.balance.is_some()
            }
            TARGET_CLOSE_DATE => {
                self.close_date = loan.target_close_date;
                self.close_date.is_some()
            }
            _ => false,
        }
    }

    /// Canonical names of the fields carried, in table order
    pub fn fields(&self) -> Vec<String> {
        let mut fields = Vec::new();
        if self.borrower_name.is_some() {
            fields.push(BUSINESS_NAME.to_string());
        }
        if self.balance.is_some() {
            fields.push(REQUESTED_AMOUNT.to_string());
        }
        if self.close_date.is_some() {
            fields.push(TARGET_CLOSE_DATE.to_string());
        }
        fields
    }

    pub fn is_empty(&self) -> bool {
        self.borrower_name.is_none() && self.balance.is_none() && self.close_date.is_none()
    }

    /// Apply to a LOS record (used by the in-memory LOS)
    pub fn apply_to(&self, loan: &mut ExternalLoan) {
        if let Some(name) = &self.borrower_name {
            loan.borrower_name = Some(name.clone());
        }
        if let Some(balance) = self.balance {
            loan.balance = Some(balance);
        }
        if let Some(date) = self.close_date {
            loan.close_date = Some(date);
        }
    }
}

/// Body of a LOS create call for a loan not yet linked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewExternalLoan {
    pub borrower_name: Option<String>,
    pub balance: Option<Decimal>,
    pub close_date: Option<NaiveDate>,
    pub officer_name: Option<String>,
    pub status_name: Option<String>,
}

impl NewExternalLoan {
    pub fn from_local(loan: &LocalLoan) -> Self {
        Self {
            borrower_name: loan.business_name.clone(),
            balance: loan.requested_amount,
            close_date: loan.target_close_date,
            officer_name: loan.officer_name.clone(),
            status_name: los_status_for(&loan.status).map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn local() -> LocalLoan {
        LocalLoan {
            id: "app-1".to_string(),
            business_name: Some("Acme Corp".to_string()),
            requested_amount: Some(Decimal::new(50000000, 2)),
            status: "in_review".to_string(),
            officer_name: Some("Sarah Smith".to_string()),
            external_loan_id: Some("1001".to_string()),
            target_close_date: NaiveDate::from_ymd_opt(2026, 3, 31),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_locked_fields_are_external_owned() {
        for spec in FIELD_SPECS.iter().filter(|s| s.locked) {
            assert_eq!(spec.source_of_truth, SourceOfTruth::External, "{}", spec.name);
        }
        let locked: Vec<&str> = FIELD_SPECS.iter().filter(|s| s.locked).map(|s| s.name).collect();
        assert_eq!(locked, vec![EXTERNAL_LOAN_ID, LOAN_STATUS]);
        assert!(field_spec("unknown").is_none());
    }

    #[test]
    fn test_status_map() {
        assert_eq!(app_status_for("Underwriting"), Some("in_review"));
        assert_eq!(app_status_for(" closing "), Some("closing"));
        assert_eq!(app_status_for("Approved"), None);
        assert_eq!(los_status_for("in_review"), Some("Intake Review"));
    }

    #[test]
    fn test_local_values_are_canonical() {
        let loan = local();
        assert_eq!(local_value(&loan, REQUESTED_AMOUNT).as_deref(), Some("500000"));
        assert_eq!(local_value(&loan, TARGET_CLOSE_DATE).as_deref(), Some("2026-03-31"));
        assert_eq!(local_value(&loan, LOAN_STATUS).as_deref(), Some("in_review"));
    }

    #[test]
    fn test_patch_refuses_locked_fields() {
        let loan = local();
        let mut patch = LoanPatch::default();
        assert!(!patch.set_from_local(&loan, EXTERNAL_LOAN_ID));
        assert!(!patch.set_from_local(&loan, LOAN_STATUS));
        assert!(patch.is_empty());

        assert!(patch.set_from_local(&loan, REQUESTED_AMOUNT));
        assert_eq!(patch.fields(), vec![REQUESTED_AMOUNT.to_string()]);
    }

    #[test]
    fn test_pull_to_local() {
        let mut loan = local();
        loan.status = "submitted".to_string();
        let mut external = ExternalLoan {
            id: "1001".to_string(),
            status_name: "Closing".to_string(),
            balance: None,
            officer_name: Some("John Doe".to_string()),
            borrower_name: None,
            close_date: None,
        };

        assert!(pull_to_local(&mut loan, &external, LOAN_STATUS));
        assert!(pull_to_local(&mut loan, &external, OFFICER_NAME));
        assert_eq!(loan.status, "closing");
        assert_eq!(loan.officer_name.as_deref(), Some("John Doe"));

        // Unmapped status and local-owned fields stay put
        external.status_name = "Approved".to_string();
        assert!(!pull_to_local(&mut loan, &external, LOAN_STATUS));
        assert!(!pull_to_local(&mut loan, &external, EXTERNAL_LOAN_ID));
        assert!(!pull_to_local(&mut loan, &external, REQUESTED_AMOUNT));
        assert_eq!(loan.status, "closing");
        assert_eq!(loan.external_loan_id.as_deref(), Some("1001"));
    }

    #[test]
    fn test_patch_apply() {
        let mut external = ExternalLoan {
            id: "1001".to_string(),
            status_name: "Underwriting".to_string(),
            balance: Some(Decimal::new(500000, 0)),
            officer_name: None,
            borrower_name: Some("Acme".to_string()),
            close_date: None,
        };
        let patch = LoanPatch {
            balance: Some(Decimal::new(550000, 0)),
            ..Default::default()
        };
        patch.apply_to(&mut external);
        assert_eq!(external.balance, Some(Decimal::new(550000, 0)));
        assert_eq!(external.borrower_name.as_deref(), Some("Acme"));
        assert_eq!(external.id, "1001");
    }

    #[test]
    fn test_patch_wire_names() {
        let patch = LoanPatch {
            borrower_name: Some("Acme".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json["borrowerName"], "Acme");
        assert!(json.get("balance").is_none());
    }
}
