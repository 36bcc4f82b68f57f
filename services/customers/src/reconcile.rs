//! Read-Repair Decision
//!
//! Pure mapping from what the canonical and staging tables currently hold to
//! what `ensure_customer_item` must write. Nothing here touches a store.

use crate::types::{CustomerRecord, Item, RegistrationStatus, StagingRecord};

/// Outcome of comparing the canonical row against the staging row
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// Canonical row already complete; no writes
    UpToDate(CustomerRecord),
    /// Write this row to the canonical table, then drop the staging row
    Repair(CustomerRecord),
}

impl Reconciliation {
    pub fn record(&self) -> &CustomerRecord {
        match self {
            Reconciliation::UpToDate(record) | Reconciliation::Repair(record) => record,
        }
    }

    pub fn into_record(self) -> CustomerRecord {
        match self {
            Reconciliation::UpToDate(record) | Reconciliation::Repair(record) => record,
        }
    }

    pub fn needs_write(&self) -> bool {
        matches!(self, Reconciliation::Repair(_))
    }
}

/// Decide how to converge the canonical row for `identity_id`.
///
/// Fields the canonical row already holds win over staging data. The
/// registration status only moves forward: a staging `registered` always
/// applies, a staging `invited` only fills a row with no status. The
/// supplied `api_key_id` fills a missing key; an empty one falls back to the
/// key carried on the staging row.
pub fn plan(
    identity_id: &str,
    user_id: &str,
    api_key_id: &str,
    canonical: Option<CustomerRecord>,
    staging: Option<&StagingRecord>,
) -> Reconciliation {
    let mut record = match canonical {
        Some(record) if record.is_up_to_date() => return Reconciliation::UpToDate(record),
        Some(stale) => stale,
        None => CustomerRecord {
            id: identity_id.to_string(),
            user_pool_id: None,
            api_key_id: None,
            registration_status: None,
            inviter_email_address: None,
            extra: Item::new(),
        },
    };

    record.user_pool_id = Some(user_id.to_string());

    if record.api_key_id.as_deref().map_or(true, str::is_empty) {
        record.api_key_id = if api_key_id.is_empty() {
            staging.and_then(|s| s.api_key_id.clone())
        } else {
            Some(api_key_id.to_string())
        };
    }

    if let Some(staging) = staging {
        match staging.registration_status {
            Some(RegistrationStatus::Registered) => {
                record.registration_status = Some(RegistrationStatus::Registered)
            }
            Some(status) if record.registration_status.is_none() => {
                record.registration_status = Some(status)
            }
            _ => {}
        }
        if record.inviter_email_address.is_none() {
            record.inviter_email_address = staging.inviter_email_address.clone();
        }
    }

    Reconciliation::Repair(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_complete_row_is_up_to_date() {
        let existing = CustomerRecord::new("X", "U", "K");
        let staging = StagingRecord::new("U").with_registration_status(RegistrationStatus::Registered);

        let outcome = plan("X", "U", "K", Some(existing.clone()), Some(&staging));

        assert_eq!(outcome, Reconciliation::UpToDate(existing));
        assert!(!outcome.needs_write());
    }

    #[test]
    fn test_missing_row_is_built_from_arguments_and_staging_status() {
        let staging = StagingRecord::new("U").with_registration_status(RegistrationStatus::Registered);

        let outcome = plan("X", "U", "K", None, Some(&staging));

        let expected =
            CustomerRecord::new("X", "U", "K").with_registration_status(RegistrationStatus::Registered);
        assert_eq!(outcome, Reconciliation::Repair(expected));
    }

    #[test]
    fn test_missing_row_without_staging() {
        let outcome = plan("X", "U", "K", None, None);
        assert_eq!(outcome, Reconciliation::Repair(CustomerRecord::new("X", "U", "K")));
    }

    #[test]
    fn test_stale_row_keeps_its_own_fields() {
        let mut stale = CustomerRecord::new("X", "", "existing-key");
        stale.user_pool_id = None;
        stale.inviter_email_address = Some("owner@example.com".to_string());
        stale
            .extra
            .insert("MarketplaceCustomerId".to_string(), json!("mp-1"));

        let mut staging = StagingRecord::new("U").with_registration_status(RegistrationStatus::Registered);
        staging.inviter_email_address = Some("other@example.com".to_string());
        staging.api_key_id = Some("staging-key".to_string());

        let record = plan("X", "U", "K", Some(stale), Some(&staging)).into_record();

        assert_eq!(record.user_pool_id.as_deref(), Some("U"));
        assert_eq!(record.api_key_id.as_deref(), Some("existing-key"));
        assert_eq!(record.inviter_email_address.as_deref(), Some("owner@example.com"));
        assert_eq!(record.registration_status, Some(RegistrationStatus::Registered));
        assert_eq!(record.extra.get("MarketplaceCustomerId"), Some(&json!("mp-1")));
    }

    #[test]
    fn test_registered_row_is_not_moved_back_to_invited() {
        let mut stale = CustomerRecord::new("X", "", "K")
            .with_registration_status(RegistrationStatus::Registered);
        stale.user_pool_id = None;
        let staging = StagingRecord::new("U").with_registration_status(RegistrationStatus::Invited);

        let record = plan("X", "U", "K", Some(stale), Some(&staging)).into_record();

        assert_eq!(record.registration_status, Some(RegistrationStatus::Registered));
        assert_eq!(record.user_pool_id.as_deref(), Some("U"));
    }

    #[test]
    fn test_invited_staging_fills_a_row_without_status() {
        let staging = StagingRecord::new("U").with_registration_status(RegistrationStatus::Invited);

        let record = plan("X", "U", "K", None, Some(&staging)).into_record();
        assert_eq!(record.registration_status, Some(RegistrationStatus::Invited));
    }

    #[test]
    fn test_empty_key_falls_back_to_staging_key() {
        let mut staging = StagingRecord::new("U");
        staging.api_key_id = Some("staging-key".to_string());

        let record = plan("X", "U", "", None, Some(&staging)).into_record();
        assert_eq!(record.api_key_id.as_deref(), Some("staging-key"));
    }

    #[test]
    fn test_repaired_row_is_up_to_date_on_next_pass() {
        let first = plan("X", "U", "K", None, None).into_record();
        let second = plan("X", "U", "K", Some(first.clone()), None);
        assert_eq!(second, Reconciliation::UpToDate(first));
    }
}
