//! Errors surfaced by the customer lifecycle workflows

use thiserror::Error;

use crate::lifecycle::DeletionReport;

pub type Result<T> = std::result::Result<T, CustomerError>;

/// Errors that can occur while reconciling, inviting or deleting customers
#[derive(Debug, Error)]
pub enum CustomerError {
    /// A get or scan against a table failed
    #[error("Failed to read from {table}: {source}")]
    StoreRead {
        table: String,
        #[source]
        source: anyhow::Error,
    },

    /// A put or delete against a table failed
    #[error("Failed to write to {table}: {source}")]
    StoreWrite {
        table: String,
        #[source]
        source: anyhow::Error,
    },

    /// The inviter lookup did not resolve to exactly one user
    #[error("Expected exactly one identity-provider user for filter `{filter}`, found {matches}")]
    IdentityLookupAmbiguous { filter: String, matches: usize },

    /// User lookup, creation or deletion failed at the identity provider
    #[error("Identity provider error: {0}")]
    IdentityProvider(String),

    /// API key discovery or revocation failed
    #[error("Key registry error: {0}")]
    KeyRegistry(String),

    /// A provider response lacked an attribute the workflow depends on
    #[error("Identity-provider user has no `{attribute}` attribute")]
    MissingAttribute { attribute: String },

    /// A stored item could not be shaped into a record
    #[error("Malformed record: {0}")]
    Record(#[from] serde_json::Error),

    /// One or more independent deletion steps failed; the others still ran
    #[error("Account deletion incomplete ({} step(s) failed): {}", .failures.len(), summarize(.failures))]
    DeletionIncomplete {
        /// Steps that did complete
        report: Box<DeletionReport>,
        failures: Vec<CustomerError>,
    },
}

impl CustomerError {
    pub(crate) fn read(table: &str, source: anyhow::Error) -> Self {
        CustomerError::StoreRead {
            table: table.to_string(),
            source,
        }
    }

    pub(crate) fn write(table: &str, source: anyhow::Error) -> Self {
        CustomerError::StoreWrite {
            table: table.to_string(),
            source,
        }
    }
}

fn summarize(failures: &[CustomerError]) -> String {
    failures
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deletion_incomplete_lists_every_failure() {
        let err = CustomerError::DeletionIncomplete {
            report: Box::default(),
            failures: vec![
                CustomerError::IdentityProvider("user not found".to_string()),
                CustomerError::KeyRegistry("throttled".to_string()),
            ],
        };

        let message = err.to_string();
        assert!(message.contains("2 step(s) failed"));
        assert!(message.contains("user not found"));
        assert!(message.contains("throttled"));
    }

    #[test]
    fn test_store_errors_name_the_table() {
        let err = CustomerError::read("DevPortalCustomers", anyhow::anyhow!("timeout"));
        assert_eq!(
            err.to_string(),
            "Failed to read from DevPortalCustomers: timeout"
        );
    }
}
