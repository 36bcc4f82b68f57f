//! Developer Portal Customer Lifecycle
//!
//! Keeps a customer's state consistent across three independent systems:
//! the identity provider, the legacy pre-login (staging) table and the
//! canonical customers table.
//!
//! ## Workflows
//!
//! - `ensure_customer_item`: read-repair that migrates a staging entry into
//!   the canonical table and converges on retry
//! - `create_account_invite`: provisions an invited identity-provider user and
//!   records a pending staging entry
//! - `delete_account_by_user_id`: best-effort cascading removal of the staging
//!   entry, identity-provider user, canonical rows and their API keys
//!
//! Every collaborator is a trait in [`clients`], so the workflows run the same
//! way against cloud clients or the in-memory fakes in [`memory`].

pub mod clients;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod memory;
pub mod reconcile;
pub mod telemetry;
pub mod types;

pub use clients::{ApiKeyRegistry, IdentityProviderClient, StoreClient};
pub use config::{ConfigError, CustomersConfig};
pub use error::{CustomerError, Result};
pub use lifecycle::{CustomerLifecycle, DeletionReport, InviteRequest};
pub use reconcile::Reconciliation;
pub use types::{ApiKey, ApiKeyQuery, CustomerRecord, RegistrationStatus, StagingRecord};
