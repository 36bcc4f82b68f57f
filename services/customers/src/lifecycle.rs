//! Customer Lifecycle Workflows
//!
//! Read-repair reconciliation, account invites and cascading deletion over
//! the collaborator traits in [`crate::clients`].

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clients::{ApiKeyRegistry, IdentityProviderClient, StoreClient};
use crate::config::CustomersConfig;
use crate::error::{CustomerError, Result};
use crate::reconcile::{self, Reconciliation};
use crate::types::{
    from_item, to_item, ApiKeyQuery, CustomerRecord, ItemKey, RegistrationStatus, ScanFilter,
    StagingRecord, UserAttribute,
};

/// Who is being invited, and by whom
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteRequest {
    pub target_email_address: String,
    /// Inviter's user id; recorded as the inviter email when the provider
    /// has no email attribute for the inviter
    pub inviter_user_id: String,
    /// Inviter's identity-provider subject id
    pub inviter_user_sub: String,
}

/// What `delete_account_by_user_id` removed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionReport {
    pub user_sub: String,
    pub staging_record_found: bool,
    pub staging_record_deleted: bool,
    /// Whether the provider still had the user when deletion ran
    pub identity_user_found: bool,
    /// The provider no longer holds the user, whether removed now or earlier
    pub identity_user_deleted: bool,
    /// Identity ids of canonical rows that referenced the user
    pub customers_found: Vec<String>,
    pub customers_deleted: Vec<String>,
    pub api_keys_revoked: Vec<String>,
}

impl DeletionReport {
    fn new(user_sub: &str) -> Self {
        Self {
            user_sub: user_sub.to_string(),
            ..Default::default()
        }
    }
}

/// Customer lifecycle engine bound to one set of tables and one user pool
pub struct CustomerLifecycle<S: ?Sized, I: ?Sized, K: ?Sized> {
    config: CustomersConfig,
    store: Arc<S>,
    identity: Arc<I>,
    keys: Arc<K>,
}

impl<S, I, K> CustomerLifecycle<S, I, K>
where
    S: StoreClient + ?Sized,
    I: IdentityProviderClient + ?Sized,
    K: ApiKeyRegistry + ?Sized,
{
    pub fn new(config: CustomersConfig, store: Arc<S>, identity: Arc<I>, keys: Arc<K>) -> Self {
        debug!(
            user_pool_id = %config.user_pool_id,
            customers_table = %config.customers_table_name,
            staging_table = %config.pre_login_accounts_table_name,
            "CustomerLifecycle initialized"
        );

        Self {
            config,
            store,
            identity,
            keys,
        }
    }

    pub fn config(&self) -> &CustomersConfig {
        &self.config
    }

    /// Canonical row for `identity_id`, if any
    pub async fn get_customer(&self, identity_id: &str) -> Result<Option<CustomerRecord>> {
        let table = &self.config.customers_table_name;
        debug!(identity_id = %identity_id, "Reading customer record");

        self.store
            .get(table, &ItemKey::customer(identity_id))
            .await
            .map_err(|e| CustomerError::read(table, e))?
            .map(from_item)
            .transpose()
            .map_err(CustomerError::from)
    }

    async fn get_staging(&self, user_id: &str) -> Result<Option<StagingRecord>> {
        let table = &self.config.pre_login_accounts_table_name;
        debug!(user_id = %user_id, "Reading staging record");

        self.store
            .get(table, &ItemKey::staging(user_id))
            .await
            .map_err(|e| CustomerError::read(table, e))?
            .map(from_item)
            .transpose()
            .map_err(CustomerError::from)
    }

    /// Guarantee a canonical row exists for `identity_id` and return it.
    ///
    /// A complete row is returned as read, with no writes, even when the
    /// staging read failed or returned an unreadable row. Otherwise the row
    /// is rebuilt from the arguments and the staging row for `user_id`,
    /// written, and the staging row is deleted. Nothing is rolled back on
    /// failure; calling again converges.
    pub async fn ensure_customer_item(
        &self,
        identity_id: &str,
        user_id: &str,
        api_key_id: &str,
    ) -> Result<CustomerRecord> {
        let (canonical, staging) = futures::join!(
            self.get_customer(identity_id),
            self.get_staging(user_id)
        );
        let canonical = canonical?;

        let staging = match staging {
            Ok(staging) => staging,
            Err(e) if canonical.as_ref().is_some_and(CustomerRecord::is_up_to_date) => {
                debug!(user_id = %user_id, error = %e, "Ignoring staging read failure for complete record");
                None
            }
            Err(e) => return Err(e),
        };

        match reconcile::plan(identity_id, user_id, api_key_id, canonical, staging.as_ref()) {
            Reconciliation::UpToDate(record) => {
                debug!(identity_id = %identity_id, "Customer record up to date");
                Ok(record)
            }
            Reconciliation::Repair(record) => {
                info!(
                    identity_id = %identity_id,
                    user_id = %user_id,
                    migrated_from_staging = staging.is_some(),
                    "Repairing customer record"
                );

                let customers = &self.config.customers_table_name;
                self.store
                    .put(customers, to_item(&record)?)
                    .await
                    .map_err(|e| CustomerError::write(customers, e))?;

                let staging_table = &self.config.pre_login_accounts_table_name;
                self.store
                    .delete(staging_table, &ItemKey::staging(user_id))
                    .await
                    .map_err(|e| CustomerError::write(staging_table, e))?;

                Ok(record)
            }
        }
    }

    /// Create an identity-provider user for the invitee and record a pending
    /// staging entry keyed by the new user's `sub`.
    ///
    /// A provider user created before a failed staging write is left in
    /// place.
    pub async fn create_account_invite(&self, request: &InviteRequest) -> Result<StagingRecord> {
        let pool = &self.config.user_pool_id;
        let filter = format!("sub = \"{}\"", request.inviter_user_sub);

        let inviters = self
            .identity
            .list_users(pool, &filter)
            .await
            .map_err(|e| CustomerError::IdentityProvider(format!("{:#}", e)))?;

        let inviter = match inviters.as_slice() {
            [inviter] => inviter,
            _ => {
                warn!(filter = %filter, matches = inviters.len(), "Inviter lookup did not match exactly one user");
                return Err(CustomerError::IdentityLookupAmbiguous {
                    filter,
                    matches: inviters.len(),
                });
            }
        };
        let inviter_email = inviter
            .attribute("email")
            .unwrap_or(request.inviter_user_id.as_str())
            .to_string();

        info!(
            target_email = %request.target_email_address,
            inviter = %inviter_email,
            "Creating account invite"
        );

        let created = self
            .identity
            .admin_create_user(
                pool,
                &request.target_email_address,
                vec![
                    UserAttribute::new("email", &request.target_email_address),
                    UserAttribute::new("email_verified", "true"),
                ],
            )
            .await
            .map_err(|e| CustomerError::IdentityProvider(format!("{:#}", e)))?;

        let sub = created
            .attribute("sub")
            .ok_or_else(|| CustomerError::MissingAttribute {
                attribute: "sub".to_string(),
            })?;
        let email = created
            .attribute("email")
            .unwrap_or(request.target_email_address.as_str());

        let record = StagingRecord {
            user_id: sub.to_string(),
            username: Some(sub.to_string()),
            registration_status: Some(RegistrationStatus::Invited),
            email_address: Some(email.to_string()),
            inviter_email_address: Some(inviter_email),
            inviter_user_id: Some(request.inviter_user_sub.clone()),
            api_key_id: None,
            datetime_created: Some(Utc::now()),
        };

        let table = &self.config.pre_login_accounts_table_name;
        self.store
            .put(table, to_item(&record)?)
            .await
            .map_err(|e| CustomerError::write(table, e))?;

        info!(user_sub = %record.user_id, "Account invite recorded");
        Ok(record)
    }

    /// Staging rows still waiting for their invitee to register
    pub async fn list_pending_invites(&self) -> Result<Vec<StagingRecord>> {
        let table = &self.config.pre_login_accounts_table_name;
        let filter = ScanFilter::equals(
            "RegistrationStatus",
            "status",
            RegistrationStatus::Invited.to_string(),
        );

        let items = self
            .store
            .scan(table, &filter)
            .await
            .map_err(|e| CustomerError::read(table, e))?;

        items
            .into_iter()
            .map(|item| from_item(item).map_err(CustomerError::from))
            .collect()
    }

    /// Remove every durable trace of the account with subject `user_sub`.
    ///
    /// Steps run independently: the staging delete and the provider delete
    /// are each attempted exactly once whatever else fails. A provider user
    /// that is already gone counts as deleted, so a retry converges. Canonical rows
    /// are found by scanning for `UserPoolId = user_sub`; a row is deleted
    /// only after all of its API keys were revoked, so a retry can still
    /// find the keys. Any failures come back together as
    /// [`CustomerError::DeletionIncomplete`].
    pub async fn delete_account_by_user_id(&self, user_sub: &str) -> Result<DeletionReport> {
        let staging_table = &self.config.pre_login_accounts_table_name;
        let mut report = DeletionReport::new(user_sub);
        let mut failures = Vec::new();

        info!(user_sub = %user_sub, "Deleting account");

        match self.get_staging(user_sub).await {
            Ok(found) => report.staging_record_found = found.is_some(),
            Err(e) => {
                warn!(user_sub = %user_sub, error = %e, "Staging read failed, deleting anyway");
                failures.push(e);
            }
        }

        match self
            .store
            .delete(staging_table, &ItemKey::staging(user_sub))
            .await
        {
            Ok(()) => report.staging_record_deleted = true,
            Err(e) => {
                warn!(user_sub = %user_sub, error = %e, "Staging delete failed");
                failures.push(CustomerError::write(staging_table, e));
            }
        }

        match self
            .identity
            .admin_delete_user(&self.config.user_pool_id, user_sub)
            .await
        {
            Ok(found) => {
                if !found {
                    debug!(user_sub = %user_sub, "Identity-provider user already absent");
                }
                report.identity_user_found = found;
                report.identity_user_deleted = true;
            }
            Err(e) => {
                warn!(user_sub = %user_sub, error = %e, "Identity-provider delete failed");
                failures.push(CustomerError::IdentityProvider(format!("{:#}", e)));
            }
        }

        let customers_table = &self.config.customers_table_name;
        let filter = ScanFilter::equals("UserPoolId", "userId", user_sub);
        match self.store.scan(customers_table, &filter).await {
            Ok(items) => {
                for item in items {
                    match from_item::<CustomerRecord>(item) {
                        Ok(record) => self.remove_customer(&record, &mut report, &mut failures).await,
                        Err(e) => failures.push(e.into()),
                    }
                }
            }
            Err(e) => {
                warn!(user_sub = %user_sub, error = %e, "Customer scan failed");
                failures.push(CustomerError::read(customers_table, e));
            }
        }

        if failures.is_empty() {
            info!(
                user_sub = %user_sub,
                customers_deleted = report.customers_deleted.len(),
                api_keys_revoked = report.api_keys_revoked.len(),
                "Account deleted"
            );
            Ok(report)
        } else {
            warn!(user_sub = %user_sub, failures = failures.len(), "Account deletion incomplete");
            Err(CustomerError::DeletionIncomplete {
                report: Box::new(report),
                failures,
            })
        }
    }

    /// Revoke the keys of one canonical row, then delete the row.
    async fn remove_customer(
        &self,
        record: &CustomerRecord,
        report: &mut DeletionReport,
        failures: &mut Vec<CustomerError>,
    ) {
        report.customers_found.push(record.id.clone());

        let keys = match self
            .keys
            .fetch_api_keys(&ApiKeyQuery::by_name(&record.id))
            .await
        {
            Ok(keys) => keys,
            Err(e) => {
                warn!(identity_id = %record.id, error = %e, "API key discovery failed");
                failures.push(CustomerError::KeyRegistry(format!("{:#}", e)));
                return;
            }
        };

        // `by_name` is a prefix match: `identity-1` also returns the keys of
        // `identity-10`, which must survive.
        let mut all_revoked = true;
        for key in keys.iter().filter(|key| {
            key.name == record.id || record.api_key_id.as_deref() == Some(key.id.as_str())
        }) {
            match self.keys.delete_api_key(&key.id).await {
                Ok(()) => {
                    debug!(identity_id = %record.id, key_id = %key.id, "Revoked API key");
                    report.api_keys_revoked.push(key.id.clone());
                }
                Err(e) => {
                    warn!(identity_id = %record.id, key_id = %key.id, error = %e, "API key revocation failed");
                    failures.push(CustomerError::KeyRegistry(format!("{:#}", e)));
                    all_revoked = false;
                }
            }
        }

        if !all_revoked {
            return;
        }

        let table = &self.config.customers_table_name;
        match self
            .store
            .delete(table, &ItemKey::customer(&record.id))
            .await
        {
            Ok(()) => report.customers_deleted.push(record.id.clone()),
            Err(e) => failures.push(CustomerError::write(table, e)),
        }
    }
}
