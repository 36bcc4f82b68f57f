//! Table and pool configuration
//!
//! Passed explicitly into [`crate::CustomerLifecycle`] so that several
//! instances with different tables can live in one process.

use serde::{Deserialize, Serialize};
use std::env;
use thiserror::Error;

/// Environment option naming the identity-provider user pool.
pub const USER_POOL_ID_VAR: &str = "UserPoolId";
/// Environment option naming the legacy pre-login (staging) table.
pub const PRE_LOGIN_ACCOUNTS_TABLE_VAR: &str = "PreLoginAccountsTableName";
/// Environment option naming the canonical customers table.
pub const CUSTOMERS_TABLE_VAR: &str = "CustomersTableName";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration option: {0}")]
    Missing(&'static str),
}

/// Where the customer lifecycle reads and writes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomersConfig {
    /// Identity-provider user pool
    pub user_pool_id: String,
    /// Staging table, keyed by `UserId`
    pub pre_login_accounts_table_name: String,
    /// Canonical table, keyed by `Id`
    pub customers_table_name: String,
}

impl CustomersConfig {
    pub fn new(
        user_pool_id: impl Into<String>,
        pre_login_accounts_table_name: impl Into<String>,
        customers_table_name: impl Into<String>,
    ) -> Self {
        Self {
            user_pool_id: user_pool_id.into(),
            pre_login_accounts_table_name: pre_login_accounts_table_name.into(),
            customers_table_name: customers_table_name.into(),
        }
    }

    /// Build from `UserPoolId`, `PreLoginAccountsTableName` and `CustomersTableName`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| {
            lookup(name)
                .filter(|value| !value.trim().is_empty())
                .ok_or(ConfigError::Missing(name))
        };

        Ok(Self {
            user_pool_id: required(USER_POOL_ID_VAR)?,
            pre_login_accounts_table_name: required(PRE_LOGIN_ACCOUNTS_TABLE_VAR)?,
            customers_table_name: required(CUSTOMERS_TABLE_VAR)?,
        })
    }
}
