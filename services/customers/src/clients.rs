//! Collaborator Seams
//!
//! Trait-based abstractions over the key-value store, the identity provider
//! and the API key registry. The workflows only ever see these traits.

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{ApiKey, ApiKeyQuery, IdentityUser, Item, ItemKey, ScanFilter, UserAttribute};

/// Minimal key-value access to the staging and canonical tables
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Fetch an item by partition key, `None` when absent
    async fn get(&self, table: &str, key: &ItemKey) -> Result<Option<Item>>;

    /// Insert or replace an item
    async fn put(&self, table: &str, item: Item) -> Result<()>;

    /// Remove an item; removing an absent key succeeds
    async fn delete(&self, table: &str, key: &ItemKey) -> Result<()>;

    /// Every item matching the filter, across all pages
    async fn scan(&self, table: &str, filter: &ScanFilter) -> Result<Vec<Item>>;
}

/// User management in the identity provider
#[async_trait]
pub trait IdentityProviderClient: Send + Sync {
    /// Users in the pool matching a filter such as `sub = "<id>"`
    async fn list_users(&self, user_pool_id: &str, filter: &str) -> Result<Vec<IdentityUser>>;

    /// Create a user; the returned user carries the provider-assigned `sub`
    async fn admin_create_user(
        &self,
        user_pool_id: &str,
        username: &str,
        attributes: Vec<UserAttribute>,
    ) -> Result<IdentityUser>;

    /// Delete a user by username or subject id.
    ///
    /// Returns `false` when no such user exists; implementations map the
    /// provider's not-found error to that instead of failing.
    async fn admin_delete_user(&self, user_pool_id: &str, username: &str) -> Result<bool>;
}

/// Discovery and revocation of API keys
#[async_trait]
pub trait ApiKeyRegistry: Send + Sync {
    /// Every key matching the query, across all pages
    async fn fetch_api_keys(&self, query: &ApiKeyQuery) -> Result<Vec<ApiKey>>;

    async fn delete_api_key(&self, key_id: &str) -> Result<()>;
}
