//! In-Memory Collaborators
//!
//! Store, identity provider and key registry kept in process memory. Every
//! call is recorded in a [`CallLog`] and any operation can be made to fail,
//! which is what the workflow tests assert against. [`LocalEnvironment`]
//! bundles all three and persists them to a JSON file for `customersctl`.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clients::{ApiKeyRegistry, IdentityProviderClient, StoreClient};
use crate::config::CustomersConfig;
use crate::types::{
    ApiKey, ApiKeyQuery, IdentityUser, Item, ItemKey, ScanFilter, UserAttribute,
    CUSTOMER_KEY_ATTRIBUTE, STAGING_KEY_ATTRIBUTE,
};

/// One recorded collaborator call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub operation: &'static str,
    /// Table, pool or key the call addressed
    pub target: String,
}

/// Records calls and injects failures
#[derive(Debug, Default)]
pub struct CallLog {
    calls: Mutex<Vec<Call>>,
    /// Failing operations, optionally limited to one target
    failing: Mutex<Vec<(&'static str, Option<String>)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CallLog {
    fn record(&self, operation: &'static str, target: &str) -> Result<()> {
        lock(&self.calls).push(Call {
            operation,
            target: target.to_string(),
        });

        let fails = lock(&self.failing).iter().any(|(op, only)| {
            *op == operation && only.as_deref().map_or(true, |t| t == target)
        });
        if fails {
            bail!("injected failure in {} ({})", operation, target);
        }
        Ok(())
    }

    /// Make every later call to `operation` fail.
    pub fn fail(&self, operation: &'static str) {
        lock(&self.failing).push((operation, None));
    }

    /// Make later calls to `operation` fail only when they address `target`.
    pub fn fail_on(&self, operation: &'static str, target: &str) {
        lock(&self.failing).push((operation, Some(target.to_string())));
    }

    /// Stop failing `operation`, on every target.
    pub fn recover(&self, operation: &'static str) {
        lock(&self.failing).retain(|(op, _)| *op != operation);
    }

    pub fn count(&self, operation: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    pub fn count_on(&self, operation: &str, target: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| c.operation == operation && c.target == target)
            .count()
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }

    pub fn clear(&self) {
        lock(&self.calls).clear();
    }
}

// ============================================================
// Store
// ============================================================

/// Contents of one table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableState {
    pub key_attribute: String,
    /// Items by partition key value
    pub items: BTreeMap<String, Item>,
}

/// Serializable contents of an [`InMemoryStore`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreState {
    pub tables: BTreeMap<String, TableState>,
}

/// Key-value store holding named tables with a single partition key each
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
    pub log: CallLog,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with the staging and canonical tables from `config`
    pub fn for_config(config: &CustomersConfig) -> Self {
        let mut state = StoreState::default();
        for (table, key) in [
            (&config.pre_login_accounts_table_name, STAGING_KEY_ATTRIBUTE),
            (&config.customers_table_name, CUSTOMER_KEY_ATTRIBUTE),
        ] {
            state.tables.insert(
                table.clone(),
                TableState {
                    key_attribute: key.to_string(),
                    items: BTreeMap::new(),
                },
            );
        }
        Self::restore(state)
    }

    pub fn restore(state: StoreState) -> Self {
        Self {
            state: RwLock::new(state),
            log: CallLog::default(),
        }
    }

    pub async fn create_table(&self, table: &str, key_attribute: &str) {
        self.state
            .write()
            .await
            .tables
            .entry(table.to_string())
            .or_insert_with(|| TableState {
                key_attribute: key_attribute.to_string(),
                items: BTreeMap::new(),
            });
    }

    /// Insert directly, bypassing the call log
    pub async fn seed(&self, table: &str, item: Item) -> Result<()> {
        let mut state = self.state.write().await;
        insert(&mut state, table, item)
    }

    /// Read directly, bypassing the call log
    pub async fn item(&self, table: &str, key_value: &str) -> Option<Item> {
        let state = self.state.read().await;
        state.tables.get(table)?.items.get(key_value).cloned()
    }

    pub async fn len(&self, table: &str) -> usize {
        let state = self.state.read().await;
        state.tables.get(table).map_or(0, |t| t.items.len())
    }

    pub async fn snapshot(&self) -> StoreState {
        self.state.read().await.clone()
    }
}

fn table_mut<'a>(state: &'a mut StoreState, table: &str) -> Result<&'a mut TableState> {
    state
        .tables
        .get_mut(table)
        .ok_or_else(|| anyhow!("Requested resource not found: table {}", table))
}

fn table_ref<'a>(state: &'a StoreState, table: &str) -> Result<&'a TableState> {
    state
        .tables
        .get(table)
        .ok_or_else(|| anyhow!("Requested resource not found: table {}", table))
}

fn insert(state: &mut StoreState, table: &str, item: Item) -> Result<()> {
    let table_state = table_mut(state, table)?;
    let key = item
        .get(&table_state.key_attribute)
        .and_then(|v| v.as_str())
        .with_context(|| {
            format!(
                "Item is missing key attribute {} for table {}",
                table_state.key_attribute, table
            )
        })?
        .to_string();
    table_state.items.insert(key, item);
    Ok(())
}

fn check_key(table_state: &TableState, table: &str, key: &ItemKey) -> Result<()> {
    if table_state.key_attribute != key.attribute {
        bail!(
            "The provided key element {} does not match the schema of table {} ({})",
            key.attribute,
            table,
            table_state.key_attribute
        );
    }
    Ok(())
}

#[async_trait]
impl StoreClient for InMemoryStore {
    async fn get(&self, table: &str, key: &ItemKey) -> Result<Option<Item>> {
        self.log.record("get", table)?;
        let state = self.state.read().await;
        let table_state = table_ref(&state, table)?;
        check_key(table_state, table, key)?;
        Ok(table_state.items.get(&key.value).cloned())
    }

    async fn put(&self, table: &str, item: Item) -> Result<()> {
        self.log.record("put", table)?;
        let mut state = self.state.write().await;
        insert(&mut state, table, item)
    }

    async fn delete(&self, table: &str, key: &ItemKey) -> Result<()> {
        self.log.record("delete", table)?;
        let mut state = self.state.write().await;
        let table_state = table_mut(&mut state, table)?;
        check_key(table_state, table, key)?;
        table_state.items.remove(&key.value);
        Ok(())
    }

    async fn scan(&self, table: &str, filter: &ScanFilter) -> Result<Vec<Item>> {
        self.log.record("scan", table)?;
        let state = self.state.read().await;
        let table_state = table_ref(&state, table)?;
        Ok(table_state
            .items
            .values()
            .filter(|item| filter.matches(item))
            .cloned()
            .collect())
    }
}

// ============================================================
// Identity provider
// ============================================================

/// Serializable contents of an [`InMemoryIdentityProvider`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityState {
    /// Users by pool id
    pub pools: BTreeMap<String, Vec<IdentityUser>>,
}

/// User pools keyed by pool id; new users get a random `sub`
#[derive(Debug, Default)]
pub struct InMemoryIdentityProvider {
    state: RwLock<IdentityState>,
    pub log: CallLog,
}

/// Parse `attr = "value"` (exact) or `attr ^= "value"` (prefix).
fn parse_filter(filter: &str) -> Result<Option<(String, bool, String)>> {
    let filter = filter.trim();
    if filter.is_empty() {
        return Ok(None);
    }

    let (attribute, prefix, value) = if let Some((attr, value)) = filter.split_once("^=") {
        (attr, true, value)
    } else if let Some((attr, value)) = filter.split_once('=') {
        (attr, false, value)
    } else {
        bail!("Invalid filter expression: {}", filter);
    };

    let value = value.trim();
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .with_context(|| format!("Filter value must be quoted: {}", filter))?;

    Ok(Some((attribute.trim().to_string(), prefix, value.to_string())))
}

fn user_matches(user: &IdentityUser, attribute: &str, prefix: bool, value: &str) -> bool {
    let actual = if attribute == "username" {
        Some(user.username.as_str())
    } else {
        user.attribute(attribute)
    };
    match actual {
        Some(actual) if prefix => actual.starts_with(value),
        Some(actual) => actual == value,
        None => false,
    }
}

fn is_same_user(user: &IdentityUser, username: &str) -> bool {
    user.username == username
        || user.attribute("sub") == Some(username)
        || user.attribute("email") == Some(username)
}

impl InMemoryIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore(state: IdentityState) -> Self {
        Self {
            state: RwLock::new(state),
            log: CallLog::default(),
        }
    }

    /// Add a user directly, bypassing the call log
    pub async fn seed(&self, user_pool_id: &str, user: IdentityUser) {
        self.state
            .write()
            .await
            .pools
            .entry(user_pool_id.to_string())
            .or_default()
            .push(user);
    }

    pub async fn users(&self, user_pool_id: &str) -> Vec<IdentityUser> {
        let state = self.state.read().await;
        state.pools.get(user_pool_id).cloned().unwrap_or_default()
    }

    pub async fn snapshot(&self) -> IdentityState {
        self.state.read().await.clone()
    }
}

#[async_trait]
impl IdentityProviderClient for InMemoryIdentityProvider {
    async fn list_users(&self, user_pool_id: &str, filter: &str) -> Result<Vec<IdentityUser>> {
        self.log.record("list_users", user_pool_id)?;
        let parsed = parse_filter(filter)?;
        let state = self.state.read().await;
        let users = state.pools.get(user_pool_id).map(Vec::as_slice).unwrap_or(&[]);

        Ok(users
            .iter()
            .filter(|user| match &parsed {
                Some((attribute, prefix, value)) => user_matches(user, attribute, *prefix, value),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn admin_create_user(
        &self,
        user_pool_id: &str,
        username: &str,
        attributes: Vec<UserAttribute>,
    ) -> Result<IdentityUser> {
        self.log.record("admin_create_user", user_pool_id)?;
        let mut state = self.state.write().await;
        let users = state.pools.entry(user_pool_id.to_string()).or_default();

        if users.iter().any(|user| is_same_user(user, username)) {
            bail!("UsernameExistsException: An account with the given username already exists: {}", username);
        }

        let sub = Uuid::new_v4().to_string();
        let mut attributes: Vec<UserAttribute> = attributes
            .into_iter()
            .filter(|attr| attr.name != "sub")
            .collect();
        if !attributes.iter().any(|attr| attr.name == "email") && username.contains('@') {
            attributes.push(UserAttribute::new("email", username));
        }
        attributes.push(UserAttribute::new("sub", sub.clone()));

        let user = IdentityUser {
            username: sub,
            attributes,
        };
        users.push(user.clone());

        debug!(user_pool_id = %user_pool_id, username = %username, "Created user");
        Ok(user)
    }

    async fn admin_delete_user(&self, user_pool_id: &str, username: &str) -> Result<bool> {
        self.log.record("admin_delete_user", user_pool_id)?;
        let mut state = self.state.write().await;
        let users = state
            .pools
            .get_mut(user_pool_id)
            .with_context(|| format!("ResourceNotFoundException: User pool {} does not exist", user_pool_id))?;

        let before = users.len();
        users.retain(|user| !is_same_user(user, username));
        Ok(users.len() < before)
    }
}

// ============================================================
// Key registry
// ============================================================

/// API keys by id
#[derive(Debug, Default)]
pub struct InMemoryKeyRegistry {
    keys: RwLock<BTreeMap<String, ApiKey>>,
    pub log: CallLog,
}

impl InMemoryKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore(keys: Vec<ApiKey>) -> Self {
        Self {
            keys: RwLock::new(keys.into_iter().map(|k| (k.id.clone(), k)).collect()),
            log: CallLog::default(),
        }
    }

    /// Add a key directly, bypassing the call log
    pub async fn seed(&self, key: ApiKey) {
        self.keys.write().await.insert(key.id.clone(), key);
    }

    pub async fn contains(&self, key_id: &str) -> bool {
        self.keys.read().await.contains_key(key_id)
    }

    pub async fn snapshot(&self) -> Vec<ApiKey> {
        self.keys.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl ApiKeyRegistry for InMemoryKeyRegistry {
    async fn fetch_api_keys(&self, query: &ApiKeyQuery) -> Result<Vec<ApiKey>> {
        let target = query.name_query.as_deref().unwrap_or("*");
        self.log.record("fetch_api_keys", target)?;
        let keys = self.keys.read().await;
        Ok(keys.values().filter(|k| query.matches(k)).cloned().collect())
    }

    async fn delete_api_key(&self, key_id: &str) -> Result<()> {
        self.log.record("delete_api_key", key_id)?;
        match self.keys.write().await.remove(key_id) {
            Some(_) => Ok(()),
            None => bail!("NotFoundException: Invalid API Key identifier specified: {}", key_id),
        }
    }
}

// ============================================================
// Local environment
// ============================================================

/// Everything a [`LocalEnvironment`] persists
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalState {
    #[serde(default)]
    pub store: StoreState,
    #[serde(default)]
    pub identity: IdentityState,
    #[serde(default)]
    pub api_keys: Vec<ApiKey>,
}

/// The three in-memory collaborators, persisted together
pub struct LocalEnvironment {
    pub config: CustomersConfig,
    pub store: Arc<InMemoryStore>,
    pub identity: Arc<InMemoryIdentityProvider>,
    pub keys: Arc<InMemoryKeyRegistry>,
}

impl LocalEnvironment {
    /// Empty environment with the tables `config` names
    pub fn new(config: CustomersConfig) -> Self {
        Self {
            store: Arc::new(InMemoryStore::for_config(&config)),
            identity: Arc::new(InMemoryIdentityProvider::new()),
            keys: Arc::new(InMemoryKeyRegistry::new()),
            config,
        }
    }

    /// Load from `path`, or start empty when the file does not exist yet.
    ///
    /// Tables named by `config` are created if the saved state lacks them.
    pub async fn load(path: &Path, config: CustomersConfig) -> Result<Self> {
        if !tokio::fs::try_exists(path)
            .await
            .with_context(|| format!("Failed to stat state file: {:?}", path))?
        {
            info!(path = ?path, "No state file yet, starting empty");
            return Ok(Self::new(config));
        }

        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read state file: {:?}", path))?;
        let state: LocalState = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse state file: {:?}", path))?;

        let env = Self {
            store: Arc::new(InMemoryStore::restore(state.store)),
            identity: Arc::new(InMemoryIdentityProvider::restore(state.identity)),
            keys: Arc::new(InMemoryKeyRegistry::restore(state.api_keys)),
            config,
        };
        env.store
            .create_table(&env.config.pre_login_accounts_table_name, STAGING_KEY_ATTRIBUTE)
            .await;
        env.store
            .create_table(&env.config.customers_table_name, CUSTOMER_KEY_ATTRIBUTE)
            .await;

        debug!(path = ?path, "Loaded local state");
        Ok(env)
    }

    pub async fn snapshot(&self) -> LocalState {
        LocalState {
            store: self.store.snapshot().await,
            identity: self.identity.snapshot().await,
            api_keys: self.keys.snapshot().await,
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.snapshot().await)
            .context("Failed to serialize local state")?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write state file: {:?}", path))?;
        debug!(path = ?path, "Saved local state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn item(value: serde_json::Value) -> Item {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn config() -> CustomersConfig {
        CustomersConfig::new("user-pool-id", "PreLoginAccountsTable", "DevPortalCustomers")
    }

    #[tokio::test]
    async fn test_store_put_get_delete() {
        let store = InMemoryStore::for_config(&config());
        let key = ItemKey::customer("X");

        store
            .put("DevPortalCustomers", item(json!({"Id": "X", "UserPoolId": "U"})))
            .await
            .unwrap();
        let found = store.get("DevPortalCustomers", &key).await.unwrap();
        assert_eq!(found.unwrap().get("UserPoolId"), Some(&json!("U")));

        store.delete("DevPortalCustomers", &key).await.unwrap();
        store.delete("DevPortalCustomers", &key).await.unwrap();
        assert!(store.get("DevPortalCustomers", &key).await.unwrap().is_none());

        assert_eq!(store.log.count("delete"), 2);
        assert_eq!(store.log.count_on("get", "DevPortalCustomers"), 2);
    }

    #[tokio::test]
    async fn test_store_rejects_wrong_key_and_unknown_table() {
        let store = InMemoryStore::for_config(&config());

        assert!(store
            .get("DevPortalCustomers", &ItemKey::staging("U"))
            .await
            .is_err());
        assert!(store.get("Missing", &ItemKey::customer("X")).await.is_err());
        assert!(store
            .put("DevPortalCustomers", item(json!({"UserId": "U"})))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_store_scan_filters_by_attribute() {
        let store = InMemoryStore::for_config(&config());
        store
            .seed("DevPortalCustomers", item(json!({"Id": "A", "UserPoolId": "sub1"})))
            .await
            .unwrap();
        store
            .seed("DevPortalCustomers", item(json!({"Id": "B", "UserPoolId": "sub2"})))
            .await
            .unwrap();

        let filter = ScanFilter::equals("UserPoolId", "userId", "sub1");
        let found = store.scan("DevPortalCustomers", &filter).await.unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].get("Id"), Some(&json!("A")));
    }

    #[tokio::test]
    async fn test_injected_failure_is_logged_and_returned() {
        let store = InMemoryStore::for_config(&config());
        store.log.fail("put");

        let result = store
            .put("DevPortalCustomers", item(json!({"Id": "X"})))
            .await;

        assert!(result.is_err());
        assert_eq!(store.log.count("put"), 1);
        assert_eq!(store.len("DevPortalCustomers").await, 0);

        store.log.recover("put");
        store
            .put("DevPortalCustomers", item(json!({"Id": "X"})))
            .await
            .unwrap();
        assert_eq!(store.len("DevPortalCustomers").await, 1);
    }

    #[tokio::test]
    async fn test_failure_limited_to_one_table() {
        let store = InMemoryStore::for_config(&config());
        store.log.fail_on("get", "PreLoginAccountsTable");

        assert!(store
            .get("PreLoginAccountsTable", &ItemKey::staging("U"))
            .await
            .is_err());
        assert!(store
            .get("DevPortalCustomers", &ItemKey::customer("X"))
            .await
            .unwrap()
            .is_none());

        store.log.recover("get");
        assert!(store
            .get("PreLoginAccountsTable", &ItemKey::staging("U"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_identity_provider_create_list_delete() {
        let idp = InMemoryIdentityProvider::new();

        let user = idp
            .admin_create_user("pool", "user@example.com", vec![])
            .await
            .unwrap();
        let sub = user.attribute("sub").unwrap().to_string();
        assert_eq!(user.username, sub);
        assert_eq!(user.attribute("email"), Some("user@example.com"));

        let found = idp
            .list_users("pool", &format!("sub = \"{}\"", sub))
            .await
            .unwrap();
        assert_eq!(found, vec![user.clone()]);

        let by_prefix = idp.list_users("pool", "email ^= \"user@\"").await.unwrap();
        assert_eq!(by_prefix.len(), 1);

        assert!(idp
            .admin_create_user("pool", "user@example.com", vec![])
            .await
            .is_err());

        assert!(idp.admin_delete_user("pool", &sub).await.unwrap());
        assert!(idp.users("pool").await.is_empty());
        assert!(!idp.admin_delete_user("pool", &sub).await.unwrap());
    }

    #[test]
    fn test_parse_filter() {
        assert_eq!(parse_filter("").unwrap(), None);
        assert_eq!(
            parse_filter("sub = \"abc\"").unwrap(),
            Some(("sub".to_string(), false, "abc".to_string()))
        );
        assert!(parse_filter("sub = abc").is_err());
        assert!(parse_filter("nonsense").is_err());
    }

    #[tokio::test]
    async fn test_key_registry_fetch_and_delete() {
        let keys = InMemoryKeyRegistry::restore(vec![
            ApiKey {
                id: "k1".to_string(),
                name: "identity-1".to_string(),
                customer_id: None,
                enabled: true,
            },
            ApiKey {
                id: "k2".to_string(),
                name: "identity-2".to_string(),
                customer_id: None,
                enabled: true,
            },
        ]);

        let found = keys
            .fetch_api_keys(&ApiKeyQuery::by_name("identity-1"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);

        keys.delete_api_key("k1").await.unwrap();
        assert!(!keys.contains("k1").await);
        assert!(keys.delete_api_key("k1").await.is_err());
    }

    #[tokio::test]
    async fn test_local_environment_round_trips_through_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let env = LocalEnvironment::load(&path, config()).await.unwrap();
        env.store
            .seed("DevPortalCustomers", item(json!({"Id": "X", "UserPoolId": "U"})))
            .await
            .unwrap();
        env.identity
            .seed(
                "user-pool-id",
                IdentityUser {
                    username: "U".to_string(),
                    attributes: vec![UserAttribute::new("sub", "U")],
                },
            )
            .await;
        env.save(&path).await.unwrap();

        let reloaded = LocalEnvironment::load(&path, config()).await.unwrap();
        assert!(reloaded.store.item("DevPortalCustomers", "X").await.is_some());
        assert_eq!(reloaded.identity.users("user-pool-id").await.len(), 1);
        assert_eq!(reloaded.snapshot().await, env.snapshot().await);
    }
}
