//! Customer, staging and API key shapes
//!
//! Store items are plain JSON maps with the tables' PascalCase attribute
//! names; the typed records below convert in and out of them.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single table item as the store client sees it
pub type Item = Map<String, Value>;

/// Attribute name of the canonical table's partition key
pub const CUSTOMER_KEY_ATTRIBUTE: &str = "Id";
/// Attribute name of the staging table's partition key
pub const STAGING_KEY_ATTRIBUTE: &str = "UserId";

/// Registration progress of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationStatus {
    /// Invite sent, user has not completed sign-up
    Invited,
    /// User completed sign-up
    Registered,
}

impl std::fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistrationStatus::Invited => write!(f, "invited"),
            RegistrationStatus::Registered => write!(f, "registered"),
        }
    }
}

/// Canonical customer row, keyed by the identity-pool subject id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CustomerRecord {
    pub id: String,
    /// Identity-provider user subject. Absent on rows written before the
    /// column existed; such rows get repaired on the next read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_pool_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_status: Option<RegistrationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inviter_email_address: Option<String>,
    /// Attributes owned by other writers, carried through repairs untouched
    #[serde(flatten)]
    pub extra: Item,
}

impl CustomerRecord {
    pub fn new(
        id: impl Into<String>,
        user_pool_id: impl Into<String>,
        api_key_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            user_pool_id: Some(user_pool_id.into()),
            api_key_id: Some(api_key_id.into()),
            registration_status: None,
            inviter_email_address: None,
            extra: Item::new(),
        }
    }

    /// A row is up to date once it carries a non-empty `UserPoolId`.
    pub fn is_up_to_date(&self) -> bool {
        self.user_pool_id
            .as_deref()
            .map(|id| !id.is_empty())
            .unwrap_or(false)
    }

    pub fn with_registration_status(mut self, status: RegistrationStatus) -> Self {
        self.registration_status = Some(status);
        self
    }
}

/// Legacy pre-login row, keyed by the identity-provider user subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StagingRecord {
    pub user_id: String,
    /// Provider username, written alongside `UserId` by the invite flow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_status: Option<RegistrationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inviter_email_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inviter_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datetime_created: Option<DateTime<Utc>>,
}

impl StagingRecord {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: None,
            registration_status: None,
            email_address: None,
            inviter_email_address: None,
            inviter_user_id: None,
            api_key_id: None,
            datetime_created: None,
        }
    }

    pub fn with_registration_status(mut self, status: RegistrationStatus) -> Self {
        self.registration_status = Some(status);
        self
    }
}

/// Name/value attribute pair on an identity-provider user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserAttribute {
    pub name: String,
    pub value: String,
}

impl UserAttribute {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Identity-provider user as returned by lookups and creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IdentityUser {
    pub username: String,
    #[serde(default)]
    pub attributes: Vec<UserAttribute>,
}

impl IdentityUser {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attr| attr.name == name)
            .map(|attr| attr.value.as_str())
    }
}

/// API key as held by the key registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Filter criteria for API key discovery
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyQuery {
    /// Prefix match on the key name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
}

impl ApiKeyQuery {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name_query: Some(name.into()),
            customer_id: None,
        }
    }

    pub fn matches(&self, key: &ApiKey) -> bool {
        let name_ok = self
            .name_query
            .as_deref()
            .map(|prefix| key.name.starts_with(prefix))
            .unwrap_or(true);
        let customer_ok = match &self.customer_id {
            Some(id) => key.customer_id.as_deref() == Some(id.as_str()),
            None => true,
        };
        name_ok && customer_ok
    }
}

/// Partition key of a table item
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    pub attribute: String,
    pub value: String,
}

impl ItemKey {
    pub fn new(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Key of a canonical customer row
    pub fn customer(identity_id: &str) -> Self {
        Self::new(CUSTOMER_KEY_ATTRIBUTE, identity_id)
    }

    /// Key of a staging row
    pub fn staging(user_id: &str) -> Self {
        Self::new(STAGING_KEY_ATTRIBUTE, user_id)
    }

    pub fn matches(&self, item: &Item) -> bool {
        item.get(&self.attribute).and_then(Value::as_str) == Some(self.value.as_str())
    }
}

/// Single-attribute equality filter for table scans
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFilter {
    pub attribute: String,
    pub placeholder: String,
    pub value: String,
}

impl ScanFilter {
    pub fn equals(
        attribute: impl Into<String>,
        placeholder: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            attribute: attribute.into(),
            placeholder: placeholder.into(),
            value: value.into(),
        }
    }

    /// e.g. `UserPoolId = :userId`
    pub fn expression(&self) -> String {
        format!("{} = :{}", self.attribute, self.placeholder)
    }

    /// e.g. `{":userId": "<sub>"}`
    pub fn expression_values(&self) -> Item {
        let mut values = Item::new();
        values.insert(
            format!(":{}", self.placeholder),
            Value::String(self.value.clone()),
        );
        values
    }

    pub fn matches(&self, item: &Item) -> bool {
        item.get(&self.attribute).and_then(Value::as_str) == Some(self.value.as_str())
    }
}

/// Shape a record into a table item.
pub fn to_item<T: Serialize>(record: &T) -> Result<Item, serde_json::Error> {
    match serde_json::to_value(record)? {
        Value::Object(map) => Ok(map),
        other => Err(serde::ser::Error::custom(format!(
            "expected an object, got {}",
            other
        ))),
    }
}

/// Shape a table item into a record.
pub fn from_item<T: DeserializeOwned>(item: Item) -> Result<T, serde_json::Error> {
    serde_json::from_value(Value::Object(item))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_customer_record_uses_table_attribute_names() {
        let record = CustomerRecord::new("cognitoIdentityId", "cognitoUserId", "keyId")
            .with_registration_status(RegistrationStatus::Registered);

        let item = to_item(&record).unwrap();
        assert_eq!(
            Value::Object(item),
            json!({
                "Id": "cognitoIdentityId",
                "UserPoolId": "cognitoUserId",
                "ApiKeyId": "keyId",
                "RegistrationStatus": "registered"
            })
        );
    }

    #[test]
    fn test_customer_record_keeps_foreign_attributes() {
        let item = json!({
            "Id": "cognitoIdentityId",
            "ApiKeyId": "keyId",
            "MarketplaceCustomerId": "mp-123"
        });
        let Value::Object(item) = item else { unreachable!() };

        let record: CustomerRecord = from_item(item).unwrap();
        assert!(!record.is_up_to_date());
        assert_eq!(record.extra.get("MarketplaceCustomerId"), Some(&json!("mp-123")));

        let back = to_item(&record).unwrap();
        assert_eq!(back.get("MarketplaceCustomerId"), Some(&json!("mp-123")));
    }

    #[test]
    fn test_empty_user_pool_id_is_not_up_to_date() {
        let mut record = CustomerRecord::new("X", "", "K");
        assert!(!record.is_up_to_date());
        record.user_pool_id = Some("U".to_string());
        assert!(record.is_up_to_date());
    }

    #[test]
    fn test_staging_record_reads_user_id_and_username_together() {
        let Value::Object(item) = json!({
            "UserId": "12345678-1234-5678-9abc-123456789abc",
            "Username": "12345678-1234-5678-9abc-123456789abc",
            "RegistrationStatus": "invited"
        }) else {
            unreachable!()
        };

        let record: StagingRecord = from_item(item.clone()).unwrap();
        assert_eq!(record.user_id, "12345678-1234-5678-9abc-123456789abc");
        assert_eq!(record.username.as_deref(), Some("12345678-1234-5678-9abc-123456789abc"));
        assert_eq!(record.registration_status, Some(RegistrationStatus::Invited));
        assert_eq!(to_item(&record).unwrap(), item);
    }

    #[test]
    fn test_scan_filter_expression() {
        let filter = ScanFilter::equals("UserPoolId", "userId", "sub1");
        assert_eq!(filter.expression(), "UserPoolId = :userId");
        assert_eq!(filter.expression_values().get(":userId"), Some(&json!("sub1")));
    }

    #[test]
    fn test_api_key_query_is_prefix_match() {
        let key = ApiKey {
            id: "k1".to_string(),
            name: "identity-1/usage-plan".to_string(),
            customer_id: None,
            enabled: true,
        };
        assert!(ApiKeyQuery::by_name("identity-1").matches(&key));
        assert!(!ApiKeyQuery::by_name("identity-2").matches(&key));
        assert!(ApiKeyQuery::default().matches(&key));
    }
}
