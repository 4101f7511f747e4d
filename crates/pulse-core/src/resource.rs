//! Per-resource endpoint configuration and change tagging.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Configuration binding one logical collection to its backend surface.
///
/// The full endpoint table is maintained by the embedding application;
/// this type is the interface a live data manager consumes. `create_api`,
/// `update_api` and `delete_api` are optional; a collection without them
/// is read-only and the corresponding operations fail fast.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    /// Record field whose uniqueness is enforced within the collection.
    pub id_field: String,
    /// Topics to subscribe to for change notifications.
    pub subscribe_topics: Vec<String>,
    /// Endpoint for creating a new entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_api: Option<String>,
    /// Endpoint for the initial bulk read.
    pub read_api: String,
    /// Field within the bulk-read response holding the record array.
    pub read_api_array_field: String,
    /// Endpoint for updating an entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_api: Option<String>,
    /// Endpoint for deleting an entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_api: Option<String>,
}

/// The kind of change a streamed record announces, decoded from the
/// numeric `crud` tag it carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    /// A new record (tag 1).
    Create,
    /// A read marker (tag 2); never expected on the stream.
    Read,
    /// A partial or full update to an existing record (tag 3).
    Update,
    /// A record removal (tag 4).
    Delete,
}

impl ChangeKind {
    /// Decode a raw numeric tag.
    #[must_use]
    pub fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            1 => Some(Self::Create),
            2 => Some(Self::Read),
            3 => Some(Self::Update),
            4 => Some(Self::Delete),
            _ => None,
        }
    }

    /// Read the `crud` tag off a streamed record.
    #[must_use]
    pub fn from_record(record: &Value) -> Option<Self> {
        record.get("crud").and_then(Value::as_u64).and_then(Self::from_tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn config_parses_with_optional_endpoints_missing() {
        let config: ResourceConfig = serde_json::from_value(json!({
            "idField": "locationID",
            "subscribeTopics": ["SRV/sites"],
            "readAPI": "/API/setup/getSites",
            "readAPIArrayField": "sites",
        }))
        .unwrap();
        assert_eq!(config.id_field, "locationID");
        assert_eq!(config.subscribe_topics, vec!["SRV/sites".to_string()]);
        assert!(config.create_api.is_none());
        assert!(config.update_api.is_none());
        assert!(config.delete_api.is_none());
    }

    #[test]
    fn config_serializes_camel_case() {
        let config = ResourceConfig {
            id_field: "userID".into(),
            subscribe_topics: vec!["SRV/users".into()],
            create_api: Some("/API/createUser".into()),
            read_api: "/API/getUsers".into(),
            read_api_array_field: "users".into(),
            update_api: Some("/API/updateUser".into()),
            delete_api: None,
        };
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["idField"], "userID");
        assert_eq!(value["readAPIArrayField"], "users");
        assert_eq!(value["createAPI"], "/API/createUser");
        assert!(value.get("deleteAPI").is_none());
    }

    #[test]
    fn change_kind_tags() {
        assert_eq!(ChangeKind::from_tag(1), Some(ChangeKind::Create));
        assert_eq!(ChangeKind::from_tag(2), Some(ChangeKind::Read));
        assert_eq!(ChangeKind::from_tag(3), Some(ChangeKind::Update));
        assert_eq!(ChangeKind::from_tag(4), Some(ChangeKind::Delete));
        assert_eq!(ChangeKind::from_tag(0), None);
        assert_eq!(ChangeKind::from_tag(5), None);
    }

    #[test]
    fn change_kind_from_record() {
        let record = json!({"locationID": 5, "crud": 3});
        assert_eq!(ChangeKind::from_record(&record), Some(ChangeKind::Update));
    }

    #[test]
    fn record_without_tag_yields_none() {
        assert_eq!(ChangeKind::from_record(&json!({"locationID": 5})), None);
        assert_eq!(ChangeKind::from_record(&json!({"crud": "three"})), None);
        assert_eq!(ChangeKind::from_record(&json!(null)), None);
    }
}
