//! Accept-time client metadata.

use serde::{Deserialize, Serialize};

/// Immutable snapshot of client metadata captured from the connection
/// handshake. Every field is optional: missing parameters never reject
/// a connection, they are simply absent downstream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_fields_omitted_on_wire() {
        let info = ClientInfo {
            platform: Some("ios".into()),
            ..Default::default()
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json, serde_json::json!({"platform": "ios"}));
    }

    #[test]
    fn test_camel_case_field_names() {
        let info = ClientInfo {
            device_type: Some("phone".into()),
            device_id: Some("d-1".into()),
            ..Default::default()
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"deviceType": "phone", "deviceId": "d-1"})
        );
    }
}
