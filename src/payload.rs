use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

/// One event submitted to the ingestion endpoint.
///
/// Fields missing from the request body, or set to `null`, take their zero
/// value; nothing is validated beyond the JSON shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Payload {
    #[serde(deserialize_with = "null_as_default")]
    pub user_id: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub total: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(deserialize_with = "null_as_default")]
    pub meta: Meta,
    #[serde(deserialize_with = "null_as_default")]
    pub completed: bool,
}

/// Nested metadata carried by a payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Meta {
    /// Login history, most recent last. `None` serializes as `null`.
    pub logins: Option<Vec<Login>>,
    /// Phone numbers keyed by label.
    pub phone_numbers: Option<HashMap<String, String>>,
}

/// A single login record. Neither field is parsed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Login {
    #[serde(deserialize_with = "null_as_default")]
    pub time: String,
    #[serde(deserialize_with = "null_as_default")]
    pub ip: String,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    let opt = Option::<T>::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

/// Payloads captured by one flush, in insertion order.
///
/// A batch owns its payloads; later inserts into the buffer never touch it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Batch {
    payloads: Vec<Payload>,
}

impl Batch {
    pub fn new(payloads: Vec<Payload>) -> Self {
        Self { payloads }
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn payloads(&self) -> &[Payload] {
        &self.payloads
    }

    pub fn into_payloads(self) -> Vec<Payload> {
        self.payloads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_full_body() {
        let body = r#"{
            "user_id": 42,
            "total": 19.99,
            "title": "order",
            "meta": {
                "logins": [
                    {"time": "2024-01-01T00:00:00Z", "ip": "10.0.0.1"},
                    {"time": "2024-01-02T00:00:00Z", "ip": "10.0.0.2"}
                ],
                "phone_numbers": {"home": "555-0100", "mobile": "555-0101"}
            },
            "completed": true
        }"#;

        let p: Payload = serde_json::from_str(body).expect("deserialize");
        assert_eq!(p.user_id, 42);
        assert_eq!(p.title, "order");
        assert!(p.completed);

        let logins = p.meta.logins.as_ref().expect("logins present");
        assert_eq!(logins.len(), 2);
        assert_eq!(logins[1].ip, "10.0.0.2");

        let phones = p.meta.phone_numbers.as_ref().expect("phones present");
        assert_eq!(phones.get("mobile").map(String::as_str), Some("555-0101"));
    }

    #[test]
    fn test_payload_missing_fields_use_zero_values() {
        let p: Payload = serde_json::from_str(r#"{"title": "partial"}"#).expect("deserialize");
        assert_eq!(p.user_id, 0);
        assert_eq!(p.total, 0.0);
        assert!(!p.completed);
        assert!(p.meta.logins.is_none());
        assert!(p.meta.phone_numbers.is_none());
    }

    #[test]
    fn test_payload_null_fields_use_zero_values() {
        let body = r#"{
            "user_id": null,
            "total": null,
            "title": null,
            "meta": null,
            "completed": null
        }"#;
        let p: Payload = serde_json::from_str(body).expect("deserialize");
        assert_eq!(p, Payload::default());

        let p: Payload = serde_json::from_str(
            r#"{"user_id": 5, "meta": {"logins": [{"time": null, "ip": "10.0.0.1"}]}}"#,
        )
        .expect("deserialize");
        assert_eq!(p.user_id, 5);
        let logins = p.meta.logins.expect("logins present");
        assert_eq!(logins[0].time, "");
        assert_eq!(logins[0].ip, "10.0.0.1");
    }

    #[test]
    fn test_payload_wrong_type_is_rejected() {
        let res = serde_json::from_str::<Payload>(r#"{"user_id": "not a number"}"#);
        assert!(res.is_err());

        let res = serde_json::from_str::<Payload>("[1, 2, 3]");
        assert!(res.is_err());
    }

    #[test]
    fn test_absent_meta_collections_serialize_as_null() {
        let json = serde_json::to_value(Payload::default()).expect("serialize");
        assert!(json["meta"]["logins"].is_null());
        assert!(json["meta"]["phone_numbers"].is_null());
    }

    #[test]
    fn test_batch_serializes_as_array_in_order() {
        let batch = Batch::new(vec![
            Payload {
                user_id: 1,
                ..Default::default()
            },
            Payload {
                user_id: 2,
                ..Default::default()
            },
        ]);

        let json = serde_json::to_value(&batch).expect("serialize");
        let items = json.as_array().expect("array");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["user_id"], 1);
        assert_eq!(items[1]["user_id"], 2);
    }
}
