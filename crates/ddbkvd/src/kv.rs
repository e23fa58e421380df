//! DynamoDB request bodies for the KV schema, and value extraction from
//! GetItem responses.
//!
//! Items live in a table with a string hash key `K` and a binary value
//! attribute `V`. All requests ask for consumed capacity so the request
//! queues can meter themselves.

use data_encoding::BASE64;
use serde_json::json;

pub fn put_body(table: &str, key: &str, value: &[u8]) -> String {
    json!({
        "TableName": table,
        "Item": {
            "K": { "S": key },
            "V": { "B": BASE64.encode(value) },
        },
        "ReturnConsumedCapacity": "TOTAL",
    })
    .to_string()
}

pub fn get_body(table: &str, key: &str) -> String {
    json!({
        "TableName": table,
        "Key": { "K": { "S": key } },
        "ReturnConsumedCapacity": "TOTAL",
    })
    .to_string()
}

pub fn getc_body(table: &str, key: &str) -> String {
    json!({
        "ConsistentRead": true,
        "TableName": table,
        "Key": { "K": { "S": key } },
        "ReturnConsumedCapacity": "TOTAL",
    })
    .to_string()
}

pub fn delete_body(table: &str, key: &str) -> String {
    json!({
        "TableName": table,
        "Key": { "K": { "S": key } },
        "ReturnConsumedCapacity": "TOTAL",
    })
    .to_string()
}

/// Extract and base64-decode `Item.V.B` from a GetItem response body.
/// Returns None when the item or attribute is absent, or when the field
/// does not decode; callers treat all of those as "no value".
pub fn extract_value(body: Option<&[u8]>) -> Option<Vec<u8>> {
    let body = body?;
    let v: serde_json::Value = serde_json::from_slice(body).ok()?;
    let b64 = v.get("Item")?.get("V")?.get("B")?.as_str()?;
    let value = BASE64.decode(b64.as_bytes()).ok()?;
    if value.len() >= u32::MAX as usize {
        return None;
    }
    Some(value)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::Value;

    #[test]
    fn put_body_shape() {
        let body: Value = serde_json::from_str(&put_body("tbl", "key1", b"value\n")).unwrap();
        k9::assert_equal!(
            body,
            json!({
                "TableName": "tbl",
                "Item": {
                    "K": { "S": "key1" },
                    "V": { "B": "dmFsdWUK" },
                },
                "ReturnConsumedCapacity": "TOTAL",
            })
        );
    }

    #[test]
    fn get_bodies_differ_only_in_consistency() {
        let get: Value = serde_json::from_str(&get_body("tbl", "k")).unwrap();
        let getc: Value = serde_json::from_str(&getc_body("tbl", "k")).unwrap();
        assert_eq!(get.get("ConsistentRead"), None);
        assert_eq!(getc.get("ConsistentRead"), Some(&json!(true)));
        assert_eq!(get.get("Key"), getc.get("Key"));
        assert_eq!(get.get("TableName"), getc.get("TableName"));
    }

    #[test]
    fn delete_body_shape() {
        let body: Value = serde_json::from_str(&delete_body("tbl", "k")).unwrap();
        assert_eq!(body.get("Key"), Some(&json!({"K": {"S": "k"}})));
        assert_eq!(body.get("Item"), None);
    }

    #[test]
    fn value_extraction() {
        let body = br#"{"Item":{"V":{"B":"dmFsdWUK"},"K":{"S":"key"}}}"#;
        assert_eq!(extract_value(Some(body)), Some(b"value\n".to_vec()));

        // Tombstone: a 200 with no item.
        assert_eq!(extract_value(Some(b"{}")), None);
        // Item without a V attribute.
        assert_eq!(
            extract_value(Some(br#"{"Item":{"K":{"S":"key"}}}"#)),
            None
        );
        // Garbage base64.
        assert_eq!(
            extract_value(Some(br#"{"Item":{"V":{"B":"!!!"}}}"#)),
            None
        );
        // No body at all.
        assert_eq!(extract_value(None), None);
    }
}
