//! Canonical JSON and JSON signatures.
//!
//! Signed objects are serialized with sorted keys and no insignificant
//! whitespace, with their `signatures` and `unsigned` members removed. The
//! signature is stored back under `signatures[user_id]["ed25519:<key_id>"]`.

use keyloom_core::UserId;
use keyloom_crypto::{Ed25519Keypair, decode_key_array, encode_key, verify_signature};
use serde_json::{Map, Value};

/// Serialize `value` canonically.
///
/// `serde_json::Map` is ordered, so plain compact serialization sorts keys.
pub(crate) fn canonical_json(value: &Value) -> String {
    let stripped = match value {
        Value::Object(map) => {
            let mut map = map.clone();
            map.remove("signatures");
            map.remove("unsigned");
            Value::Object(map)
        },
        other => other.clone(),
    };
    stripped.to_string()
}

/// Sign `object` in place.
pub(crate) fn sign_json(
    object: &mut Map<String, Value>,
    signing: &Ed25519Keypair,
    user_id: &UserId,
    key_id: &str,
) {
    let canonical = canonical_json(&Value::Object(object.clone()));
    let signature = encode_key(&signing.sign(canonical.as_bytes()));

    let signatures = object
        .entry("signatures")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(signatures) = signatures {
        let by_user = signatures
            .entry(user_id.as_str())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(by_user) = by_user {
            by_user.insert(format!("ed25519:{key_id}"), Value::String(signature));
        }
    }
}

/// Check the signature `user_id` made over `object` with `ed25519:<key_id>`.
pub(crate) fn verify_json(
    object: &Value,
    ed25519_key: &str,
    user_id: &UserId,
    key_id: &str,
) -> bool {
    let Some(signature) = object
        .get("signatures")
        .and_then(|s| s.get(user_id.as_str()))
        .and_then(|s| s.get(format!("ed25519:{key_id}")))
        .and_then(Value::as_str)
    else {
        return false;
    };

    let (Some(public), Some(signature)) =
        (decode_key_array::<32>(ed25519_key), decode_key_array::<64>(signature))
    else {
        return false;
    };

    verify_signature(&public, canonical_json(object).as_bytes(), &signature).is_ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn user() -> UserId {
        UserId::try_from("@alice:example.org").unwrap()
    }

    #[test]
    fn canonical_form_sorts_and_strips() {
        let value = json!({"b": 1, "a": {"d": 2, "c": 3}, "signatures": {}, "unsigned": {"x": 1}});
        assert_eq!(canonical_json(&value), r#"{"a":{"c":3,"d":2},"b":1}"#);
    }

    #[test]
    fn signed_object_verifies() {
        let signing = Ed25519Keypair::from_seed(&[8u8; 32]);
        let public = encode_key(&signing.public_key());

        let Value::Object(mut object) = json!({"device_id": "DEV", "keys": {}}) else {
            unreachable!();
        };
        sign_json(&mut object, &signing, &user(), "DEV");

        let object = Value::Object(object);
        assert!(verify_json(&object, &public, &user(), "DEV"));
        assert!(!verify_json(&object, &public, &user(), "OTHER"));
    }

    #[test]
    fn modified_object_fails() {
        let signing = Ed25519Keypair::from_seed(&[8u8; 32]);
        let public = encode_key(&signing.public_key());

        let Value::Object(mut object) = json!({"key": "abc"}) else {
            unreachable!();
        };
        sign_json(&mut object, &signing, &user(), "DEV");
        object.insert("key".to_string(), Value::String("abd".to_string()));

        assert!(!verify_json(&Value::Object(object), &public, &user(), "DEV"));
    }
}
