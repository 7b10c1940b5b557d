//! Attribute-value comparison, canonical rendering, and stable hashing.
//!
//! The comparison rules here define what "dirty" means for a managed item:
//! an absent attribute, a `NULL` attribute, and an empty string are all the
//! same value; numbers compare by numeric value rather than by their string
//! rendering; maps compare key-for-key regardless of order.

use std::collections::HashMap;

use aws_sdk_dynamodb::types::AttributeValue;

/// The flat attribute map exchanged with the store for a single item.
pub type AttrMap = HashMap<String, AttributeValue>;

/// Compares two optional attribute values with store-aware semantics.
///
/// The store represents empty strings as absent attributes, so `None`,
/// `NULL`, and `S("")` are all considered equal. Numbers are equal when
/// their canonical numeric values are equal (`"1.0"` equals `"1"`). Maps
/// are compared key-for-key without regard to order, lists element-wise.
/// All other variants compare structurally.
pub fn deep_equal(a: Option<&AttributeValue>, b: Option<&AttributeValue>) -> bool {
    if is_nil(a) && is_nil(b) {
        return true;
    }
    let (Some(a), Some(b)) = (a, b) else {
        return false;
    };
    match (a, b) {
        (AttributeValue::N(x), AttributeValue::N(y)) => numbers_equal(x, y),
        (AttributeValue::M(x), AttributeValue::M(y)) => {
            x.len() == y.len() && x.iter().all(|(key, value)| deep_equal(Some(value), y.get(key)))
        }
        (AttributeValue::L(x), AttributeValue::L(y)) => {
            x.len() == y.len()
                && x.iter()
                    .zip(y.iter())
                    .all(|(left, right)| deep_equal(Some(left), Some(right)))
        }
        _ => a == b,
    }
}

fn is_nil(value: Option<&AttributeValue>) -> bool {
    match value {
        None | Some(AttributeValue::Null(_)) => true,
        Some(AttributeValue::S(text)) => text.is_empty(),
        _ => false,
    }
}

fn numbers_equal(x: &str, y: &str) -> bool {
    match (x.parse::<f64>(), y.parse::<f64>()) {
        (Ok(a), Ok(b)) => a == b,
        _ => x == y,
    }
}

/// Renders an attribute value as the canonical string used for identity
/// hashing and partition placement.
pub fn canonical_string(value: &AttributeValue) -> String {
    match value {
        AttributeValue::S(text) => text.clone(),
        AttributeValue::N(number) => number.clone(),
        AttributeValue::Bool(flag) => if *flag { "true" } else { "false" }.to_string(),
        AttributeValue::Null(_) => String::new(),
        AttributeValue::B(blob) => blob
            .as_ref()
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect(),
        other => format!("{other:?}"),
    }
}

/// The stable 32-bit hash used for partitioned hash keys.
pub fn hash32(input: &str) -> u32 {
    crc32fast::hash(input.as_bytes())
}

/// Computes the partitioned form of a hash key value: `base-<hex>` where
/// `<hex>` is the hash of `hash_source` modulo `size`.
///
/// A caller may substitute its own hash function; placement is then the
/// caller's responsibility to keep consistent across writers and readers.
pub fn partition_suffix(
    base: &str,
    hash_source: &str,
    size: u32,
    hash_fn: Option<&dyn Fn(&str) -> u32>,
) -> String {
    let hash = match hash_fn {
        Some(custom) => custom(hash_source),
        None => hash32(hash_source),
    };
    format!("{}-{:x}", base, hash % size.max(1))
}
