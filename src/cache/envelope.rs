//! Typed serialization envelope.
//!
//! The KV store only holds text, and plain JSON has no representation for
//! arbitrary-precision integers or calendar timestamps. Both are written as
//! tagged objects:
//!
//! ```json
//! { "_type": "BigInt", "value": "123456789012345678901234567890" }
//! { "_type": "Date",   "value": "2024-05-01T12:30:45.123+02:00" }
//! ```
//!
//! [`CacheValue`] is the closed set of values the envelope understands. Typed
//! payload structs can opt individual fields into the same wire form with
//! `#[serde(with = "studio_cache::cache::envelope::bigint")]` or
//! `#[serde(with = "studio_cache::cache::envelope::timestamp")]`.
//!
//! A plain object that happens to carry `_type: "BigInt"` or `_type: "Date"`
//! next to a string `value` is indistinguishable from a tagged value and is
//! decoded as one.

use std::collections::BTreeMap;
use std::fmt;

use num_bigint::BigInt;
use serde::de::{self, DeserializeOwned, MapAccess, SeqAccess, Visitor};
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub const TYPE_FIELD: &str = "_type";
pub const VALUE_FIELD: &str = "value";
pub const BIGINT_TAG: &str = "BigInt";
pub const DATE_TAG: &str = "Date";

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("failed to encode cache payload: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode cache payload: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Encode any serializable payload to envelope text.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<String, EnvelopeError> {
    serde_json::to_string(value).map_err(EnvelopeError::Encode)
}

/// Decode envelope text produced by [`encode`].
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, EnvelopeError> {
    serde_json::from_str(text).map_err(EnvelopeError::Decode)
}

/// A value that survives a round trip through the text store unchanged.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    BigInt(BigInt),
    /// Compared by instant, not by offset.
    Timestamp(OffsetDateTime),
    Array(Vec<CacheValue>),
    Map(BTreeMap<String, CacheValue>),
}

impl CacheValue {
    /// Look up a field of a map value.
    pub fn get(&self, field: &str) -> Option<&CacheValue> {
        match self {
            Self::Map(map) => map.get(field),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(number) => number.as_i64(),
            _ => None,
        }
    }

    pub fn as_bigint(&self) -> Option<&BigInt> {
        match self {
            Self::BigInt(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<OffsetDateTime> {
        match self {
            Self::Timestamp(value) => Some(*value),
            _ => None,
        }
    }

    /// Build a map value from `(field, value)` pairs.
    pub fn map<K, V, I>(fields: I) -> Self
    where
        K: Into<String>,
        V: Into<CacheValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::Map(
            fields
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

impl From<bool> for CacheValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for CacheValue {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

impl From<u64> for CacheValue {
    fn from(value: u64) -> Self {
        Self::Number(value.into())
    }
}

impl From<&str> for CacheValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for CacheValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<BigInt> for CacheValue {
    fn from(value: BigInt) -> Self {
        Self::BigInt(value)
    }
}

impl From<OffsetDateTime> for CacheValue {
    fn from(value: OffsetDateTime) -> Self {
        Self::Timestamp(value)
    }
}

impl From<Vec<CacheValue>> for CacheValue {
    fn from(value: Vec<CacheValue>) -> Self {
        Self::Array(value)
    }
}

/// Structural conversion; tagged objects inside `value` stay plain maps.
impl From<serde_json::Value> for CacheValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Self::Null,
            Value::Bool(flag) => Self::Bool(flag),
            Value::Number(number) => Self::Number(number),
            Value::String(text) => Self::String(text),
            Value::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            Value::Object(fields) => Self::Map(
                fields
                    .into_iter()
                    .map(|(key, value)| (key, Self::from(value)))
                    .collect(),
            ),
        }
    }
}

#[derive(Serialize)]
struct TaggedRef<'a> {
    #[serde(rename = "_type")]
    kind: &'a str,
    value: &'a str,
}

#[derive(Deserialize)]
struct TaggedOwned {
    #[serde(rename = "_type")]
    kind: String,
    value: String,
}

fn format_timestamp(value: &OffsetDateTime) -> Result<String, time::error::Format> {
    value.format(&Rfc3339)
}

impl Serialize for CacheValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(flag) => serializer.serialize_bool(*flag),
            Self::Number(number) => number.serialize(serializer),
            Self::String(text) => serializer.serialize_str(text),
            Self::BigInt(value) => TaggedRef {
                kind: BIGINT_TAG,
                value: &value.to_string(),
            }
            .serialize(serializer),
            Self::Timestamp(value) => {
                let text = format_timestamp(value).map_err(S::Error::custom)?;
                TaggedRef {
                    kind: DATE_TAG,
                    value: &text,
                }
                .serialize(serializer)
            }
            Self::Array(items) => serializer.collect_seq(items),
            Self::Map(fields) => serializer.collect_map(fields),
        }
    }
}

impl<'de> Deserialize<'de> for CacheValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(CacheValueVisitor)
    }
}

struct CacheValueVisitor;

impl<'de> Visitor<'de> for CacheValueVisitor {
    type Value = CacheValue;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a JSON value")
    }

    fn visit_unit<E: de::Error>(self) -> Result<CacheValue, E> {
        Ok(CacheValue::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<CacheValue, E> {
        Ok(CacheValue::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<CacheValue, D::Error> {
        CacheValue::deserialize(deserializer)
    }

    fn visit_bool<E: de::Error>(self, value: bool) -> Result<CacheValue, E> {
        Ok(CacheValue::Bool(value))
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<CacheValue, E> {
        Ok(CacheValue::Number(value.into()))
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<CacheValue, E> {
        Ok(CacheValue::Number(value.into()))
    }

    fn visit_f64<E: de::Error>(self, value: f64) -> Result<CacheValue, E> {
        serde_json::Number::from_f64(value)
            .map(CacheValue::Number)
            .ok_or_else(|| E::custom("non-finite number"))
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<CacheValue, E> {
        Ok(CacheValue::String(value.to_string()))
    }

    fn visit_string<E: de::Error>(self, value: String) -> Result<CacheValue, E> {
        Ok(CacheValue::String(value))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<CacheValue, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element::<CacheValue>()? {
            items.push(item);
        }
        Ok(CacheValue::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<CacheValue, A::Error> {
        let mut fields = BTreeMap::new();
        while let Some((key, value)) = access.next_entry::<String, CacheValue>()? {
            fields.insert(key, value);
        }
        untag(fields).map_err(de::Error::custom)
    }
}

/// Turn a decoded map back into a typed value when it carries a reserved tag.
fn untag(fields: BTreeMap<String, CacheValue>) -> Result<CacheValue, String> {
    let tag = fields.get(TYPE_FIELD).and_then(CacheValue::as_str);
    let raw = fields.get(VALUE_FIELD).and_then(CacheValue::as_str);

    match (tag, raw) {
        (Some(BIGINT_TAG), Some(raw)) => parse_bigint(raw).map(CacheValue::BigInt),
        (Some(DATE_TAG), Some(raw)) => parse_timestamp(raw).map(CacheValue::Timestamp),
        _ => Ok(CacheValue::Map(fields)),
    }
}

fn parse_bigint(raw: &str) -> Result<BigInt, String> {
    raw.parse::<BigInt>()
        .map_err(|err| format!("invalid BigInt `{raw}`: {err}"))
}

fn parse_timestamp(raw: &str) -> Result<OffsetDateTime, String> {
    OffsetDateTime::parse(raw, &Rfc3339).map_err(|err| format!("invalid Date `{raw}`: {err}"))
}

/// `#[serde(with = ...)]` support for `BigInt` fields.
pub mod bigint {
    use super::*;

    pub fn serialize<S: Serializer>(value: &BigInt, serializer: S) -> Result<S::Ok, S::Error> {
        TaggedRef {
            kind: BIGINT_TAG,
            value: &value.to_string(),
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigInt, D::Error> {
        let tagged = TaggedOwned::deserialize(deserializer)?;
        if tagged.kind != BIGINT_TAG {
            return Err(de::Error::custom(format!(
                "expected `{BIGINT_TAG}` tag, found `{}`",
                tagged.kind
            )));
        }
        parse_bigint(&tagged.value).map_err(de::Error::custom)
    }
}

/// `#[serde(with = ...)]` support for `OffsetDateTime` fields.
pub mod timestamp {
    use serde::ser::Error as _;

    use super::*;

    pub fn serialize<S: Serializer>(
        value: &OffsetDateTime,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let text = format_timestamp(value).map_err(S::Error::custom)?;
        TaggedRef {
            kind: DATE_TAG,
            value: &text,
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<OffsetDateTime, D::Error> {
        let tagged = TaggedOwned::deserialize(deserializer)?;
        if tagged.kind != DATE_TAG {
            return Err(de::Error::custom(format!(
                "expected `{DATE_TAG}` tag, found `{}`",
                tagged.kind
            )));
        }
        parse_timestamp(&tagged.value).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    fn big(text: &str) -> BigInt {
        text.parse().expect("valid bigint literal")
    }

    #[test]
    fn bigint_is_tagged() {
        let text = encode(&CacheValue::BigInt(big("123"))).expect("encode");
        assert_eq!(text, r#"{"_type":"BigInt","value":"123"}"#);
    }

    #[test]
    fn timestamp_is_tagged_iso8601() {
        let value = CacheValue::Timestamp(datetime!(2024-05-01 12:30:45.123 UTC));
        let text = encode(&value).expect("encode");
        assert_eq!(
            text,
            r#"{"_type":"Date","value":"2024-05-01T12:30:45.123Z"}"#
        );
    }

    #[test]
    fn nested_values_roundtrip() {
        let value = CacheValue::map([
            ("total", CacheValue::from(42_i64)),
            (
                "revenue",
                CacheValue::BigInt(big("-98765432109876543210987654321")),
            ),
            (
                "items",
                CacheValue::Array(vec![
                    CacheValue::map([
                        ("id", CacheValue::BigInt(big("9007199254740993"))),
                        (
                            "createdAt",
                            CacheValue::Timestamp(datetime!(2023-01-02 03:04:05.000006 +05:30)),
                        ),
                        ("tags", CacheValue::Array(vec!["nails".into(), "hair".into()])),
                    ]),
                    CacheValue::Null,
                ]),
            ),
            ("open", CacheValue::Bool(true)),
            ("rating", CacheValue::Number(serde_json::Number::from_f64(4.5).expect("finite"))),
        ]);

        let decoded: CacheValue = decode(&encode(&value).expect("encode")).expect("decode");
        assert_eq!(decoded, value);
    }

    #[test]
    fn timestamps_compare_by_instant() {
        let utc = CacheValue::Timestamp(datetime!(2024-01-01 10:00 UTC));
        let shifted = CacheValue::Timestamp(datetime!(2024-01-01 12:00 +02:00));
        assert_eq!(utc, shifted);
    }

    #[test]
    fn unknown_type_tag_stays_a_map() {
        let decoded: CacheValue =
            decode(r#"{"_type":"Money","value":"12.00"}"#).expect("decode");
        assert_eq!(decoded.get(TYPE_FIELD).and_then(CacheValue::as_str), Some("Money"));
    }

    #[test]
    fn malformed_tagged_values_fail_to_decode() {
        assert!(decode::<CacheValue>(r#"{"_type":"BigInt","value":"12x"}"#).is_err());
        assert!(decode::<CacheValue>(r#"{"_type":"Date","value":"yesterday"}"#).is_err());
        assert!(decode::<CacheValue>("{not json").is_err());
    }

    #[test]
    fn json_value_converts_structurally() {
        let value = CacheValue::from(serde_json::json!({"a": [1, "b", null]}));
        assert_eq!(
            value,
            CacheValue::map([(
                "a",
                CacheValue::Array(vec![1_i64.into(), "b".into(), CacheValue::Null])
            )])
        );
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct SalonStats {
        salon_id: String,
        #[serde(with = "bigint")]
        lifetime_views: BigInt,
        #[serde(with = "timestamp")]
        computed_at: OffsetDateTime,
    }

    #[test]
    fn typed_struct_fields_use_the_same_tags() {
        let stats = SalonStats {
            salon_id: "s-1".to_string(),
            lifetime_views: big("184467440737095516160"),
            computed_at: datetime!(2024-06-30 23:59:59 UTC),
        };

        let text = encode(&stats).expect("encode");
        assert!(text.contains(r#""lifetimeViews":{"_type":"BigInt","value":"184467440737095516160"}"#));

        // The same text decodes as a generic value too.
        let generic: CacheValue = decode(&text).expect("decode generic");
        assert_eq!(
            generic.get("computedAt").and_then(CacheValue::as_timestamp),
            Some(stats.computed_at)
        );

        let back: SalonStats = decode(&text).expect("decode typed");
        assert_eq!(back, stats);
    }

    #[test]
    fn typed_field_rejects_wrong_tag() {
        let text = r#"{"salonId":"s","lifetimeViews":{"_type":"Date","value":"1"},"computedAt":{"_type":"Date","value":"2024-06-30T23:59:59Z"}}"#;
        assert!(decode::<SalonStats>(text).is_err());
    }
}
