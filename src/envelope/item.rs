//! Envelope items: a typed header plus a payload

use crate::error::EnvelopeError;
use crate::report::DataCategory;
use bytes::Bytes;
use serde_json::{Map, Value};
use std::fmt;

pub const TYPE_KEY: &str = "type";
pub const LENGTH_KEY: &str = "length";
pub const ITEM_COUNT_KEY: &str = "item_count";
pub const CONTENT_TYPE_KEY: &str = "content_type";

/// Item `type` header values
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ItemType {
    Event,
    Transaction,
    Session,
    Sessions,
    Attachment,
    Profile,
    Span,
    Log,
    ClientReport,
    UserReport,
    Other(String),
}

impl ItemType {
    pub fn parse(s: &str) -> Self {
        match s {
            "event" => ItemType::Event,
            "transaction" => ItemType::Transaction,
            "session" => ItemType::Session,
            "sessions" => ItemType::Sessions,
            "attachment" => ItemType::Attachment,
            "profile" => ItemType::Profile,
            "span" => ItemType::Span,
            "log" => ItemType::Log,
            "client_report" => ItemType::ClientReport,
            "user_report" => ItemType::UserReport,
            other => ItemType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ItemType::Event => "event",
            ItemType::Transaction => "transaction",
            ItemType::Session => "session",
            ItemType::Sessions => "sessions",
            ItemType::Attachment => "attachment",
            ItemType::Profile => "profile",
            ItemType::Span => "span",
            ItemType::Log => "log",
            ItemType::ClientReport => "client_report",
            ItemType::UserReport => "user_report",
            ItemType::Other(s) => s,
        }
    }

    /// Category an item of this type is accounted under when dropped
    pub fn data_category(&self) -> DataCategory {
        match self {
            ItemType::Event => DataCategory::Error,
            ItemType::Transaction => DataCategory::Transaction,
            ItemType::Session | ItemType::Sessions => DataCategory::Session,
            ItemType::Attachment => DataCategory::Attachment,
            ItemType::Profile => DataCategory::Profile,
            ItemType::Span => DataCategory::Span,
            ItemType::Log => DataCategory::LogItem,
            ItemType::ClientReport | ItemType::UserReport | ItemType::Other(_) => {
                DataCategory::Default
            }
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Item payload source
#[derive(Debug, Clone, PartialEq)]
pub enum ItemPayload {
    /// Serialized as compact single-line JSON
    Json(Value),
    /// Written verbatim
    Raw(Bytes),
}

impl ItemPayload {
    /// Encoded payload bytes, exactly what follows the item header line
    pub fn to_bytes(&self) -> Result<Bytes, EnvelopeError> {
        match self {
            ItemPayload::Json(value) => Ok(Bytes::from(serde_json::to_vec(value)?)),
            ItemPayload::Raw(bytes) => Ok(bytes.clone()),
        }
    }
}

/// One length-delimited part of an envelope
#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeItem {
    header: Map<String, Value>,
    payload: ItemPayload,
}

impl EnvelopeItem {
    pub fn new(item_type: ItemType, payload: ItemPayload) -> Self {
        let mut header = Map::new();
        header.insert(TYPE_KEY.to_string(), Value::from(item_type.as_str()));
        EnvelopeItem { header, payload }
    }

    pub fn json(item_type: ItemType, value: Value) -> Self {
        Self::new(item_type, ItemPayload::Json(value))
    }

    /// Rebuild an item from a parsed header. The header must carry `type`.
    pub(crate) fn from_parts(header: Map<String, Value>, payload: ItemPayload) -> Self {
        debug_assert!(
            header.get(TYPE_KEY).and_then(Value::as_str).is_some(),
            "Precondition: item header must carry a type"
        );
        EnvelopeItem { header, payload }
    }

    pub fn with_header(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.header.insert(key.to_string(), value.into());
        self
    }

    /// Mark the payload as a batch of `count` logical items
    pub fn with_item_count(self, count: usize) -> Self {
        self.with_header(ITEM_COUNT_KEY, count as u64)
    }

    pub fn header(&self) -> &Map<String, Value> {
        &self.header
    }

    pub fn payload(&self) -> &ItemPayload {
        &self.payload
    }

    pub fn item_type(&self) -> ItemType {
        self.header
            .get(TYPE_KEY)
            .and_then(Value::as_str)
            .map(ItemType::parse)
            .unwrap_or_else(|| ItemType::Other(String::new()))
    }

    pub fn data_category(&self) -> DataCategory {
        self.item_type().data_category()
    }

    /// Number of logical items this envelope item carries, 1 unless batched
    pub fn item_count(&self) -> u64 {
        self.header
            .get(ITEM_COUNT_KEY)
            .and_then(Value::as_u64)
            .unwrap_or(1)
    }

    /// Payload decoded as JSON
    pub fn payload_json(&self) -> Result<Value, EnvelopeError> {
        match &self.payload {
            ItemPayload::Json(value) => Ok(value.clone()),
            ItemPayload::Raw(bytes) => Ok(serde_json::from_slice(bytes)?),
        }
    }

    /// Header line and payload bytes as they go on the wire.
    ///
    /// `length` is always recomputed from the encoded payload, so a stale
    /// value set by a caller can never reach the wire.
    pub fn encode(&self) -> Result<(Vec<u8>, Bytes), EnvelopeError> {
        let payload = self.payload.to_bytes()?;
        let mut header = self.header.clone();
        header.insert(LENGTH_KEY.to_string(), Value::from(payload.len() as u64));
        let header_line = serde_json::to_vec(&header)?;
        Ok((header_line, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_round_trips_through_parse() {
        for name in ["event", "transaction", "log", "client_report", "custom_thing"] {
            assert_eq!(ItemType::parse(name).as_str(), name);
        }
    }

    #[test]
    fn test_category_mapping() {
        assert_eq!(ItemType::Event.data_category(), DataCategory::Error);
        assert_eq!(ItemType::Log.data_category(), DataCategory::LogItem);
        assert_eq!(ItemType::Sessions.data_category(), DataCategory::Session);
        assert_eq!(
            ItemType::parse("statsd").data_category(),
            DataCategory::Default
        );
    }

    #[test]
    fn test_encode_recomputes_length() {
        let item = EnvelopeItem::json(ItemType::Event, json!({"message": "héllo"}))
            .with_header(LENGTH_KEY, 9999);
        let (header, payload) = item.encode().unwrap();
        let header: Value = serde_json::from_slice(&header).unwrap();
        assert_eq!(header["length"], payload.len() as u64);
        assert_eq!(header["type"], "event");
    }

    #[test]
    fn test_item_count_defaults_to_one() {
        let single = EnvelopeItem::json(ItemType::Event, json!({}));
        assert_eq!(single.item_count(), 1);
        let batch = EnvelopeItem::json(ItemType::Log, json!({"items": []})).with_item_count(12);
        assert_eq!(batch.item_count(), 12);
    }
}
