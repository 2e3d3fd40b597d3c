//! Envelope Wire Format
//!
//! An envelope bundles one header and N length-delimited items into a single
//! delivery unit:
//!
//! ```text
//! {"event_id":"9ec79c33ec9942ab8353589fcb2e04dc"}\n
//! {"type":"event","length":41}\n
//! {"message":"hello","level":"error"}......\n
//! {"type":"log","item_count":2,"length":77}\n
//! {"items":[...]}\n
//! ```
//!
//! Every header is compact single-line JSON. An item header always carries
//! `type` and, when written by this crate, `length` equal to the exact number
//! of payload bytes that follow. Items written by other producers may omit
//! `length`, in which case the payload runs to the next newline.

pub mod item;

pub use item::{EnvelopeItem, ItemPayload, ItemType};

use crate::error::EnvelopeError;
use crate::report::{ClientReport, DataCategory};
use bytes::{BufMut, Bytes, BytesMut};
use item::{CONTENT_TYPE_KEY, LENGTH_KEY, TYPE_KEY};
use serde_json::{Map, Value};
use std::io::Write;

pub const EVENT_ID_KEY: &str = "event_id";

/// Header plus ordered items
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    header: Map<String, Value>,
    items: Vec<EnvelopeItem>,
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.header.insert(key.to_string(), value.into());
        self
    }

    pub fn with_item(mut self, item: EnvelopeItem) -> Self {
        self.items.push(item);
        self
    }

    pub fn push_item(&mut self, item: EnvelopeItem) {
        self.items.push(item);
    }

    /// Single error event keyed by its id
    pub fn from_event(event_id: &str, event: Value) -> Self {
        Envelope::new()
            .with_header(EVENT_ID_KEY, event_id)
            .with_item(EnvelopeItem::json(ItemType::Event, event))
    }

    pub fn from_client_report(report: &ClientReport) -> Result<Self, EnvelopeError> {
        Ok(Envelope::new().with_item(client_report_item(report)?))
    }

    /// One item whose payload is a whole batch
    pub fn from_batch(
        item_type: ItemType,
        content_type: Option<&str>,
        payload: Value,
        item_count: usize,
    ) -> Self {
        let mut item = EnvelopeItem::json(item_type, payload).with_item_count(item_count);
        if let Some(content_type) = content_type {
            item = item.with_header(CONTENT_TYPE_KEY, content_type);
        }
        Envelope::new().with_item(item)
    }

    pub fn header(&self) -> &Map<String, Value> {
        &self.header
    }

    pub fn items(&self) -> &[EnvelopeItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn event_id(&self) -> Option<&str> {
        self.header.get(EVENT_ID_KEY).and_then(Value::as_str)
    }

    /// Logical telemetry items carried, excluding client reports.
    /// A batched item counts as its `item_count`.
    pub fn telemetry_count(&self) -> u64 {
        self.items
            .iter()
            .filter(|item| item.item_type() != ItemType::ClientReport)
            .map(EnvelopeItem::item_count)
            .sum()
    }

    /// Distinct categories carried, excluding client reports
    pub fn categories(&self) -> Vec<DataCategory> {
        let mut categories: Vec<DataCategory> = self
            .items
            .iter()
            .filter(|item| item.item_type() != ItemType::ClientReport)
            .map(EnvelopeItem::data_category)
            .collect();
        categories.sort();
        categories.dedup();
        categories
    }

    /// Attach a client report as an extra item
    pub fn attach_client_report(&mut self, report: &ClientReport) -> Result<(), EnvelopeError> {
        self.items.push(client_report_item(report)?);
        Ok(())
    }

    /// Write the wire form
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), EnvelopeError> {
        serde_json::to_writer(&mut *writer, &self.header)?;
        writer.write_all(b"\n")?;
        for item in &self.items {
            let (header_line, payload) = item.encode()?;
            writer.write_all(&header_line)?;
            writer.write_all(b"\n")?;
            writer.write_all(&payload)?;
            writer.write_all(b"\n")?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes, EnvelopeError> {
        let mut writer = BytesMut::new().writer();
        self.write_to(&mut writer)?;
        Ok(writer.into_inner().freeze())
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, EnvelopeError> {
        Self::from_bytes(Bytes::copy_from_slice(data))
    }

    /// Parse the wire form. Payloads are kept as zero-copy slices of `data`.
    pub fn from_bytes(data: Bytes) -> Result<Self, EnvelopeError> {
        if data.is_empty() {
            return Err(EnvelopeError::Empty);
        }

        let mut line_no = 1;
        let (start, end, mut pos) = next_line(&data, 0);
        let header = parse_header(&data[start..end], line_no)?;

        let mut items = Vec::new();
        while pos < data.len() {
            line_no += 1;
            let (start, end, next) = next_line(&data, pos);
            pos = next;
            if start == end {
                // Blank separator lines between items are tolerated.
                continue;
            }

            let item_header = parse_header(&data[start..end], line_no)?;
            if item_header.get(TYPE_KEY).and_then(Value::as_str).is_none() {
                return Err(EnvelopeError::MissingType(line_no));
            }

            let payload = match item_header.get(LENGTH_KEY) {
                Some(length) => {
                    let length = length
                        .as_u64()
                        .ok_or_else(|| EnvelopeError::InvalidLength(length.to_string()))?
                        as usize;
                    let available = data.len() - pos;
                    if available < length {
                        return Err(EnvelopeError::Truncated {
                            expected: length,
                            actual: available,
                        });
                    }
                    let payload = data.slice(pos..pos + length);
                    pos += length;
                    if data.get(pos) == Some(&b'\n') {
                        pos += 1;
                    }
                    payload
                }
                None => {
                    let (start, end, next) = next_line(&data, pos);
                    pos = next;
                    data.slice(start..end)
                }
            };
            line_no += 1;

            items.push(EnvelopeItem::from_parts(
                item_header,
                ItemPayload::Raw(payload),
            ));
        }

        Ok(Envelope { header, items })
    }
}

fn client_report_item(report: &ClientReport) -> Result<EnvelopeItem, EnvelopeError> {
    Ok(EnvelopeItem::json(
        ItemType::ClientReport,
        serde_json::to_value(report)?,
    ))
}

/// (start, end, next) of the line beginning at `from`; `end` excludes the newline
fn next_line(data: &[u8], from: usize) -> (usize, usize, usize) {
    match memchr::memchr(b'\n', &data[from..]) {
        Some(offset) => (from, from + offset, from + offset + 1),
        None => (from, data.len(), data.len()),
    }
}

fn parse_header(line: &[u8], line_no: usize) -> Result<Map<String, Value>, EnvelopeError> {
    let value: Value = serde_json::from_slice(line).map_err(|source| EnvelopeError::Header {
        line: line_no,
        source,
    })?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(EnvelopeError::HeaderNotObject(line_no)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Timestamp;
    use crate::report::{DiscardReason, DiscardReasonWithCategory};
    use serde_json::json;

    #[test]
    fn test_empty_header_serializes_as_braces() {
        let bytes = Envelope::new().to_bytes().unwrap();
        assert_eq!(&bytes[..], b"{}\n");
    }

    #[test]
    fn test_wire_layout_is_exact() {
        let envelope = Envelope::new().with_item(EnvelopeItem::new(
            ItemType::Attachment,
            ItemPayload::Raw(Bytes::from_static(b"a\nb")),
        ));
        let bytes = envelope.to_bytes().unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        let (envelope_header, rest) = text.split_once('\n').unwrap();
        let (item_header, rest) = rest.split_once('\n').unwrap();

        assert_eq!(envelope_header, "{}");
        let item_header: Value = serde_json::from_str(item_header).unwrap();
        assert_eq!(item_header, json!({"type": "attachment", "length": 3}));
        assert_eq!(rest, "a\nb\n");
    }

    #[test]
    fn test_parse_uses_length_for_binary_payloads() {
        let envelope = Envelope::from_event("abc", json!({"message": "boom"})).with_item(
            EnvelopeItem::new(
                ItemType::Attachment,
                ItemPayload::Raw(Bytes::from_static(b"\n\n{not json}\n")),
            ),
        );
        let parsed = Envelope::from_bytes(envelope.to_bytes().unwrap()).unwrap();

        assert_eq!(parsed.event_id(), Some("abc"));
        assert_eq!(parsed.items().len(), 2);
        assert_eq!(
            parsed.items()[0].payload_json().unwrap(),
            json!({"message": "boom"})
        );
        assert_eq!(
            parsed.items()[1].payload(),
            &ItemPayload::Raw(Bytes::from_static(b"\n\n{not json}\n"))
        );
        assert_eq!(parsed.to_bytes().unwrap(), envelope.to_bytes().unwrap());
    }

    #[test]
    fn test_parse_without_length_reads_to_newline() {
        let data = b"{}\n{\"type\":\"event\"}\n{\"a\":1}\n{\"type\":\"session\"}\n{\"b\":2}";
        let parsed = Envelope::from_slice(data).unwrap();
        assert_eq!(parsed.items().len(), 2);
        assert_eq!(parsed.items()[0].payload_json().unwrap(), json!({"a": 1}));
        assert_eq!(parsed.items()[1].item_type(), ItemType::Session);
        assert_eq!(parsed.items()[1].payload_json().unwrap(), json!({"b": 2}));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Envelope::from_slice(b""),
            Err(EnvelopeError::Empty)
        ));
        assert!(matches!(
            Envelope::from_slice(b"not json\n"),
            Err(EnvelopeError::Header { line: 1, .. })
        ));
        assert!(matches!(
            Envelope::from_slice(b"{}\n{\"length\":2}\nab\n"),
            Err(EnvelopeError::MissingType(2))
        ));
        assert!(matches!(
            Envelope::from_slice(b"{}\n{\"type\":\"event\",\"length\":10}\nabc"),
            Err(EnvelopeError::Truncated {
                expected: 10,
                actual: 3
            })
        ));
        assert!(matches!(
            Envelope::from_slice(b"{}\n[1]\n"),
            Err(EnvelopeError::HeaderNotObject(2))
        ));
    }

    #[test]
    fn test_batch_sets_item_count_and_content_type() {
        let envelope = Envelope::from_batch(
            ItemType::Log,
            Some("application/vnd.sentry.items.log+json"),
            json!({"items": ["one", "two"]}),
            2,
        );
        let item = &envelope.items()[0];
        assert_eq!(item.item_count(), 2);
        assert_eq!(
            item.header()["content_type"],
            "application/vnd.sentry.items.log+json"
        );
        assert_eq!(envelope.telemetry_count(), 2);
        assert_eq!(envelope.categories(), vec![DataCategory::LogItem]);
    }

    #[test]
    fn test_client_report_items_are_not_telemetry() {
        let report = ClientReport::new(
            Timestamp(5_000),
            vec![(
                DiscardReasonWithCategory::new(DiscardReason::SendError, DataCategory::Error),
                2,
            )],
        )
        .unwrap();
        let mut envelope = Envelope::from_event("id", json!({}));
        envelope.attach_client_report(&report).unwrap();

        assert_eq!(envelope.items().len(), 2);
        assert_eq!(envelope.telemetry_count(), 1);

        let parsed = Envelope::from_bytes(envelope.to_bytes().unwrap()).unwrap();
        let restored: ClientReport =
            serde_json::from_value(parsed.items()[1].payload_json().unwrap()).unwrap();
        assert_eq!(restored, report);
    }
}
