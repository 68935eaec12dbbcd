//! Decoded inbound payloads.

use std::fmt;

use serde_json::{Map, Value};

/// Keys that mark a JSON object as a channel record.
pub const SERVICE_NAME_KEYS: &[&str] = &["ServiceName", "service_name"];

/// Maximum number of bytes kept from an unclassified payload.
pub const UNKNOWN_SAMPLE_LEN: usize = 64;

/// A single channel entry as sent by the receiver.
///
/// The record is passed through verbatim; only the service name has an
/// accessor because it is what identifies the shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRecord(Map<String, Value>);

impl ChannelRecord {
    /// Wrap a raw JSON object.
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// The service name, if present and a string.
    pub fn service_name(&self) -> Option<&str> {
        SERVICE_NAME_KEYS
            .iter()
            .find_map(|key| self.0.get(*key))
            .and_then(Value::as_str)
    }

    /// Look up an arbitrary field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// All fields of the record.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Consume the record and return the raw object.
    pub fn into_fields(self) -> Map<String, Value> {
        self.0
    }
}

/// A payload extracted from the receive stream.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedPayload {
    /// A channel enumeration.
    ChannelList(Vec<ChannelRecord>),
    /// Any other JSON document.
    GenericJson(Value),
    /// Text that is not JSON.
    RawText(String),
    /// An XML document.
    Xml(String),
    /// Bytes the engine could not classify; holds a bounded sample.
    Unknown(Vec<u8>),
}

impl DecodedPayload {
    /// Build an [`DecodedPayload::Unknown`] holding at most
    /// [`UNKNOWN_SAMPLE_LEN`] bytes of `bytes`.
    pub fn unknown(bytes: &[u8]) -> Self {
        let len = bytes.len().min(UNKNOWN_SAMPLE_LEN);
        Self::Unknown(bytes[..len].to_vec())
    }

    /// Short name of the variant, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChannelList(_) => "channel-list",
            Self::GenericJson(_) => "json",
            Self::RawText(_) => "text",
            Self::Xml(_) => "xml",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for DecodedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChannelList(records) => write!(f, "channel list ({} entries)", records.len()),
            Self::GenericJson(value) => write!(f, "json {value}"),
            Self::RawText(text) => write!(f, "text {text:?}"),
            Self::Xml(text) => write!(f, "xml {text}"),
            Self::Unknown(sample) => write!(f, "unknown {} byte sample", sample.len()),
        }
    }
}

/// Whether `value` has the shape of a channel enumeration.
///
/// An array whose first element is an object with a service-name key always
/// qualifies. When a channel list was requested, any array of objects
/// (including the empty array) qualifies as well.
pub fn is_channel_list(value: &Value, expecting: bool) -> bool {
    let Value::Array(items) = value else {
        return false;
    };

    let first_is_channel = items.first().is_some_and(|first| {
        first
            .as_object()
            .is_some_and(|obj| SERVICE_NAME_KEYS.iter().any(|key| obj.contains_key(*key)))
    });

    first_is_channel || (expecting && items.iter().all(Value::is_object))
}

/// Classify decoded text as JSON, falling back to raw text.
pub fn classify_text(text: String, expecting_channel_list: bool) -> DecodedPayload {
    match serde_json::from_str::<Value>(&text) {
        Ok(value) => classify_json(value, expecting_channel_list),
        Err(_) => DecodedPayload::RawText(text),
    }
}

/// Turn a parsed JSON value into a channel list or generic JSON payload.
pub fn classify_json(value: Value, expecting_channel_list: bool) -> DecodedPayload {
    if !is_channel_list(&value, expecting_channel_list) {
        return DecodedPayload::GenericJson(value);
    }

    let Value::Array(items) = value else {
        return DecodedPayload::GenericJson(value);
    };
    let records = items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(fields) => Some(ChannelRecord::new(fields)),
            _ => None,
        })
        .collect();
    DecodedPayload::ChannelList(records)
}
