use crate::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a zap request (payment request) event.
pub const KIND_ZAP_REQUEST: u32 = 9734;
/// Kind of a zap receipt event, authored by the recipient.
pub const KIND_ZAP_RECEIPT: u32 = 9735;

/// A signed protocol event as it travels over the relay network.
///
/// Field names are the wire names. Tags keep their order and may repeat keys.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct EventData {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

/// Fields of an event before it has an id and signature.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct SignEventData {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl SignEventData {
    pub fn validate(&self) -> Result<()> {
        if self.pubkey.is_empty() {
            return Err(ZapError::MalformedEvent("empty pubkey".to_string()));
        }
        if !is_hex_of_len(&self.pubkey, 64) {
            return Err(ZapError::MalformedEvent(format!(
                "pubkey is not 32-byte hex: {}",
                self.pubkey
            )));
        }
        if self.tags.iter().any(|tag| tag.is_empty()) {
            return Err(ZapError::MalformedEvent("empty tag".to_string()));
        }
        Ok(())
    }
}

impl EventData {
    /// Parses a wire event. A non-integer `created_at` fails here.
    pub fn from_json(json: &str) -> Result<Self> {
        json_parse(json)
    }

    pub fn to_json(&self) -> Result<String> {
        json_stringify(self)
    }

    /// The id-relevant fields of this event.
    pub fn unsigned(&self) -> SignEventData {
        SignEventData {
            pubkey: self.pubkey.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }

    /// First value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some(name))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }

    /// First value of every tag named `name`, in tag order.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
            .filter_map(|tag| tag.get(1).map(String::as_str))
    }

    /// True when any `e` tag references `event_id`.
    pub fn references(&self, event_id: &str) -> bool {
        self.tag_values("e").any(|id| id == event_id)
    }
}

impl fmt::Display for EventData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => Err(fmt::Error),
        }
    }
}
