use crate::*;
use serde_json::{json, Value};

/// Frames a client sends to a relay.
#[derive(Debug, Clone, Copy)]
pub enum ClientMessage<'a> {
    Event(&'a EventData),
    Req { sub_id: &'a str, filter: &'a Filter },
    Close(&'a str),
}

impl ClientMessage<'_> {
    pub fn to_json(&self) -> Result<String> {
        let frame = match self {
            ClientMessage::Event(event) => json!(["EVENT", event]),
            ClientMessage::Req { sub_id, filter } => json!(["REQ", sub_id, filter]),
            ClientMessage::Close(sub_id) => json!(["CLOSE", sub_id]),
        };
        json_stringify(&frame)
    }
}

/// Frames a relay sends to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    Event { sub_id: String, event: EventData },
    Ok { event_id: String, accepted: bool, message: String },
    Eose(String),
    Notice(String),
    Closed { sub_id: String, message: String },
}

fn str_at(frame: &[Value], index: usize) -> Result<String> {
    frame
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ZapError::MalformedEvent(format!("relay frame: missing string at {index}")))
}

impl RelayMessage {
    pub fn from_json(text: &str) -> Result<Self> {
        let frame: Vec<Value> = json_parse(text)?;
        let label = str_at(&frame, 0)?;
        match label.as_str() {
            "EVENT" => {
                let event = frame
                    .get(2)
                    .cloned()
                    .ok_or_else(|| {
                        ZapError::MalformedEvent("relay frame: EVENT without event".to_string())
                    })?;
                let event: EventData = serde_json::from_value(event)
                    .map_err(|e| ZapError::MalformedEvent(e.to_string()))?;
                Ok(RelayMessage::Event {
                    sub_id: str_at(&frame, 1)?,
                    event,
                })
            }
            "OK" => Ok(RelayMessage::Ok {
                event_id: str_at(&frame, 1)?,
                accepted: frame.get(2).and_then(Value::as_bool).unwrap_or(false),
                message: str_at(&frame, 3).unwrap_or_default(),
            }),
            "EOSE" => Ok(RelayMessage::Eose(str_at(&frame, 1)?)),
            "NOTICE" => Ok(RelayMessage::Notice(str_at(&frame, 1)?)),
            "CLOSED" => Ok(RelayMessage::Closed {
                sub_id: str_at(&frame, 1)?,
                message: str_at(&frame, 2).unwrap_or_default(),
            }),
            other => Err(ZapError::MalformedEvent(format!("unknown relay frame {other}"))),
        }
    }
}
