//! Shape checks for inbound open requests and server pushes.
//!
//! Inbound messages arrive as raw JSON so that every rule can be reported
//! precisely; only messages that pass are turned into [`Message`]s.

use serde_json::Value;

use crate::errors::ValidationError;
use crate::hub::{OpenRequest, SendOptions};
use crate::message::{Message, MessageKind};

/// Validate an open request and decode its inbound messages
pub fn open_request(request: &OpenRequest, destroyed: bool) -> Result<Vec<Message>, ValidationError> {
    if request.channels.is_empty() {
        return Err(ValidationError::MissingChannels);
    }
    if destroyed {
        return Err(ValidationError::Destroyed);
    }
    request
        .messages
        .iter()
        .enumerate()
        .map(|(index, value)| message(index, value))
        .collect()
}

/// Validate one inbound message
pub fn message(index: usize, value: &Value) -> Result<Message, ValidationError> {
    let Some(object) = value.as_object() else {
        return Err(ValidationError::NotAnObject { index });
    };
    let Some(id) = object.get("id").and_then(Value::as_str) else {
        return Err(ValidationError::InvalidId { index });
    };

    let kind = match object.get("type") {
        Some(Value::String(kind)) => {
            MessageKind::parse(kind).ok_or_else(|| ValidationError::InvalidType {
                id: id.to_string(),
                kind: kind.clone(),
            })?
        }
        other => {
            return Err(ValidationError::InvalidType {
                id: id.to_string(),
                kind: other.map(Value::to_string).unwrap_or_else(|| "undefined".into()),
            })
        }
    };

    if kind != MessageKind::Ack && !object.get("channel").is_some_and(Value::is_string) {
        return Err(ValidationError::MissingChannel { id: id.to_string() });
    }
    if kind == MessageKind::Data && is_empty_data(object.get("data")) {
        return Err(ValidationError::EmptyData { id: id.to_string() });
    }

    serde_json::from_value(value.clone()).map_err(|e| ValidationError::Malformed {
        id: id.to_string(),
        reason: e.to_string(),
    })
}

/// Validate a server push
pub fn send_options(options: &SendOptions) -> Result<(), ValidationError> {
    if is_empty_data(options.data.as_ref()) {
        return Err(ValidationError::MissingData);
    }
    if options.channel.as_deref().map_or(true, str::is_empty) {
        return Err(ValidationError::MissingRecipient);
    }
    Ok(())
}

fn is_empty_data(data: Option<&Value>) -> bool {
    match data {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(messages: Vec<Value>) -> OpenRequest {
        OpenRequest {
            client: Some("A".into()),
            channels: vec!["c".into()],
            messages,
            ..OpenRequest::default()
        }
    }

    #[test]
    fn accepts_every_message_kind() {
        let messages = open_request(
            &request(vec![
                json!({"id": "1", "type": "data", "channel": "c", "data": {"a": 1}}),
                json!({"id": "2", "type": "ack"}),
                json!({"id": "3", "type": "ping", "channel": "c"}),
                json!({"id": "4", "type": "option", "channel": "c", "data": {"x": true}}),
            ]),
            false,
        )
        .unwrap();
        let kinds: Vec<MessageKind> = messages.iter().map(|m| m.kind).collect();
        assert_eq!(
            kinds,
            [MessageKind::Data, MessageKind::Ack, MessageKind::Ping, MessageKind::Options]
        );
    }

    #[test]
    fn rejects_missing_channels_before_anything_else() {
        let mut req = request(vec![json!(42)]);
        req.channels.clear();
        assert_eq!(open_request(&req, true), Err(ValidationError::MissingChannels));
    }

    #[test]
    fn rejects_when_destroyed() {
        assert_eq!(
            open_request(&request(vec![]), true),
            Err(ValidationError::Destroyed)
        );
    }

    #[test]
    fn rejects_non_string_id() {
        assert_eq!(
            open_request(&request(vec![json!({"id": 7, "type": "ack"})]), false),
            Err(ValidationError::InvalidId { index: 0 })
        );
        assert_eq!(
            open_request(&request(vec![json!("hello")]), false),
            Err(ValidationError::NotAnObject { index: 0 })
        );
    }

    #[test]
    fn rejects_unknown_type() {
        assert_eq!(
            message(0, &json!({"id": "1", "type": "user", "channel": "c"})),
            Err(ValidationError::InvalidType {
                id: "1".into(),
                kind: "user".into()
            })
        );
        assert!(matches!(
            message(0, &json!({"id": "1", "channel": "c"})),
            Err(ValidationError::InvalidType { .. })
        ));
    }

    #[test]
    fn non_ack_needs_string_channel() {
        assert_eq!(
            message(0, &json!({"id": "1", "type": "ping"})),
            Err(ValidationError::MissingChannel { id: "1".into() })
        );
        assert_eq!(
            message(0, &json!({"id": "1", "type": "data", "channel": 5, "data": 1})),
            Err(ValidationError::MissingChannel { id: "1".into() })
        );
        assert!(message(0, &json!({"id": "1", "type": "ack"})).is_ok());
    }

    #[test]
    fn data_needs_payload() {
        for data in [json!(null), json!("")] {
            assert_eq!(
                message(0, &json!({"id": "1", "type": "data", "channel": "c", "data": data})),
                Err(ValidationError::EmptyData { id: "1".into() })
            );
        }
        assert_eq!(
            message(0, &json!({"id": "1", "type": "data", "channel": "c"})),
            Err(ValidationError::EmptyData { id: "1".into() })
        );
        assert!(message(0, &json!({"id": "1", "type": "data", "channel": "c", "data": 0})).is_ok());
    }

    #[test]
    fn wrongly_typed_optional_fields_are_malformed() {
        assert!(matches!(
            message(0, &json!({"id": "1", "type": "ack", "client": 3})),
            Err(ValidationError::Malformed { .. })
        ));
    }

    #[test]
    fn send_options_rules() {
        let ok = SendOptions {
            data: Some(json!({"n": 1})),
            channel: Some("c".into()),
            ..SendOptions::default()
        };
        assert_eq!(send_options(&ok), Ok(()));

        let no_data = SendOptions {
            data: None,
            ..ok.clone()
        };
        assert_eq!(send_options(&no_data), Err(ValidationError::MissingData));

        let no_channel = SendOptions {
            channel: None,
            ..ok
        };
        assert_eq!(send_options(&no_channel), Err(ValidationError::MissingRecipient));
    }
}
