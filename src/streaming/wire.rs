//! Wire format for cloud-to-device stream invitations and the device's
//! accept/reject response, carried verbatim from
//! `iothubtransport_amqp_streaming.c`: correlation id doubles as the stream
//! request id, and the rest of the invitation rides in application
//! properties rather than the message body.

use uuid::Uuid;

use crate::amqp::{AmqpMessage, CorrelationId};

pub const CLIENT_VERSION_PROPERTY_NAME: &str = "com.microsoft:client-version";
pub const CORRELATION_ID_PROPERTY_NAME: &str = "com.microsoft:channel-correlation-id";
pub const API_VERSION_PROPERTY_NAME: &str = "com.microsoft:api-version";
pub const API_VERSION: &str = "2016-11-14";

pub const STREAM_PROP_NAME: &str = "IoThub-streaming-name";
pub const STREAM_PROP_HOSTNAME: &str = "IoThub-streaming-hostname";
pub const STREAM_PROP_PORT: &str = "IoThub-streaming-port";
pub const STREAM_PROP_URL: &str = "IoThub-streaming-url";
pub const STREAM_PROP_AUTH_TOKEN: &str = "IoThub-streaming-auth-token";
pub const STREAM_PROP_IS_ACCEPTED: &str = "IoThub-streaming-is-accepted";

/// A one-byte placeholder body, matching the original's practice of putting
/// every field of a stream message into application properties and leaving
/// the AMQP body effectively unused.
const PLACEHOLDER_BODY: u8 = 0x20;

/// An invitation from the cloud to open a device stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct C2dStreamRequest {
    pub request_id: String,
    pub stream_name: String,
    pub gateway_url: String,
    pub gateway_hostname: Option<String>,
    pub gateway_port: Option<i64>,
    pub authorization_token: String,
}

/// The device's accept/reject answer to a [`C2dStreamRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct C2dStreamResponse {
    pub request_id: String,
    pub accept: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StreamingWireError {
    #[error("stream request is missing a correlation id")]
    MissingRequestId,
    #[error("stream request is missing the {0} application property")]
    MissingProperty(&'static str),
}

pub fn decode_stream_request(message: &AmqpMessage) -> Result<C2dStreamRequest, StreamingWireError> {
    let request_id = match &message.correlation_id {
        Some(CorrelationId::String(s)) => s.clone(),
        Some(CorrelationId::Uuid(id)) => id.to_string(),
        None => return Err(StreamingWireError::MissingRequestId),
    };

    let property = |name: &'static str| {
        message
            .application_properties
            .get(name)
            .cloned()
            .ok_or(StreamingWireError::MissingProperty(name))
    };

    Ok(C2dStreamRequest {
        request_id,
        stream_name: property(STREAM_PROP_NAME)?,
        gateway_url: property(STREAM_PROP_URL)?,
        gateway_hostname: message.application_properties.get(STREAM_PROP_HOSTNAME).cloned(),
        gateway_port: message
            .application_properties
            .get(STREAM_PROP_PORT)
            .and_then(|v| v.parse().ok()),
        authorization_token: property(STREAM_PROP_AUTH_TOKEN)?,
    })
}

pub fn encode_stream_response(response: &C2dStreamResponse) -> AmqpMessage {
    let correlation_id = match Uuid::parse_str(&response.request_id) {
        Ok(id) => CorrelationId::Uuid(id),
        Err(_) => CorrelationId::String(response.request_id.clone()),
    };
    AmqpMessage::new(vec![PLACEHOLDER_BODY])
        .with_correlation_id(correlation_id)
        .with_application_property(STREAM_PROP_IS_ACCEPTED, response.accept.to_string())
}

/// The per-link correlation id attached when opening the receive link, tying
/// every stream invitation on it to this device connection
/// (`channel-correlation-id = streams:<uuid>`).
pub fn new_channel_correlation_id() -> String {
    format!("streams:{}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample_request_message() -> AmqpMessage {
        let mut properties = HashMap::new();
        properties.insert(STREAM_PROP_NAME.to_string(), "logs".to_string());
        properties.insert(STREAM_PROP_URL.to_string(), "wss://gw.example.com/streams/1".to_string());
        properties.insert(STREAM_PROP_HOSTNAME.to_string(), "gw.example.com".to_string());
        properties.insert(STREAM_PROP_PORT.to_string(), "443".to_string());
        properties.insert(STREAM_PROP_AUTH_TOKEN.to_string(), "token-abc".to_string());
        AmqpMessage {
            body: Vec::new(),
            correlation_id: Some(CorrelationId::String("req-1".to_string())),
            application_properties: properties,
            message_annotations: HashMap::new(),
        }
    }

    #[test]
    fn decodes_well_formed_request() {
        let request = decode_stream_request(&sample_request_message()).unwrap();
        assert_eq!(request.request_id, "req-1");
        assert_eq!(request.stream_name, "logs");
        assert_eq!(request.gateway_port, Some(443));
    }

    #[test]
    fn missing_correlation_id_is_rejected() {
        let mut message = sample_request_message();
        message.correlation_id = None;
        assert_eq!(
            decode_stream_request(&message).unwrap_err(),
            StreamingWireError::MissingRequestId
        );
    }

    #[test]
    fn missing_stream_name_is_rejected() {
        let mut message = sample_request_message();
        message.application_properties.remove(STREAM_PROP_NAME);
        assert_eq!(
            decode_stream_request(&message).unwrap_err(),
            StreamingWireError::MissingProperty(STREAM_PROP_NAME)
        );
    }

    #[test]
    fn response_round_trips_request_id_as_correlation_id() {
        let response = C2dStreamResponse {
            request_id: "req-1".to_string(),
            accept: true,
        };
        let message = encode_stream_response(&response);
        assert_eq!(
            message.correlation_id,
            Some(CorrelationId::String("req-1".to_string()))
        );
        assert_eq!(
            message.application_properties.get(STREAM_PROP_IS_ACCEPTED),
            Some(&"true".to_string())
        );
    }

    #[test]
    fn response_round_trips_a_uuid_request_id_as_uuid_correlation_id() {
        let id = Uuid::new_v4();
        let response = C2dStreamResponse {
            request_id: id.to_string(),
            accept: false,
        };
        let message = encode_stream_response(&response);
        assert_eq!(message.correlation_id, Some(CorrelationId::Uuid(id)));
    }
}
