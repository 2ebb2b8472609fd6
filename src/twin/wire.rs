//! Wire format for device twin operations and notifications, carried from
//! `iothubtransport_amqp_twin_messenger.c`: the operation and target
//! resource ride as message annotations, the correlation id ties a request
//! to its response, and desired-property notifications arrive on the same
//! link with no correlation id at all.

use crate::amqp::{AmqpMessage, AnnotationValue, CorrelationId};

pub const CLIENT_VERSION_PROPERTY_NAME: &str = "com.microsoft:client-version";
pub const CORRELATION_ID_PROPERTY_NAME: &str = "com.microsoft:channel-correlation-id";
pub const API_VERSION_PROPERTY_NAME: &str = "com.microsoft:api-version";
pub const API_VERSION: &str = "2016-11-14";

const ANNOTATION_OPERATION: &str = "operation";
const ANNOTATION_RESOURCE: &str = "resource";
const ANNOTATION_VERSION: &str = "version";
const ANNOTATION_STATUS: &str = "status";

const RESOURCE_REPORTED_PROPERTIES: &str = "/properties/reported";
const RESOURCE_DESIRED_PROPERTIES_NOTIFY: &str = "/notifications/twin/properties/desired";

pub const DEFAULT_MAX_TWIN_SUBSCRIPTION_ERROR_COUNT: u32 = 3;
pub const DEFAULT_TWIN_OPERATION_TIMEOUT_SECS: u64 = 300;

/// The operation named by a twin request's `operation` annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwinOperationKind {
    Get,
    Put,
    Patch,
    Delete,
}

impl TwinOperationKind {
    fn as_str(self) -> &'static str {
        match self {
            TwinOperationKind::Get => "GET",
            TwinOperationKind::Put => "PUT",
            TwinOperationKind::Patch => "PATCH",
            TwinOperationKind::Delete => "DELETE",
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TwinWireError {
    #[error("twin message has no status annotation")]
    MissingStatus,
    #[error("twin message has no correlation id")]
    MissingCorrelationId,
    #[error("twin status annotation is not an integer")]
    InvalidStatus,
}

pub fn encode_twin_request(
    kind: TwinOperationKind,
    correlation_id: &str,
    body: Vec<u8>,
) -> AmqpMessage {
    let message = AmqpMessage::new(body)
        .with_correlation_id(CorrelationId::String(correlation_id.to_string()))
        .with_annotation(ANNOTATION_OPERATION, kind.as_str());
    match kind {
        TwinOperationKind::Patch => message.with_annotation(ANNOTATION_RESOURCE, RESOURCE_REPORTED_PROPERTIES),
        TwinOperationKind::Put | TwinOperationKind::Delete => {
            message.with_annotation(ANNOTATION_RESOURCE, RESOURCE_DESIRED_PROPERTIES_NOTIFY)
        }
        TwinOperationKind::Get => message,
    }
}

/// A response to a request built with [`encode_twin_request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwinResponse {
    pub correlation_id: String,
    pub status: i64,
    pub version: Option<i64>,
    pub body: Vec<u8>,
}

impl TwinResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub fn decode_twin_response(message: &AmqpMessage) -> Result<TwinResponse, TwinWireError> {
    let correlation_id = match &message.correlation_id {
        Some(CorrelationId::String(s)) => s.clone(),
        Some(CorrelationId::Uuid(id)) => id.to_string(),
        None => return Err(TwinWireError::MissingCorrelationId),
    };
    let status = match message.message_annotations.get(ANNOTATION_STATUS) {
        Some(AnnotationValue::Long(status)) => *status,
        Some(AnnotationValue::Str(status)) => status.parse().map_err(|_| TwinWireError::InvalidStatus)?,
        Some(_) => return Err(TwinWireError::InvalidStatus),
        None => return Err(TwinWireError::MissingStatus),
    };
    let version = match message.message_annotations.get(ANNOTATION_VERSION) {
        Some(AnnotationValue::Long(v)) => Some(*v),
        Some(AnnotationValue::Str(v)) => v.parse().ok(),
        _ => None,
    };
    Ok(TwinResponse {
        correlation_id,
        status,
        version,
        body: message.body.clone(),
    })
}

/// A desired-properties notification, distinguished from a request response
/// by the absence of a correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredPropertiesDelta {
    pub version: Option<i64>,
    pub body: Vec<u8>,
}

pub fn decode_desired_properties_notification(
    message: &AmqpMessage,
) -> Result<DesiredPropertiesDelta, TwinWireError> {
    if message.correlation_id.is_some() {
        return Err(TwinWireError::MissingStatus);
    }
    match message.message_annotations.get(ANNOTATION_RESOURCE) {
        Some(AnnotationValue::Str(resource)) if resource == RESOURCE_DESIRED_PROPERTIES_NOTIFY => {}
        _ => return Err(TwinWireError::MissingStatus),
    }
    let version = match message.message_annotations.get(ANNOTATION_VERSION) {
        Some(AnnotationValue::Long(v)) => Some(*v),
        Some(AnnotationValue::Str(v)) => v.parse().ok(),
        _ => None,
    };
    Ok(DesiredPropertiesDelta {
        version,
        body: message.body.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_operation_and_resource_annotations() {
        let message = encode_twin_request(TwinOperationKind::Patch, "corr-1", vec![1, 2]);
        assert_eq!(
            message.message_annotations.get(ANNOTATION_OPERATION),
            Some(&AnnotationValue::Str("PATCH".to_string()))
        );
        assert_eq!(
            message.correlation_id,
            Some(CorrelationId::String("corr-1".to_string()))
        );
    }

    #[test]
    fn get_request_carries_no_resource_annotation() {
        let message = encode_twin_request(TwinOperationKind::Get, "corr-1", Vec::new());
        assert_eq!(message.message_annotations.get(ANNOTATION_RESOURCE), None);
    }

    #[test]
    fn put_and_delete_requests_target_desired_properties_notify() {
        for kind in [TwinOperationKind::Put, TwinOperationKind::Delete] {
            let message = encode_twin_request(kind, "corr-1", Vec::new());
            assert_eq!(
                message.message_annotations.get(ANNOTATION_RESOURCE),
                Some(&AnnotationValue::Str(RESOURCE_DESIRED_PROPERTIES_NOTIFY.to_string()))
            );
        }
    }

    #[test]
    fn response_without_status_is_rejected() {
        let message = AmqpMessage::new(vec![]).with_correlation_id(CorrelationId::String("corr-1".into()));
        assert_eq!(decode_twin_response(&message).unwrap_err(), TwinWireError::MissingStatus);
    }

    #[test]
    fn response_with_status_decodes() {
        let message = AmqpMessage::new(vec![9])
            .with_correlation_id(CorrelationId::String("corr-1".into()))
            .with_annotation(ANNOTATION_STATUS, 200i64)
            .with_annotation(ANNOTATION_VERSION, 3i64);
        let response = decode_twin_response(&message).unwrap();
        assert!(response.is_success());
        assert_eq!(response.version, Some(3));
    }

    #[test]
    fn notification_without_correlation_id_decodes_as_delta() {
        let message = AmqpMessage::new(vec![5])
            .with_annotation(ANNOTATION_RESOURCE, RESOURCE_DESIRED_PROPERTIES_NOTIFY)
            .with_annotation(ANNOTATION_VERSION, 4i64);
        let delta = decode_desired_properties_notification(&message).unwrap();
        assert_eq!(delta.version, Some(4));
        assert_eq!(delta.body, vec![5]);
    }
}
