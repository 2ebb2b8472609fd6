//! Configuration for a [`crate::messenger::Messenger`]: validated once at
//! construction and cloned for the instance's lifetime, mirroring the
//! teacher's `DeviceClientBuilder` validate-then-clone pattern rather than
//! the source's mutable `MESSENGER_CONFIG` struct callers could edit after
//! the fact.

use std::collections::HashMap;
use std::time::Duration;

use uuid::Uuid;

use super::defaults;

/// Attach-time shape of one link (the send or the receive side).
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// The last path segment of the link's address, e.g. `messages/events`
    /// for the telemetry send link or `twin` for a twin link.
    pub suffix: String,
    pub attach_properties: HashMap<String, String>,
    pub settled: bool,
}

impl LinkConfig {
    pub fn new(suffix: impl Into<String>) -> Self {
        LinkConfig {
            suffix: suffix.into(),
            attach_properties: HashMap::new(),
            settled: false,
        }
    }
}

/// Validated, immutable configuration for a [`crate::messenger::Messenger`].
#[derive(Debug, Clone)]
pub struct MessengerConfig {
    pub device_id: String,
    pub module_id: Option<String>,
    pub iothub_host_fqdn: String,
    pub product_info: String,
    pub send_link: LinkConfig,
    pub receive_link: LinkConfig,
    pub max_send_error_count: u32,
    pub event_send_timeout: Duration,
    /// Generated once in [`MessengerConfigBuilder::build`] and carried for
    /// the life of the messenger, so link names stay stable across repeated
    /// calls to [`MessengerConfig::send_link_name`]/[`MessengerConfig::receive_link_name`]
    /// rather than changing on every attach attempt.
    link_instance_id: Uuid,
}

impl MessengerConfig {
    pub fn builder(device_id: impl Into<String>, iothub_host_fqdn: impl Into<String>) -> MessengerConfigBuilder {
        MessengerConfigBuilder {
            device_id: device_id.into(),
            module_id: None,
            iothub_host_fqdn: iothub_host_fqdn.into(),
            product_info: String::new(),
            send_link: None,
            receive_link: None,
            max_send_error_count: defaults::DEFAULT_MAX_SEND_ERROR_COUNT,
            event_send_timeout: Duration::from_secs(defaults::DEFAULT_EVENT_SEND_TIMEOUT_SECS),
        }
    }

    /// The name a caller should attach the send link under.
    pub fn send_link_name(&self) -> String {
        format!(
            "{}-{}-{}",
            defaults::SEND_LINK_NAME_PREFIX,
            self.device_id,
            self.link_instance_id
        )
    }

    /// The name a caller should attach the receive link under.
    pub fn receive_link_name(&self) -> String {
        format!(
            "{}-{}-{}",
            defaults::RECEIVE_LINK_NAME_PREFIX,
            self.device_id,
            self.link_instance_id
        )
    }

    /// The send link's AMQP address:
    /// `amqps://<fqdn>/devices/<device_id>/<suffix>`, or the module form
    /// when `module_id` is set.
    pub fn send_link_address(&self) -> String {
        build_link_address(&self.iothub_host_fqdn, &self.device_id, self.module_id.as_deref(), &self.send_link.suffix)
    }

    /// The receive link's AMQP address, built the same way as
    /// [`MessengerConfig::send_link_address`] from `receive_link.suffix`.
    pub fn receive_link_address(&self) -> String {
        build_link_address(
            &self.iothub_host_fqdn,
            &self.device_id,
            self.module_id.as_deref(),
            &self.receive_link.suffix,
        )
    }
}

/// `amqps://<fqdn>/devices/<device_id>/<suffix>`, or
/// `amqps://<fqdn>/devices/<device_id>/modules/<module_id>/<suffix>` when a
/// module id is present, mirroring `create_link_address` in
/// `iothubtransport_amqp_messenger.c`.
fn build_link_address(fqdn: &str, device_id: &str, module_id: Option<&str>, suffix: &str) -> String {
    match module_id {
        Some(module_id) => format!("amqps://{fqdn}/devices/{device_id}/modules/{module_id}/{suffix}"),
        None => format!("amqps://{fqdn}/devices/{device_id}/{suffix}"),
    }
}

/// Validation failure for [`MessengerConfigBuilder::build`], ordered to match
/// the argument-checking order in the source
/// (`iothubtransport_amqp_messenger.c`: device id, then hub fqdn, then link
/// suffixes).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MessengerConfigError {
    #[error("device_id must not be empty")]
    MissingDeviceId,
    #[error("iothub_host_fqdn must not be empty")]
    MissingIotHubHostFqdn,
    #[error("send link suffix must not be empty")]
    MissingSendLinkSuffix,
    #[error("receive link suffix must not be empty")]
    MissingReceiveLinkSuffix,
}

pub struct MessengerConfigBuilder {
    device_id: String,
    module_id: Option<String>,
    iothub_host_fqdn: String,
    product_info: String,
    send_link: Option<LinkConfig>,
    receive_link: Option<LinkConfig>,
    max_send_error_count: u32,
    event_send_timeout: Duration,
}

impl MessengerConfigBuilder {
    pub fn module_id(mut self, module_id: impl Into<String>) -> Self {
        self.module_id = Some(module_id.into());
        self
    }

    pub fn product_info(mut self, product_info: impl Into<String>) -> Self {
        self.product_info = product_info.into();
        self
    }

    pub fn send_link(mut self, link: LinkConfig) -> Self {
        self.send_link = Some(link);
        self
    }

    pub fn receive_link(mut self, link: LinkConfig) -> Self {
        self.receive_link = Some(link);
        self
    }

    pub fn max_send_error_count(mut self, count: u32) -> Self {
        self.max_send_error_count = count;
        self
    }

    pub fn event_send_timeout(mut self, timeout: Duration) -> Self {
        self.event_send_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<MessengerConfig, MessengerConfigError> {
        if self.device_id.is_empty() {
            return Err(MessengerConfigError::MissingDeviceId);
        }
        if self.iothub_host_fqdn.is_empty() {
            return Err(MessengerConfigError::MissingIotHubHostFqdn);
        }
        let send_link = self.send_link.unwrap_or_else(|| LinkConfig::new(defaults::DEFAULT_SEND_LINK_SUFFIX));
        if send_link.suffix.is_empty() {
            return Err(MessengerConfigError::MissingSendLinkSuffix);
        }
        let receive_link = self
            .receive_link
            .unwrap_or_else(|| LinkConfig::new(defaults::DEFAULT_RECEIVE_LINK_SUFFIX));
        if receive_link.suffix.is_empty() {
            return Err(MessengerConfigError::MissingReceiveLinkSuffix);
        }
        Ok(MessengerConfig {
            device_id: self.device_id,
            module_id: self.module_id,
            iothub_host_fqdn: self.iothub_host_fqdn,
            product_info: self.product_info,
            send_link,
            receive_link,
            max_send_error_count: self.max_send_error_count,
            event_send_timeout: self.event_send_timeout,
            link_instance_id: Uuid::new_v4(),
        })
    }
}
