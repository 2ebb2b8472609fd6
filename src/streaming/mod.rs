//! Cloud-to-device stream invitations, carried over the receive link of an
//! inner [`Messenger`].

pub mod wire;

use std::cell::RefCell;
use std::rc::Rc;

use crate::amqp::AmqpSession;
use crate::messenger::config::LinkConfig;
use crate::messenger::{Messenger, MessengerConfig, MessengerError, MessengerOption};
use crate::{ClientState, DispositionResult, SendReason, SendResult, SendStatus};

pub use wire::{C2dStreamRequest, C2dStreamResponse, StreamingWireError};

type StreamRequestCallback = dyn FnMut(C2dStreamRequest) -> Option<C2dStreamResponse>;

/// Cloud-to-device stream invitations riding on top of a dedicated
/// [`Messenger`]. The receive link is always open (a device can be invited
/// to stream at any time), unlike the base messenger where subscribing is
/// opt-in.
pub struct StreamingClient<S: AmqpSession> {
    messenger: Messenger<S>,
    on_stream_request: Rc<RefCell<Option<Box<StreamRequestCallback>>>>,
}

impl<S: AmqpSession> StreamingClient<S> {
    pub fn create(
        device_id: impl Into<String>,
        module_id: Option<String>,
        iothub_host_fqdn: impl Into<String>,
        product_info: impl Into<String>,
    ) -> Self {
        let product_info = product_info.into();
        let channel_correlation_id = wire::new_channel_correlation_id();

        let mut send_link = LinkConfig::new("streams");
        send_link
            .attach_properties
            .insert(wire::CLIENT_VERSION_PROPERTY_NAME.to_string(), product_info.clone());

        let mut receive_link = LinkConfig::new("streams");
        receive_link
            .attach_properties
            .insert(wire::CLIENT_VERSION_PROPERTY_NAME.to_string(), product_info.clone());
        receive_link
            .attach_properties
            .insert(wire::CORRELATION_ID_PROPERTY_NAME.to_string(), channel_correlation_id);
        receive_link
            .attach_properties
            .insert(wire::API_VERSION_PROPERTY_NAME.to_string(), wire::API_VERSION.to_string());

        let mut builder = MessengerConfig::builder(device_id, iothub_host_fqdn)
            .product_info(product_info)
            .receive_link(receive_link)
            .send_link(send_link);
        if let Some(module_id) = module_id {
            builder = builder.module_id(module_id);
        }
        let config = builder
            .build()
            .expect("device_id and iothub_host_fqdn are validated by the caller's client config");

        let mut messenger = Messenger::create(config);
        let sender = messenger.sender_handle();
        let on_stream_request: Rc<RefCell<Option<Box<StreamRequestCallback>>>> = Rc::new(RefCell::new(None));
        let on_stream_request_for_callback = Rc::clone(&on_stream_request);

        // Disposition depends on what the callback returns, not on whether
        // decode succeeded: a response is sent immediately and the disposition
        // follows that send, matching `on_amqp_message_received_callback` in
        // `iothubtransport_amqp_streaming.c`.
        messenger.subscribe_for_messages(move |message| match wire::decode_stream_request(&message) {
            Ok(request) => {
                let response = on_stream_request_for_callback
                    .borrow_mut()
                    .as_mut()
                    .and_then(|callback| callback(request));
                if let Some(response) = response {
                    sender.send_async(wire::encode_stream_response(&response), |_, _| {});
                }
                DispositionResult::Accepted
            }
            Err(_) => DispositionResult::Rejected,
        });

        StreamingClient {
            messenger,
            on_stream_request,
        }
    }

    pub fn state(&self) -> ClientState {
        self.messenger.state()
    }

    pub fn start(&mut self) -> Result<(), MessengerError> {
        self.messenger.start()
    }

    pub fn stop(&mut self) {
        self.messenger.stop()
    }

    /// `callback` returns `Some(response)` to answer the invitation
    /// immediately, or `None` to leave it to a later
    /// [`StreamingClient::send_stream_response`] call.
    pub fn set_stream_request_callback(
        &mut self,
        callback: impl FnMut(C2dStreamRequest) -> Option<C2dStreamResponse> + 'static,
    ) {
        *self.on_stream_request.borrow_mut() = Some(Box::new(callback));
    }

    pub fn send_stream_response(
        &mut self,
        response: C2dStreamResponse,
        on_complete: impl FnOnce(SendResult, SendReason) + 'static,
    ) -> Result<(), MessengerError> {
        self.messenger.send_async(wire::encode_stream_response(&response), on_complete)
    }

    pub fn get_send_status(&self) -> SendStatus {
        self.messenger.get_send_status()
    }

    pub fn set_option(&mut self, option: MessengerOption) {
        self.messenger.set_option(option)
    }

    pub fn destroy(&mut self) {
        self.messenger.destroy()
    }

    pub fn do_work(&mut self, session: &mut S) {
        self.messenger.do_work(session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amqp::testing::{TestBus, TestSession};
    use crate::amqp::AmqpMessage;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn well_formed_invitation_is_accepted_and_forwarded() {
        let bus = TestBus::new();
        let mut session = TestSession::new(bus.clone());
        let mut client: StreamingClient<TestSession> =
            StreamingClient::create("device-1", None, "hub.example.com", "test/1.0");

        let received = Rc::new(RefCell::new(None));
        let received_clone = Rc::clone(&received);
        client.set_stream_request_callback(move |request| {
            *received_clone.borrow_mut() = Some(request);
            None
        });

        client.start().unwrap();
        client.do_work(&mut session);
        assert_eq!(client.state(), ClientState::Started);

        let request = wire::C2dStreamRequest {
            request_id: "req-1".to_string(),
            stream_name: "logs".to_string(),
            gateway_url: "wss://gw.example.com".to_string(),
            gateway_hostname: None,
            gateway_port: None,
            authorization_token: "token".to_string(),
        };
        let mut message = AmqpMessage::new(vec![]);
        message.correlation_id = Some(crate::amqp::CorrelationId::String(request.request_id.clone()));
        message
            .application_properties
            .insert(wire::STREAM_PROP_NAME.to_string(), request.stream_name.clone());
        message
            .application_properties
            .insert(wire::STREAM_PROP_URL.to_string(), request.gateway_url.clone());
        message
            .application_properties
            .insert(wire::STREAM_PROP_AUTH_TOKEN.to_string(), request.authorization_token.clone());

        bus.deliver(message, 1, "link-rcv-streaming");
        client.do_work(&mut session);

        assert_eq!(bus.dispositions().len(), 1);
        assert_eq!(received.borrow().as_ref().map(|r: &wire::C2dStreamRequest| r.stream_name.clone()), Some("logs".to_string()));
    }

    #[test]
    fn callback_returned_response_is_sent_and_invitation_accepted() {
        let bus = TestBus::new();
        let mut session = TestSession::new(bus.clone());
        let mut client: StreamingClient<TestSession> =
            StreamingClient::create("device-1", None, "hub.example.com", "test/1.0");
        client.set_stream_request_callback(|request| {
            Some(wire::C2dStreamResponse {
                request_id: request.request_id,
                accept: true,
            })
        });
        client.start().unwrap();
        client.do_work(&mut session);

        let mut message = AmqpMessage::new(vec![]);
        message.correlation_id = Some(crate::amqp::CorrelationId::String("req-2".to_string()));
        message
            .application_properties
            .insert(wire::STREAM_PROP_NAME.to_string(), "logs".to_string());
        message
            .application_properties
            .insert(wire::STREAM_PROP_URL.to_string(), "wss://gw.example.com".to_string());
        message
            .application_properties
            .insert(wire::STREAM_PROP_AUTH_TOKEN.to_string(), "token".to_string());

        bus.deliver(message, 1, "link-rcv-streaming");
        client.do_work(&mut session);
        // The response lands in the outbound queue during this tick; it is
        // dispatched to the sender on the next one.
        client.do_work(&mut session);

        assert_eq!(bus.dispositions()[0].1, crate::amqp::SendOutcome::Accepted);
        assert_eq!(bus.sent_messages().len(), 1);
        assert_eq!(
            bus.sent_messages()[0].correlation_id,
            Some(crate::amqp::CorrelationId::String("req-2".to_string()))
        );
    }

    #[test]
    fn malformed_invitation_is_rejected() {
        let bus = TestBus::new();
        let mut session = TestSession::new(bus.clone());
        let mut client: StreamingClient<TestSession> =
            StreamingClient::create("device-1", None, "hub.example.com", "test/1.0");
        client.start().unwrap();
        client.do_work(&mut session);

        let message = AmqpMessage::new(vec![]);
        bus.deliver(message, 1, "link-rcv-streaming");
        client.do_work(&mut session);

        assert_eq!(
            bus.dispositions()[0].1,
            crate::amqp::SendOutcome::Rejected
        );
    }
}
