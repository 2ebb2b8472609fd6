//! Device twin reported/desired properties on top of a dedicated
//! [`Messenger`]: report state (partial patch), fetch the complete twin on
//! demand, replace or clear the reported properties, and subscribe for
//! desired-property push notifications.

pub mod subscription;
pub mod wire;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::amqp::AmqpSession;
use crate::messenger::config::LinkConfig;
use crate::messenger::{Messenger, MessengerConfig, MessengerError, MessengerOption};
use crate::{ClientState, DispositionResult, SendReason, SendResult, SendStatus, UpdateType};

pub use subscription::{SubscriptionEvent, SubscriptionMachine, SubscriptionState};
pub use wire::{DesiredPropertiesDelta, TwinOperationKind, TwinResponse, TwinWireError};

const OPERATION_TIMEOUT: Duration = Duration::from_secs(wire::DEFAULT_TWIN_OPERATION_TIMEOUT_SECS);

/// The kind of a tracked in-flight twin request, tagging how its response
/// should be routed once it arrives. The idiomatic replacement for the
/// source's single `TWIN_OPERATION_CONTEXT` carrying a union of callback
/// arguments.
enum TwinOpKind {
    /// The subscription machine's own fetch-complete-twin step.
    SubscriptionGet,
    /// The subscription machine's own register-for-updates step.
    SubscriptionPut,
    /// The subscription machine's own unregister-for-updates step. Distinct
    /// from the public [`TwinOpKind::Delete`], whose completion only fires a
    /// caller callback and never touches the subscription state machine.
    SubscriptionDelete,
    Patch {
        on_complete: Box<dyn FnOnce(SendResult, SendReason)>,
    },
    GetOnDemand {
        on_complete: Box<dyn FnOnce(SendResult, SendReason, Option<Vec<u8>>)>,
    },
    Delete {
        on_complete: Box<dyn FnOnce(SendResult, SendReason)>,
    },
}

struct TwinOperation {
    kind: TwinOpKind,
    correlation_id: String,
    sent_at: Instant,
}

/// A reported-properties patch waiting to be dispatched. Patches are
/// serialized one at a time: at most one is ever in [`TwinOperation`]
/// tracking simultaneously, so a slow subscriber doesn't reorder updates.
struct TwinPatch {
    body: Vec<u8>,
    on_complete: Box<dyn FnOnce(SendResult, SendReason)>,
    enqueued_at: Instant,
}

#[derive(Default)]
struct InboundShared {
    responses: VecDeque<wire::TwinResponse>,
    deltas: VecDeque<wire::DesiredPropertiesDelta>,
}

pub struct TwinClient<S: AmqpSession> {
    messenger: Messenger<S>,
    state: ClientState,
    subscription: SubscriptionMachine,
    patches: VecDeque<TwinPatch>,
    operations: Vec<TwinOperation>,
    inbound: Rc<RefCell<InboundShared>>,
    on_desired_properties_updated: Option<Box<dyn FnMut(UpdateType, Vec<u8>)>>,
}

impl<S: AmqpSession> TwinClient<S> {
    pub fn create(
        device_id: impl Into<String>,
        module_id: Option<String>,
        iothub_host_fqdn: impl Into<String>,
        product_info: impl Into<String>,
    ) -> Self {
        let product_info = product_info.into();

        let mut send_link = LinkConfig::new("twin");
        send_link
            .attach_properties
            .insert(wire::CLIENT_VERSION_PROPERTY_NAME.to_string(), product_info.clone());

        let mut receive_link = LinkConfig::new("twin");
        receive_link
            .attach_properties
            .insert(wire::CLIENT_VERSION_PROPERTY_NAME.to_string(), product_info.clone());
        receive_link
            .attach_properties
            .insert(wire::CORRELATION_ID_PROPERTY_NAME.to_string(), format!("twin:{}", Uuid::new_v4()));
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
        let inbound = Rc::new(RefCell::new(InboundShared::default()));
        let inbound_for_callback = Rc::clone(&inbound);
        messenger.subscribe_for_messages(move |message| {
            if let Ok(response) = wire::decode_twin_response(&message) {
                inbound_for_callback.borrow_mut().responses.push_back(response);
                return DispositionResult::Accepted;
            }
            if let Ok(delta) = wire::decode_desired_properties_notification(&message) {
                inbound_for_callback.borrow_mut().deltas.push_back(delta);
                return DispositionResult::Accepted;
            }
            DispositionResult::Rejected
        });

        TwinClient {
            messenger,
            state: ClientState::Stopped,
            subscription: SubscriptionMachine::new(),
            patches: VecDeque::new(),
            operations: Vec::new(),
            inbound,
            on_desired_properties_updated: None,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn start(&mut self) -> Result<(), MessengerError> {
        self.state = ClientState::Starting;
        self.messenger.start()
    }

    pub fn stop(&mut self) {
        self.state = ClientState::Stopping;
        self.messenger.stop();
    }

    pub fn destroy(&mut self) {
        self.messenger.destroy();
        self.patches.clear();
        self.operations.clear();
        self.subscription = SubscriptionMachine::new();
        self.state = ClientState::Stopped;
    }

    pub fn report_state_async(
        &mut self,
        patch_body: Vec<u8>,
        on_complete: impl FnOnce(SendResult, SendReason) + 'static,
    ) {
        self.patches.push_back(TwinPatch {
            body: patch_body,
            on_complete: Box::new(on_complete),
            enqueued_at: Instant::now(),
        });
    }

    pub fn get_twin_async(
        &mut self,
        on_complete: impl FnOnce(SendResult, SendReason, Option<Vec<u8>>) + 'static,
    ) -> Result<(), MessengerError> {
        self.send_operation(
            TwinOpKind::GetOnDemand {
                on_complete: Box::new(on_complete),
            },
            TwinOperationKind::Get,
            Vec::new(),
        )
    }

    pub fn delete_reported_properties_async(
        &mut self,
        on_complete: impl FnOnce(SendResult, SendReason) + 'static,
    ) -> Result<(), MessengerError> {
        self.send_operation(
            TwinOpKind::Delete {
                on_complete: Box::new(on_complete),
            },
            TwinOperationKind::Delete,
            Vec::new(),
        )
    }

    pub fn subscribe(&mut self, on_update: impl FnMut(UpdateType, Vec<u8>) + 'static) {
        self.on_desired_properties_updated = Some(Box::new(on_update));
        self.subscription.subscribe();
    }

    pub fn unsubscribe(&mut self) {
        self.subscription.unsubscribe();
    }

    pub fn get_send_status(&self) -> SendStatus {
        if self.patches.is_empty() && self.operations.is_empty() {
            SendStatus::Idle
        } else {
            SendStatus::Busy
        }
    }

    pub fn set_option(&mut self, option: MessengerOption) {
        self.messenger.set_option(option)
    }

    fn send_operation(
        &mut self,
        kind: TwinOpKind,
        wire_kind: TwinOperationKind,
        body: Vec<u8>,
    ) -> Result<(), MessengerError> {
        let correlation_id = Uuid::new_v4().to_string();
        let message = wire::encode_twin_request(wire_kind, &correlation_id, body);
        let sent_at = Instant::now();
        self.messenger.send_async(message, |_, _| {})?;
        self.operations.push(TwinOperation {
            kind,
            correlation_id,
            sent_at,
        });
        Ok(())
    }

    pub fn do_work(&mut self, session: &mut S) {
        self.messenger.do_work(session);

        if self.messenger.state() == ClientState::Error {
            self.state = ClientState::Error;
        } else if self.state == ClientState::Starting && self.messenger.state() == ClientState::Started {
            self.state = ClientState::Started;
        } else if self.state == ClientState::Stopping && self.messenger.state() == ClientState::Stopped {
            self.state = ClientState::Stopped;
        }

        if self.state != ClientState::Started {
            return;
        }

        self.drive_subscription();
        self.dispatch_one_patch();
        self.route_responses();
        self.route_deltas();
        self.sweep_timeouts();
    }

    fn drive_subscription(&mut self) {
        match self.subscription.state() {
            SubscriptionState::GetCompleteProperties => {
                self.subscription.step_started();
                let _ = self.send_operation(TwinOpKind::SubscriptionGet, TwinOperationKind::Get, Vec::new());
            }
            SubscriptionState::SubscribeForUpdates => {
                self.subscription.step_started();
                let _ = self.send_operation(TwinOpKind::SubscriptionPut, TwinOperationKind::Put, Vec::new());
            }
            SubscriptionState::Unsubscribe => {
                self.subscription.step_started();
                let _ = self.send_operation(TwinOpKind::SubscriptionDelete, TwinOperationKind::Delete, Vec::new());
            }
            _ => {}
        }
    }

    fn dispatch_one_patch(&mut self) {
        let already_patching = self
            .operations
            .iter()
            .any(|op| matches!(op.kind, TwinOpKind::Patch { .. }));
        if already_patching {
            return;
        }
        let Some(patch) = self.patches.pop_front() else {
            return;
        };
        let correlation_id = Uuid::new_v4().to_string();
        let message = wire::encode_twin_request(TwinOperationKind::Patch, &correlation_id, patch.body);
        let sent_at = Instant::now();
        if self.messenger.send_async(message, |_, _| {}).is_err() {
            (patch.on_complete)(SendResult::Error, SendReason::InternalError);
            return;
        }
        self.operations.push(TwinOperation {
            kind: TwinOpKind::Patch {
                on_complete: patch.on_complete,
            },
            correlation_id,
            sent_at,
        });
    }

    fn route_responses(&mut self) {
        let responses: Vec<_> = self.inbound.borrow_mut().responses.drain(..).collect();
        for response in responses {
            let Some(pos) = self
                .operations
                .iter()
                .position(|op| op.correlation_id == response.correlation_id)
            else {
                continue;
            };
            let operation = self.operations.remove(pos);
            self.complete_operation(operation.kind, response.is_success(), Some(response.body));
        }
    }

    fn complete_operation(&mut self, kind: TwinOpKind, success: bool, body: Option<Vec<u8>>) {
        match kind {
            TwinOpKind::SubscriptionGet => {
                let event = if success {
                    self.subscription.step_succeeded()
                } else {
                    self.subscription.step_failed()
                };
                if event == SubscriptionEvent::Error {
                    self.state = ClientState::Error;
                } else if success {
                    if let Some(callback) = self.on_desired_properties_updated.as_mut() {
                        callback(UpdateType::Complete, body.unwrap_or_default());
                    }
                }
            }
            TwinOpKind::SubscriptionPut | TwinOpKind::SubscriptionDelete => {
                let event = if success {
                    self.subscription.step_succeeded()
                } else {
                    self.subscription.step_failed()
                };
                if event == SubscriptionEvent::Error {
                    self.state = ClientState::Error;
                }
            }
            TwinOpKind::Patch { on_complete } => {
                if success {
                    on_complete(SendResult::Success, SendReason::None);
                } else {
                    on_complete(SendResult::Error, SendReason::InvalidResponse);
                }
            }
            TwinOpKind::Delete { on_complete } => {
                if success {
                    on_complete(SendResult::Success, SendReason::None);
                } else {
                    on_complete(SendResult::Error, SendReason::InvalidResponse);
                }
            }
            TwinOpKind::GetOnDemand { on_complete } => {
                if success {
                    on_complete(SendResult::Success, SendReason::None, body);
                } else {
                    on_complete(SendResult::Error, SendReason::InvalidResponse, None);
                }
            }
        }
    }

    fn route_deltas(&mut self) {
        let deltas: Vec<_> = self.inbound.borrow_mut().deltas.drain(..).collect();
        for delta in deltas {
            if let Some(callback) = self.on_desired_properties_updated.as_mut() {
                callback(UpdateType::Partial, delta.body);
            }
        }
    }

    fn sweep_timeouts(&mut self) {
        let now = Instant::now();
        let mut i = 0;
        while i < self.operations.len() {
            if now.saturating_duration_since(self.operations[i].sent_at) > OPERATION_TIMEOUT {
                let operation = self.operations.remove(i);
                match operation.kind {
                    TwinOpKind::SubscriptionGet | TwinOpKind::SubscriptionPut | TwinOpKind::SubscriptionDelete => {
                        if self.subscription.step_failed() == SubscriptionEvent::Error {
                            self.state = ClientState::Error;
                        }
                    }
                    TwinOpKind::Patch { on_complete } => on_complete(SendResult::Error, SendReason::Timeout),
                    TwinOpKind::Delete { on_complete } => on_complete(SendResult::Error, SendReason::Timeout),
                    TwinOpKind::GetOnDemand { on_complete } => {
                        on_complete(SendResult::Error, SendReason::Timeout, None)
                    }
                }
            } else {
                i += 1;
            }
        }
        let mut j = 0;
        while j < self.patches.len() {
            if now.saturating_duration_since(self.patches[j].enqueued_at) > OPERATION_TIMEOUT {
                let patch = self.patches.remove(j).unwrap();
                (patch.on_complete)(SendResult::Error, SendReason::Timeout);
            } else {
                j += 1;
            }
        }
    }
}
