//! The subscription state machine driving a twin client's two-step
//! handshake (fetch the complete twin, then register for desired-property
//! notifications), with a bounded retry count before giving up.

use super::wire::DEFAULT_MAX_TWIN_SUBSCRIPTION_ERROR_COUNT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    NotSubscribed,
    GetCompleteProperties,
    GettingCompleteProperties,
    SubscribeForUpdates,
    Subscribing,
    Subscribed,
    Unsubscribe,
    Unsubscribing,
}

/// What a completed or failed step means for the caller driving the
/// machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// Advanced to an intermediate state; nothing externally visible yet.
    Continue,
    /// Retrying the same step after a failure below the error threshold.
    Retry,
    Subscribed,
    Unsubscribed,
    /// The error threshold was hit; the caller should surface this as the
    /// twin client's own `ClientState::Error`.
    Error,
}

pub struct SubscriptionMachine {
    state: SubscriptionState,
    error_count: u32,
}

impl SubscriptionMachine {
    pub fn new() -> Self {
        SubscriptionMachine {
            state: SubscriptionState::NotSubscribed,
            error_count: 0,
        }
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn subscribe(&mut self) {
        if self.state == SubscriptionState::NotSubscribed {
            self.state = SubscriptionState::GetCompleteProperties;
            self.error_count = 0;
        }
    }

    pub fn unsubscribe(&mut self) {
        match self.state {
            SubscriptionState::NotSubscribed | SubscriptionState::Unsubscribe | SubscriptionState::Unsubscribing => {}
            _ => self.state = SubscriptionState::Unsubscribe,
        }
    }

    /// Mark the issuing step as in flight (request sent, awaiting response).
    pub fn step_started(&mut self) {
        self.state = match self.state {
            SubscriptionState::GetCompleteProperties => SubscriptionState::GettingCompleteProperties,
            SubscriptionState::SubscribeForUpdates => SubscriptionState::Subscribing,
            SubscriptionState::Unsubscribe => SubscriptionState::Unsubscribing,
            other => other,
        };
    }

    pub fn step_succeeded(&mut self) -> SubscriptionEvent {
        self.error_count = 0;
        match self.state {
            SubscriptionState::GettingCompleteProperties => {
                self.state = SubscriptionState::SubscribeForUpdates;
                SubscriptionEvent::Continue
            }
            SubscriptionState::Subscribing => {
                self.state = SubscriptionState::Subscribed;
                SubscriptionEvent::Subscribed
            }
            SubscriptionState::Unsubscribing => {
                self.state = SubscriptionState::NotSubscribed;
                SubscriptionEvent::Unsubscribed
            }
            _ => SubscriptionEvent::Continue,
        }
    }

    /// Revert the issuing step to be retried, unless the error count has
    /// reached [`DEFAULT_MAX_TWIN_SUBSCRIPTION_ERROR_COUNT`], in which case
    /// the whole subscription attempt is abandoned.
    pub fn step_failed(&mut self) -> SubscriptionEvent {
        self.error_count += 1;
        if self.error_count >= DEFAULT_MAX_TWIN_SUBSCRIPTION_ERROR_COUNT {
            self.state = SubscriptionState::NotSubscribed;
            return SubscriptionEvent::Error;
        }
        self.state = match self.state {
            SubscriptionState::GettingCompleteProperties => SubscriptionState::GetCompleteProperties,
            SubscriptionState::Subscribing => SubscriptionState::SubscribeForUpdates,
            SubscriptionState::Unsubscribing => SubscriptionState::Unsubscribe,
            other => other,
        };
        SubscriptionEvent::Retry
    }
}

impl Default for SubscriptionMachine {
    fn default() -> Self {
        SubscriptionMachine::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_reaches_subscribed() {
        let mut machine = SubscriptionMachine::new();
        machine.subscribe();
        assert_eq!(machine.state(), SubscriptionState::GetCompleteProperties);

        machine.step_started();
        assert_eq!(machine.state(), SubscriptionState::GettingCompleteProperties);
        assert_eq!(machine.step_succeeded(), SubscriptionEvent::Continue);
        assert_eq!(machine.state(), SubscriptionState::SubscribeForUpdates);

        machine.step_started();
        assert_eq!(machine.step_succeeded(), SubscriptionEvent::Subscribed);
        assert_eq!(machine.state(), SubscriptionState::Subscribed);
    }

    #[test]
    fn failures_below_threshold_retry_the_same_step() {
        let mut machine = SubscriptionMachine::new();
        machine.subscribe();
        machine.step_started();
        assert_eq!(machine.step_failed(), SubscriptionEvent::Retry);
        assert_eq!(machine.state(), SubscriptionState::GetCompleteProperties);
    }

    #[test]
    fn failures_at_threshold_abandon_subscription() {
        let mut machine = SubscriptionMachine::new();
        machine.subscribe();
        for _ in 0..DEFAULT_MAX_TWIN_SUBSCRIPTION_ERROR_COUNT {
            machine.step_started();
            let event = machine.step_failed();
            if machine.error_count < DEFAULT_MAX_TWIN_SUBSCRIPTION_ERROR_COUNT {
                assert_eq!(event, SubscriptionEvent::Retry);
            } else {
                assert_eq!(event, SubscriptionEvent::Error);
            }
        }
        assert_eq!(machine.state(), SubscriptionState::NotSubscribed);
    }

    #[test]
    fn unsubscribe_from_subscribed_runs_through_and_back() {
        let mut machine = SubscriptionMachine::new();
        machine.subscribe();
        machine.step_started();
        machine.step_succeeded();
        machine.step_started();
        machine.step_succeeded();
        assert_eq!(machine.state(), SubscriptionState::Subscribed);

        machine.unsubscribe();
        assert_eq!(machine.state(), SubscriptionState::Unsubscribe);
        machine.step_started();
        assert_eq!(machine.step_succeeded(), SubscriptionEvent::Unsubscribed);
        assert_eq!(machine.state(), SubscriptionState::NotSubscribed);
    }
}
