//! Feedback loop endpoints
//!
//! A receiver sits early in the chain and is registered by name when the
//! chain is built. A sender further down clones matching data events into
//! the receiver, which then flows them through the stages between the two.

use super::FEEDBACK_NAME;
use crate::feedback::FeedbackRegistry;
use crate::filter::{Filter, FilterOutput, Services};
use devflow_core::{ConfigError, DeviceEvent, DevflowResult, EventKind, FilterLink, SignalId};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace};

/// Entry point of a feedback loop; forwards everything
#[derive(Debug, Default, Clone)]
pub struct FeedbackReceiver {
    name: String,
}

impl FeedbackReceiver {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Filter for FeedbackReceiver {
    fn configure(&mut self, link: &FilterLink, _services: &Services) -> Result<(), Vec<ConfigError>> {
        let name = link.require_str(FEEDBACK_NAME).map_err(|e| vec![e])?;
        if name.trim().is_empty() {
            return Err(vec![ConfigError::invalid(FEEDBACK_NAME, "must not be empty")]);
        }
        self.name = name.to_string();
        Ok(())
    }

    fn execute(&mut self, event: DeviceEvent, output: &FilterOutput<'_>) -> DevflowResult<()> {
        output.send(event)
    }
}

/// Exit point of a feedback loop
///
/// Parameters: `feedback_name` (wstring) and optionally `signal` (guid,
/// default All). Data events (levels and parameters) of `signal` are cloned
/// into the named receiver, then every event is forwarded. A clone that
/// comes back around is not fed back a second time.
///
/// Only the newest [`MAX_IN_FLIGHT`] clones are remembered. Clones the loop
/// swallows are forgotten once they fall out of that window.
#[derive(Default)]
pub struct FeedbackSender {
    name: String,
    signal: SignalId,
    feedback: Option<Arc<FeedbackRegistry>>,
    in_flight: InFlight,
}

/// Clones a sender waits to see come back
pub const MAX_IN_FLIGHT: usize = 1024;

/// Logical clocks of clones in the loop, oldest first
#[derive(Debug, Default)]
struct InFlight {
    clocks: HashSet<u64>,
    order: VecDeque<u64>,
}

impl InFlight {
    fn insert(&mut self, clock: u64) {
        if self.clocks.insert(clock) {
            self.order.push_back(clock);
        }
        while self.order.len() > MAX_IN_FLIGHT {
            if let Some(oldest) = self.order.pop_front() {
                self.clocks.remove(&oldest);
            }
        }
    }

    fn remove(&mut self, clock: u64) -> bool {
        if !self.clocks.remove(&clock) {
            return false;
        }
        if self.order.back() == Some(&clock) {
            self.order.pop_back();
        } else if self.order.front() == Some(&clock) {
            self.order.pop_front();
        }
        true
    }

    fn len(&self) -> usize {
        self.clocks.len()
    }
}

impl FeedbackSender {
    /// Clones sent to the receiver that have not come back yet
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn is_data(kind: EventKind) -> bool {
        matches!(
            kind,
            EventKind::Level | EventKind::MaskedLevel | EventKind::Parameters | EventKind::ParametersHint
        )
    }

    fn feed_back(&mut self, event: &DeviceEvent, output: &FilterOutput<'_>) {
        let Some(receiver) = self.feedback.as_ref().and_then(|f| f.lookup(&self.name)) else {
            trace!(name = %self.name, "no live feedback receiver");
            return;
        };
        let copy = output.events().clone_event(event);
        let clock = copy.logical_clock();
        self.in_flight.insert(clock);
        if let Err(error) = receiver.offer(copy) {
            self.in_flight.remove(clock);
            debug!(name = %self.name, %error, "feedback not delivered");
        }
    }
}

impl Filter for FeedbackSender {
    fn configure(&mut self, link: &FilterLink, services: &Services) -> Result<(), Vec<ConfigError>> {
        let mut errors = Vec::new();
        match link.require_str(FEEDBACK_NAME) {
            Ok(name) if !name.trim().is_empty() => self.name = name.to_string(),
            Ok(_) => errors.push(ConfigError::invalid(FEEDBACK_NAME, "must not be empty")),
            Err(error) => errors.push(error),
        }
        match link.optional_guid("signal") {
            Ok(signal) => self.signal = signal.map(SignalId).unwrap_or(SignalId::ALL),
            Err(error) => errors.push(error),
        }
        self.feedback = Some(services.feedback.clone());
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn execute(&mut self, event: DeviceEvent, output: &FilterOutput<'_>) -> DevflowResult<()> {
        let returning = self.in_flight.remove(event.logical_clock());
        if !returning && Self::is_data(event.kind()) && self.signal.matches(event.signal_id) {
            self.feed_back(&event, output);
        }
        output.send(event)
    }
}
