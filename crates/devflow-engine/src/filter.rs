//! Filter contract and the downstream handle a filter writes into

use crate::feedback::FeedbackRegistry;
use devflow_core::{ConfigError, DeviceEvent, DevflowError, DevflowResult, EventFactory, FilterLink};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// Anything that can accept an event: a stage, or the chain's terminal sink
pub trait EventSink: Send + Sync {
    /// Hand over ownership of one event
    fn push(&self, event: DeviceEvent) -> DevflowResult<()>;

    /// Hand over an event coming from another part of the same chain
    ///
    /// Used for feedback. Unlike [`EventSink::push`] it must not wait on
    /// anything the offering thread may itself be holding up. Plain sinks
    /// never block and simply push.
    fn offer(&self, event: DeviceEvent) -> DevflowResult<()> {
        self.push(event)
    }
}

/// How a filter's execute calls are scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheduling {
    /// Runs inline on the caller's thread
    Synchronous,
    /// Runs on a dedicated worker behind a bounded queue
    #[default]
    Asynchronous,
}

/// Static description of a filter type, published by the module providing it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterDescriptor {
    pub id: Uuid,
    pub name: String,
    pub scheduling: Scheduling,
    /// Registers itself under its `feedback_name` parameter when built
    pub feedback_receiver: bool,
}

impl FilterDescriptor {
    /// Asynchronous descriptor without feedback
    pub fn new(id: Uuid, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            scheduling: Scheduling::Asynchronous,
            feedback_receiver: false,
        }
    }

    pub fn synchronous(mut self) -> Self {
        self.scheduling = Scheduling::Synchronous;
        self
    }

    pub fn receives_feedback(mut self) -> Self {
        self.feedback_receiver = true;
        self
    }
}

/// Engine services handed to filters while they configure
#[derive(Clone)]
pub struct Services {
    pub events: Arc<EventFactory>,
    pub feedback: Arc<FeedbackRegistry>,
}

impl Services {
    pub fn new() -> Self {
        Self {
            events: Arc::new(EventFactory::new()),
            feedback: Arc::new(FeedbackRegistry::new()),
        }
    }
}

impl Default for Services {
    fn default() -> Self {
        Self::new()
    }
}

/// Core trait for all pipeline filters
///
/// A filter receives each event by value. Forwarding the event, emitting new
/// ones or dropping it are all done through the [`FilterOutput`] passed to
/// `execute`. A filter never needs to know whether it runs synchronously or
/// on its own worker.
pub trait Filter: Send {
    /// Validate and apply a link's parameters, reporting every problem found
    fn configure(
        &mut self,
        _link: &FilterLink,
        _services: &Services,
    ) -> Result<(), Vec<ConfigError>> {
        Ok(())
    }

    /// Process one event
    fn execute(&mut self, event: DeviceEvent, output: &FilterOutput<'_>) -> DevflowResult<()>;
}

/// A stage's handle on its downstream neighbour
///
/// Only a weak reference is kept: the chain executor owns every stage, and a
/// stage never keeps its neighbour alive.
pub struct Downstream {
    stage: String,
    target: Weak<dyn EventSink>,
    shutdown_sent: AtomicBool,
    shutdown_delivered: AtomicBool,
}

impl Downstream {
    pub fn new(stage: &str, target: Weak<dyn EventSink>) -> Self {
        Self {
            stage: stage.to_string(),
            target,
            shutdown_sent: AtomicBool::new(false),
            shutdown_delivered: AtomicBool::new(false),
        }
    }

    /// Forward an event; nothing may follow a forwarded shutdown
    pub fn send(&self, event: DeviceEvent) -> DevflowResult<()> {
        if self.shutdown_sent.load(Ordering::Acquire) {
            return Err(DevflowError::AfterShutdown {
                stage: self.stage.clone(),
            });
        }
        let target = self
            .target
            .upgrade()
            .ok_or_else(|| DevflowError::SinkDisconnected {
                stage: self.stage.clone(),
            })?;

        let is_shutdown = event.is_shutdown();
        if is_shutdown {
            self.shutdown_sent.store(true, Ordering::Release);
        }
        target.push(event)?;
        if is_shutdown {
            self.shutdown_delivered.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Shutdown was handed to the neighbour (successfully or not)
    pub fn shutdown_sent(&self) -> bool {
        self.shutdown_sent.load(Ordering::Acquire)
    }

    /// Shutdown was accepted by the neighbour
    pub fn shutdown_delivered(&self) -> bool {
        self.shutdown_delivered.load(Ordering::Acquire)
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }
}

/// What a filter sees of the chain while executing
pub struct FilterOutput<'a> {
    downstream: &'a Downstream,
    events: &'a EventFactory,
}

impl<'a> FilterOutput<'a> {
    pub fn new(downstream: &'a Downstream, events: &'a EventFactory) -> Self {
        Self { downstream, events }
    }

    /// Forward an event to the next stage
    pub fn send(&self, event: DeviceEvent) -> DevflowResult<()> {
        self.downstream.send(event)
    }

    /// Factory for new events and clones
    pub fn events(&self) -> &EventFactory {
        self.events
    }

    /// Name of the stage the filter runs in
    pub fn stage(&self) -> &str {
        self.downstream.stage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::CollectingSink;
    use devflow_core::EventKind;

    #[test]
    fn test_descriptor_defaults_to_asynchronous() {
        let descriptor = FilterDescriptor::new(Uuid::from_u128(1), "sample");
        assert_eq!(descriptor.scheduling, Scheduling::Asynchronous);
        assert!(!descriptor.feedback_receiver);

        let descriptor = descriptor.synchronous().receives_feedback();
        assert_eq!(descriptor.scheduling, Scheduling::Synchronous);
        assert!(descriptor.feedback_receiver);
    }

    #[test]
    fn test_nothing_follows_shutdown() {
        let events = EventFactory::new();
        let sink = Arc::new(CollectingSink::new());
        let target: Arc<dyn EventSink> = sink.clone();
        let downstream = Downstream::new("sample#0", Arc::downgrade(&target));

        downstream.send(events.information("first")).unwrap();
        downstream.send(events.shutdown()).unwrap();
        assert!(downstream.shutdown_delivered());

        let result = downstream.send(events.information("late"));
        assert!(matches!(result, Err(DevflowError::AfterShutdown { .. })));
        assert_eq!(sink.kinds(), vec![EventKind::Information, EventKind::ShutDown]);
    }

    #[test]
    fn test_vanished_downstream() {
        let events = EventFactory::new();
        let target: Arc<dyn EventSink> = Arc::new(CollectingSink::new());
        let downstream = Downstream::new("sample#0", Arc::downgrade(&target));
        drop(target);

        let result = downstream.send(events.information("nobody home"));
        assert!(matches!(result, Err(DevflowError::SinkDisconnected { .. })));
    }
}
