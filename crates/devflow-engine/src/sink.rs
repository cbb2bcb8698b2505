//! Terminal sinks a chain can deliver into

use crate::filter::EventSink;
use crossbeam_channel::Sender;
use devflow_core::{DeviceEvent, DevflowError, DevflowResult, EventKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Keeps every received event in arrival order
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<DeviceEvent>>,
    shutdown: Condvar,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Kinds of the received events, in order
    pub fn kinds(&self) -> Vec<EventKind> {
        self.lock().iter().map(DeviceEvent::kind).collect()
    }

    /// Levels of the received Level events, in order
    pub fn levels(&self) -> Vec<f64> {
        self.lock()
            .iter()
            .filter(|event| event.kind() == EventKind::Level)
            .filter_map(DeviceEvent::level)
            .collect()
    }

    pub fn count_of(&self, kind: EventKind) -> usize {
        self.lock().iter().filter(|event| event.kind() == kind).count()
    }

    /// Remove and return everything received so far
    pub fn take(&self) -> Vec<DeviceEvent> {
        std::mem::take(&mut *self.lock())
    }

    /// Block until a shutdown arrives; false on timeout
    pub fn wait_for_shutdown(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut events = self.lock();
        loop {
            if events.iter().any(DeviceEvent::is_shutdown) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            events = self
                .shutdown
                .wait_timeout(events, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<DeviceEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventSink for CollectingSink {
    fn push(&self, event: DeviceEvent) -> DevflowResult<()> {
        let is_shutdown = event.is_shutdown();
        self.lock().push(event);
        if is_shutdown {
            self.shutdown.notify_all();
        }
        Ok(())
    }
}

/// Forwards events into a channel, e.g. towards an async consumer
pub struct ChannelSink {
    sender: Sender<DeviceEvent>,
}

impl ChannelSink {
    pub fn new(sender: Sender<DeviceEvent>) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelSink {
    fn push(&self, event: DeviceEvent) -> DevflowResult<()> {
        self.sender
            .send(event)
            .map_err(|_| DevflowError::SinkDisconnected {
                stage: "channel sink".to_string(),
            })
    }
}

/// Counts and drops
#[derive(Debug, Default)]
pub struct NullSink {
    received: AtomicU64,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

impl EventSink for NullSink {
    fn push(&self, _event: DeviceEvent) -> DevflowResult<()> {
        self.received.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devflow_core::EventFactory;
    use std::sync::Arc;

    #[test]
    fn test_wait_for_shutdown() {
        let events = EventFactory::new();
        let sink = Arc::new(CollectingSink::new());
        assert!(!sink.wait_for_shutdown(Duration::from_millis(10)));

        let pusher = {
            let sink = sink.clone();
            let shutdown = events.shutdown();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                sink.push(shutdown).unwrap();
            })
        };
        assert!(sink.wait_for_shutdown(Duration::from_secs(5)));
        pusher.join().unwrap();
        assert_eq!(sink.take().len(), 1);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_channel_sink_disconnects() {
        let events = EventFactory::new();
        let (sender, receiver) = crossbeam_channel::unbounded();
        let sink = ChannelSink::new(sender);
        sink.push(events.information("a")).unwrap();
        assert_eq!(receiver.recv().unwrap().text(), Some("a"));

        drop(receiver);
        assert!(sink.push(events.information("b")).is_err());
    }
}
