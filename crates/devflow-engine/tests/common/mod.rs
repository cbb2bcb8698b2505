//! Shared test filters and helpers

#![allow(dead_code)] // Not every scenario file uses every helper

use devflow_core::{
    ConfigError, DeviceEvent, DeviceTime, DevflowError, DevflowResult, EventKind, FilterLink,
    SegmentId, SignalId,
};
use devflow_engine::{
    EngineSettings, Filter, FilterDescriptor, FilterModule, FilterOutput, FilterRegistry,
    ModuleError, Services,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const COUNTING_SYNC: Uuid = Uuid::from_u128(0x7e57_0001);
pub const COUNTING_ASYNC: Uuid = Uuid::from_u128(0x7e57_0002);
pub const SLOW: Uuid = Uuid::from_u128(0x7e57_0003);
pub const EXPLODING: Uuid = Uuid::from_u128(0x7e57_0004);
pub const REJECTING: Uuid = Uuid::from_u128(0x7e57_0005);
pub const UNREGISTERED: Uuid = Uuid::from_u128(0x7e57_ffff);

pub const GLUCOSE: SignalId = SignalId::from_u128(0x61c0);

/// Constructor and destructor counts of every filter the module created
#[derive(Default)]
pub struct Lifecycle {
    pub created: AtomicUsize,
    pub dropped: AtomicUsize,
}

impl Lifecycle {
    pub fn alive(&self) -> usize {
        self.created.load(Ordering::SeqCst) - self.dropped.load(Ordering::SeqCst)
    }
}

/// Forwards everything, optionally after a delay or failing on text events
struct TestFilter {
    lifecycle: Arc<Lifecycle>,
    delay: Option<Duration>,
    explode_on_text: bool,
    reject_configuration: bool,
}

impl Filter for TestFilter {
    fn configure(&mut self, _link: &FilterLink, _services: &Services) -> Result<(), Vec<ConfigError>> {
        if self.reject_configuration {
            return Err(vec![
                ConfigError::missing("threshold"),
                ConfigError::invalid("window", "must be positive"),
            ]);
        }
        Ok(())
    }

    fn execute(&mut self, event: DeviceEvent, output: &FilterOutput<'_>) -> DevflowResult<()> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.explode_on_text && event.kind() == EventKind::Information {
            return Err(DevflowError::filter_failed("refusing information events"));
        }
        output.send(event)
    }
}

impl Drop for TestFilter {
    fn drop(&mut self) {
        self.lifecycle.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Module providing the test filters
pub struct TestModule {
    pub lifecycle: Arc<Lifecycle>,
    pub slow_delay: Duration,
}

impl TestModule {
    pub fn new() -> Self {
        Self {
            lifecycle: Arc::new(Lifecycle::default()),
            slow_delay: Duration::from_millis(10),
        }
    }
}

impl FilterModule for TestModule {
    fn name(&self) -> &str {
        "test"
    }

    fn descriptors(&self) -> Vec<FilterDescriptor> {
        vec![
            FilterDescriptor::new(COUNTING_SYNC, "counting sync").synchronous(),
            FilterDescriptor::new(COUNTING_ASYNC, "counting async"),
            FilterDescriptor::new(SLOW, "slow"),
            FilterDescriptor::new(EXPLODING, "exploding"),
            FilterDescriptor::new(REJECTING, "rejecting").synchronous(),
        ]
    }

    fn create_filter(&self, filter_id: &Uuid) -> Result<Box<dyn Filter>, ModuleError> {
        let (delay, explode_on_text, reject_configuration) = match *filter_id {
            COUNTING_SYNC | COUNTING_ASYNC => (None, false, false),
            SLOW => (Some(self.slow_delay), false, false),
            EXPLODING => (None, true, false),
            REJECTING => (None, false, true),
            _ => return Err(ModuleError::NotImplemented),
        };
        self.lifecycle.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(TestFilter {
            lifecycle: self.lifecycle.clone(),
            delay,
            explode_on_text,
            reject_configuration,
        }))
    }
}

/// Registry with the built-in filters followed by the test module
pub fn registry() -> (FilterRegistry, Arc<Lifecycle>) {
    let module = TestModule::new();
    let lifecycle = module.lifecycle.clone();
    let registry = FilterRegistry::with_builtin();
    registry.register(Arc::new(module));
    (registry, lifecycle)
}

pub fn settings(queue_capacity: usize) -> EngineSettings {
    EngineSettings {
        queue_capacity,
        ..EngineSettings::default()
    }
}

pub fn level(services: &Services, segment: u64, value: f64) -> DeviceEvent {
    services.events.level(
        GLUCOSE,
        SegmentId(segment),
        DeviceTime::from_days(45_000.0 + value * DeviceTime::ONE_MINUTE),
        value,
    )
}
