//! Stage executors: how one filter of a chain is driven
//!
//! A synchronous stage runs its filter inline on the thread that pushed the
//! event. An asynchronous stage owns a worker thread fed by a bounded queue.
//! Both honour the same lifecycle and shutdown guarantees, so the chain
//! executor treats them uniformly through [`FilterExecutor`].

mod region;
mod sync;
mod threaded;

pub use region::{RegionGuard, RegionLock};
pub use sync::SyncExecutor;
pub use threaded::AsyncExecutor;

use crate::filter::{Downstream, EventSink, Filter, FilterDescriptor, FilterOutput, Services};
use devflow_core::{
    ConfigError, DeviceEvent, DevflowError, DevflowResult, EventFactory, FilterLink, SegmentId, SignalId,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use tracing::warn;

/// Lifecycle of one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ExecutorState {
    Constructed = 0,
    Configured = 1,
    Running = 2,
    ShuttingDown = 3,
    Terminated = 4,
}

impl ExecutorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ExecutorState::Constructed,
            1 => ExecutorState::Configured,
            2 => ExecutorState::Running,
            3 => ExecutorState::ShuttingDown,
            _ => ExecutorState::Terminated,
        }
    }
}

impl fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutorState::Constructed => "constructed",
            ExecutorState::Configured => "configured",
            ExecutorState::Running => "running",
            ExecutorState::ShuttingDown => "shutting down",
            ExecutorState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Atomically updated stage state
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ExecutorState::Constructed as u8))
    }

    pub(crate) fn load(&self) -> ExecutorState {
        ExecutorState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, state: ExecutorState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move from `from` to `to`; false if the stage was elsewhere
    pub(crate) fn transition(&self, from: ExecutorState, to: ExecutorState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move forward to `to` unless already at or past it
    pub(crate) fn advance(&self, to: ExecutorState) {
        self.0.fetch_max(to as u8, Ordering::AcqRel);
    }
}

/// Snapshot of a stage's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorStats {
    /// Execute calls that returned success
    pub processed: u64,
    /// Execute calls that failed or panicked
    pub failed: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StageCounters {
    processed: AtomicU64,
    failed: AtomicU64,
}

impl StageCounters {
    pub(crate) fn record<T>(&self, result: &DevflowResult<T>) {
        let counter = if result.is_ok() {
            &self.processed
        } else {
            &self.failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ExecutorStats {
        ExecutorStats {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// One stage of a running chain
pub trait FilterExecutor: EventSink {
    fn descriptor(&self) -> &FilterDescriptor;

    /// Stage name, `<filter name>#<link index>`
    fn name(&self) -> &str;

    fn state(&self) -> ExecutorState;

    fn stats(&self) -> ExecutorStats;

    /// Forward a link's parameters to the filter
    fn configure(&self, link: &FilterLink, services: &Services) -> Result<(), Vec<ConfigError>>;

    /// Acquire execution resources; called once at build time
    fn prepare(&self) -> DevflowResult<()> {
        Ok(())
    }

    /// Begin accepting events
    fn start(&self) -> DevflowResult<()>;

    /// Stop as soon as possible, discarding queued events
    fn abort(&self);

    /// Wait for the stage to finish
    fn join(&self) -> DevflowResult<()>;

    /// Whether this stage handed the shutdown sentinel downstream
    fn shutdown_delivered(&self) -> bool;
}

/// Run one execute call, turning a panic into a filter failure
pub(crate) fn execute_guarded(
    filter: &mut dyn Filter,
    event: DeviceEvent,
    output: &FilterOutput<'_>,
) -> DevflowResult<()> {
    match panic::catch_unwind(AssertUnwindSafe(|| filter.execute(event, output))) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(DevflowError::filter_failed(format!("filter panicked: {}", message)))
        }
    }
}

/// Forward a fresh sentinel if the filter swallowed the one it was given
pub(crate) fn complete_shutdown(downstream: &Downstream, events: &EventFactory) {
    if downstream.shutdown_sent() {
        return;
    }
    warn!(
        stage = downstream.stage(),
        "filter did not forward shutdown; sending a fresh sentinel"
    );
    if let Err(error) = downstream.send(events.shutdown()) {
        warn!(stage = downstream.stage(), %error, "shutdown could not be forwarded");
    }
}

/// Report a failure nobody returns to a caller as an `Error` event
///
/// The report carries the segment and signal of the event that failed.
/// Nothing is sent once the stage has forwarded its shutdown sentinel.
pub(crate) fn report_failure(
    downstream: &Downstream,
    events: &EventFactory,
    failure: &DevflowError,
    segment_id: SegmentId,
    signal_id: SignalId,
) {
    if downstream.shutdown_sent() {
        return;
    }
    let mut report = events.error(format!("{}: {}", downstream.stage(), failure));
    report.segment_id = segment_id;
    report.signal_id = signal_id;
    if let Err(error) = downstream.send(report) {
        warn!(stage = downstream.stage(), %error, "failure report not delivered");
    }
}

fn not_running(stage: &str, state: ExecutorState) -> DevflowError {
    DevflowError::StageNotRunning {
        stage: stage.to_string(),
        state: state.to_string(),
    }
}

/// Make sure a filter's rejection always carries at least one problem
fn normalize_config_errors(result: Result<(), Vec<ConfigError>>) -> Result<(), Vec<ConfigError>> {
    result.map_err(|errors| {
        if errors.is_empty() {
            vec![ConfigError::general("configuration rejected")]
        } else {
            errors
        }
    })
}
