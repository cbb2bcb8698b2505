//! Inline stage executor

use super::{
    complete_shutdown, execute_guarded, normalize_config_errors, not_running, report_failure,
    ExecutorState, ExecutorStats, FilterExecutor, RegionLock, StageCounters, StateCell,
};
use crate::filter::{Downstream, EventSink, Filter, FilterDescriptor, FilterOutput, Services};
use crossbeam_channel::{unbounded, Receiver, Sender};
use devflow_core::{ConfigError, DeviceEvent, DevflowError, DevflowResult, EventFactory, FilterLink};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

/// Runs its filter on the pushing thread
///
/// Every synchronous stage of a contiguous region shares one [`RegionLock`],
/// so at most one thread executes inside the region at a time. An event that
/// comes back into a stage whose filter is already executing on the same
/// thread (a feedback loop) is queued and handled once the running execute
/// call returns.
///
/// A feedback receiver also owns a pump thread. Events offered from outside
/// the region (a loop that crosses a queue) go through the pump, which waits
/// for the region instead of the offering thread.
pub struct SyncExecutor {
    name: String,
    descriptor: FilterDescriptor,
    filter: Mutex<Box<dyn Filter>>,
    deferred: Mutex<VecDeque<DeviceEvent>>,
    region: Arc<RegionLock>,
    downstream: Downstream,
    events: Arc<EventFactory>,
    state: StateCell,
    counters: StageCounters,
    pump: Mutex<Option<Sender<DeviceEvent>>>,
    pump_worker: Mutex<Option<JoinHandle<()>>>,
    me: Weak<SyncExecutor>,
}

impl SyncExecutor {
    pub fn new(
        name: String,
        descriptor: FilterDescriptor,
        filter: Box<dyn Filter>,
        region: Arc<RegionLock>,
        downstream: Weak<dyn EventSink>,
        events: Arc<EventFactory>,
    ) -> Arc<Self> {
        let downstream = Downstream::new(&name, downstream);
        Arc::new_cyclic(|me| Self {
            name,
            descriptor,
            filter: Mutex::new(filter),
            deferred: Mutex::new(VecDeque::new()),
            region,
            downstream,
            events,
            state: StateCell::new(),
            counters: StageCounters::default(),
            pump: Mutex::new(None),
            pump_worker: Mutex::new(None),
            me: me.clone(),
        })
    }

    /// Region this stage serializes on
    pub fn region(&self) -> &Arc<RegionLock> {
        &self.region
    }

    fn ensure_running(&self) -> DevflowResult<()> {
        let state = self.state.load();
        if state != ExecutorState::Running {
            return Err(not_running(&self.name, state));
        }
        Ok(())
    }

    fn execute_one(&self, filter: &mut dyn Filter, event: DeviceEvent) -> DevflowResult<()> {
        let is_shutdown = event.is_shutdown();
        if is_shutdown {
            self.state.advance(ExecutorState::ShuttingDown);
        }

        let output = FilterOutput::new(&self.downstream, &self.events);
        let result = execute_guarded(filter, event, &output);
        self.counters.record(&result);

        if is_shutdown {
            complete_shutdown(&self.downstream, &self.events);
            self.state.advance(ExecutorState::Terminated);
        }

        result.map_err(|source| {
            warn!(stage = %self.name, error = %source, "filter failed");
            DevflowError::Execution {
                stage: self.name.clone(),
                source: Box::new(source),
            }
        })
    }

    fn deferred(&self) -> MutexGuard<'_, VecDeque<DeviceEvent>> {
        self.deferred.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run events queued by re-entry, reporting failures downstream
    fn drain_deferred(&self, filter: &mut dyn Filter) {
        loop {
            let Some(event) = self.deferred().pop_front() else {
                break;
            };
            if self.state.load() == ExecutorState::Terminated {
                warn!(stage = %self.name, kind = %event.kind(), "dropping event deferred behind shutdown");
                continue;
            }
            let segment_id = event.segment_id;
            let signal_id = event.signal_id;
            if let Err(error) = self.execute_one(filter, event) {
                report_failure(&self.downstream, &self.events, &error, segment_id, signal_id);
            }
        }
    }

    fn spawn_pump(&self) -> DevflowResult<()> {
        let (sender, inbox) = unbounded();
        let stage = self.me.clone();
        let handle = thread::Builder::new()
            .name(format!("devflow-{}-feedback", self.name))
            .spawn(move || run_pump(stage, inbox))
            .map_err(|e| DevflowError::Resource {
                stage: self.name.clone(),
                reason: e.to_string(),
            })?;
        *self.pump.lock().unwrap_or_else(PoisonError::into_inner) = Some(sender);
        *self.pump_worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        debug!(stage = %self.name, "feedback pump spawned");
        Ok(())
    }

    fn close_pump(&self) -> Option<JoinHandle<()>> {
        self.pump.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.pump_worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl EventSink for SyncExecutor {
    fn push(&self, event: DeviceEvent) -> DevflowResult<()> {
        self.ensure_running()?;

        let region = self.region.lock()?;
        let mut filter = match self.filter.try_lock() {
            Ok(filter) => filter,
            Err(TryLockError::WouldBlock) => {
                // Re-entry from our own execute call on this thread
                trace!(stage = %self.name, "deferring re-entrant event");
                self.deferred().push_back(event);
                return Ok(());
            }
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let result = self.execute_one(&mut **filter, event);
        self.drain_deferred(&mut **filter);
        drop(filter);
        drop(region);
        result
    }

    fn offer(&self, event: DeviceEvent) -> DevflowResult<()> {
        self.ensure_running()?;
        if self.region.is_held_by_current_thread() {
            return self.push(event);
        }
        let pump = self.pump.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match pump {
            Some(pump) => pump.send(event).map_err(|_| DevflowError::QueueClosed {
                stage: self.name.clone(),
            }),
            None => self.push(event),
        }
    }
}

impl FilterExecutor for SyncExecutor {
    fn descriptor(&self) -> &FilterDescriptor {
        &self.descriptor
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ExecutorState {
        self.state.load()
    }

    fn stats(&self) -> ExecutorStats {
        self.counters.snapshot()
    }

    fn configure(&self, link: &FilterLink, services: &Services) -> Result<(), Vec<ConfigError>> {
        let state = self.state.load();
        if state != ExecutorState::Constructed {
            return Err(vec![ConfigError::general(format!(
                "stage cannot be configured while {}",
                state
            ))]);
        }
        let mut filter = self.filter.lock().unwrap_or_else(PoisonError::into_inner);
        normalize_config_errors(filter.configure(link, services))?;
        self.state.store(ExecutorState::Configured);
        Ok(())
    }

    fn prepare(&self) -> DevflowResult<()> {
        if self.descriptor.feedback_receiver {
            self.spawn_pump()?;
        }
        Ok(())
    }

    fn start(&self) -> DevflowResult<()> {
        if self
            .state
            .transition(ExecutorState::Configured, ExecutorState::Running)
        {
            Ok(())
        } else {
            Err(not_running(&self.name, self.state.load()))
        }
    }

    fn abort(&self) {
        self.state.advance(ExecutorState::Terminated);
        self.pump.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.deferred().clear();
    }

    fn join(&self) -> DevflowResult<()> {
        self.state.advance(ExecutorState::Terminated);
        match self.close_pump() {
            Some(handle) if handle.thread().id() != thread::current().id() => {
                handle.join().map_err(|_| DevflowError::WorkerPanicked {
                    stage: self.name.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    fn shutdown_delivered(&self) -> bool {
        self.downstream.shutdown_delivered()
    }
}

/// Push offered events into the stage, waiting for its region like a producer
fn run_pump(stage: Weak<SyncExecutor>, inbox: Receiver<DeviceEvent>) {
    for event in inbox.iter() {
        let Some(stage) = stage.upgrade() else {
            break;
        };
        if let Err(error) = stage.push(event) {
            debug!(stage = %stage.name, %error, "fed back event not delivered");
        }
    }
}
