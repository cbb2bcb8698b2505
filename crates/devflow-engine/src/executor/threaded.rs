//! Worker-thread stage executor

use super::{
    complete_shutdown, execute_guarded, normalize_config_errors, not_running, report_failure,
    ExecutorState, ExecutorStats, FilterExecutor, StageCounters, StateCell,
};
use crate::filter::{Downstream, EventSink, Filter, FilterDescriptor, FilterOutput, Services};
use crossbeam_channel::{bounded, never, select, unbounded, Receiver, Sender};
use devflow_core::{ConfigError, DeviceEvent, DevflowError, DevflowResult, EventFactory, FilterLink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

/// State shared between the executor handle and its worker
struct WorkerShared {
    name: String,
    state: StateCell,
    counters: StageCounters,
    abort: AtomicBool,
    downstream: Downstream,
    events: Arc<EventFactory>,
}

/// Filter and queue ends waiting for the worker to be spawned
struct Pending {
    filter: Box<dyn Filter>,
    receiver: Receiver<DeviceEvent>,
    feedback: Receiver<DeviceEvent>,
}

/// Runs its filter on a dedicated thread behind a bounded FIFO
///
/// Pushing into a full queue blocks the producer until the worker makes
/// room. The worker is spawned when the chain is built and parked until
/// [`FilterExecutor::start`] opens its gate. It is the only owner of the
/// receiving end, so once it exits every blocked or later producer gets
/// [`DevflowError::QueueClosed`] instead of hanging.
///
/// Offered feedback events bypass the bounded queue through an unbounded
/// side channel, so a stage further down never waits on this one.
pub struct AsyncExecutor {
    descriptor: FilterDescriptor,
    capacity: usize,
    shared: Arc<WorkerShared>,
    pending: Mutex<Option<Pending>>,
    sender: RwLock<Option<Sender<DeviceEvent>>>,
    feedback: RwLock<Option<Sender<DeviceEvent>>>,
    gate: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncExecutor {
    pub fn new(
        name: String,
        descriptor: FilterDescriptor,
        filter: Box<dyn Filter>,
        capacity: usize,
        downstream: Weak<dyn EventSink>,
        events: Arc<EventFactory>,
    ) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = bounded(capacity);
        let (feedback_sender, feedback) = unbounded();
        let downstream = Downstream::new(&name, downstream);
        Self {
            descriptor,
            capacity,
            shared: Arc::new(WorkerShared {
                name,
                state: StateCell::new(),
                counters: StageCounters::default(),
                abort: AtomicBool::new(false),
                downstream,
                events,
            }),
            pending: Mutex::new(Some(Pending {
                filter,
                receiver,
                feedback,
            })),
            sender: RwLock::new(Some(sender)),
            feedback: RwLock::new(Some(feedback_sender)),
            gate: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events currently waiting in the queue
    pub fn queued(&self) -> usize {
        self.sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, Sender::len)
    }

    fn close_queue(&self) {
        self.sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.feedback
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn accepting(&self) -> DevflowResult<()> {
        let state = self.shared.state.load();
        if matches!(state, ExecutorState::Constructed | ExecutorState::Terminated) {
            return Err(not_running(&self.shared.name, state));
        }
        Ok(())
    }

    fn queue_closed(&self) -> DevflowError {
        DevflowError::QueueClosed {
            stage: self.shared.name.clone(),
        }
    }
}

impl EventSink for AsyncExecutor {
    fn push(&self, event: DeviceEvent) -> DevflowResult<()> {
        self.accepting()?;

        // Clone the sender so a blocked producer never holds the lock
        let sender = self
            .sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| self.queue_closed())?;
        sender.send(event).map_err(|_| self.queue_closed())
    }

    fn offer(&self, event: DeviceEvent) -> DevflowResult<()> {
        self.accepting()?;
        let feedback = self.feedback.read().unwrap_or_else(PoisonError::into_inner);
        match feedback.as_ref() {
            Some(sender) => sender.send(event).map_err(|_| self.queue_closed()),
            None => Err(self.queue_closed()),
        }
    }
}

impl FilterExecutor for AsyncExecutor {
    fn descriptor(&self) -> &FilterDescriptor {
        &self.descriptor
    }

    fn name(&self) -> &str {
        &self.shared.name
    }

    fn state(&self) -> ExecutorState {
        self.shared.state.load()
    }

    fn stats(&self) -> ExecutorStats {
        self.shared.counters.snapshot()
    }

    fn configure(&self, link: &FilterLink, services: &Services) -> Result<(), Vec<ConfigError>> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let pending = pending
            .as_mut()
            .ok_or_else(|| vec![ConfigError::general("worker already spawned")])?;
        normalize_config_errors(pending.filter.configure(link, services))?;
        self.shared.state.store(ExecutorState::Configured);
        Ok(())
    }

    fn prepare(&self) -> DevflowResult<()> {
        let Pending {
            filter,
            receiver,
            feedback,
        } = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| DevflowError::Resource {
                stage: self.shared.name.clone(),
                reason: "worker already spawned".to_string(),
            })?;

        let (gate_sender, gate_receiver) = bounded(1);
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(format!("devflow-{}", self.shared.name))
            .spawn(move || run_worker(shared, filter, receiver, feedback, gate_receiver))
            .map_err(|e| DevflowError::Resource {
                stage: self.shared.name.clone(),
                reason: e.to_string(),
            })?;

        *self.gate.lock().unwrap_or_else(PoisonError::into_inner) = Some(gate_sender);
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        debug!(stage = %self.shared.name, capacity = self.capacity, "worker spawned");
        Ok(())
    }

    fn start(&self) -> DevflowResult<()> {
        if !self
            .shared
            .state
            .transition(ExecutorState::Configured, ExecutorState::Running)
        {
            return Err(not_running(&self.shared.name, self.shared.state.load()));
        }
        let gate = self
            .gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match gate {
            Some(gate) if gate.send(()).is_ok() => Ok(()),
            _ => Err(DevflowError::WorkerPanicked {
                stage: self.shared.name.clone(),
            }),
        }
    }

    fn abort(&self) {
        self.shared.abort.store(true, Ordering::Release);
        self.shared.state.advance(ExecutorState::ShuttingDown);
        // A worker that never started sees its gate close and exits
        self.gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.close_queue();
    }

    fn join(&self) -> DevflowResult<()> {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let result = match handle {
            Some(handle) => handle.join().map_err(|_| DevflowError::WorkerPanicked {
                stage: self.shared.name.clone(),
            }),
            None => Ok(()),
        };
        self.close_queue();
        self.shared.state.advance(ExecutorState::Terminated);
        result
    }

    fn shutdown_delivered(&self) -> bool {
        self.shared.downstream.shutdown_delivered()
    }
}

impl Drop for AsyncExecutor {
    fn drop(&mut self) {
        let running = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        if running {
            self.abort();
            if let Err(error) = self.join() {
                warn!(%error, "worker ended abnormally");
            }
        }
    }
}

fn run_worker(
    shared: Arc<WorkerShared>,
    mut filter: Box<dyn Filter>,
    receiver: Receiver<DeviceEvent>,
    mut feedback: Receiver<DeviceEvent>,
    gate: Receiver<()>,
) {
    if gate.recv().is_err() {
        debug!(stage = %shared.name, "worker released before start");
        shared.state.advance(ExecutorState::Terminated);
        return;
    }

    let output = FilterOutput::new(&shared.downstream, &shared.events);
    loop {
        let (message, fed_back) = select! {
            recv(receiver) -> message => (message, false),
            recv(feedback) -> message => (message, true),
        };
        let event = match message {
            Ok(event) => event,
            Err(_) if fed_back => {
                feedback = never();
                continue;
            }
            Err(_) => break,
        };
        if shared.abort.load(Ordering::Acquire) {
            debug!(stage = %shared.name, "worker aborted");
            break;
        }

        let is_shutdown = event.is_shutdown();
        if is_shutdown {
            shared.state.advance(ExecutorState::ShuttingDown);
        }
        let kind = event.kind();
        let segment_id = event.segment_id;
        let signal_id = event.signal_id;

        let result = execute_guarded(filter.as_mut(), event, &output);
        shared.counters.record(&result);
        if let Err(failure) = result {
            // Report and keep going
            error!(stage = %shared.name, %kind, error = %failure, "filter failed");
            report_failure(&shared.downstream, &shared.events, &failure, segment_id, signal_id);
        }

        if is_shutdown {
            complete_shutdown(&shared.downstream, &shared.events);
            break;
        }
    }

    let discarded = receiver.try_iter().count() + feedback.try_iter().count();
    if discarded > 0 {
        warn!(stage = %shared.name, discarded, "events left in the queue were discarded");
    }
    drop(receiver);
    drop(filter);
    shared.state.advance(ExecutorState::Terminated);
    debug!(stage = %shared.name, "worker exited");
}
