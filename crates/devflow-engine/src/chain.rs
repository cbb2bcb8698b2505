//! Filter chain executor
//!
//! Builds one stage per configuration link, wires each stage to its
//! downstream neighbour and drives the whole chain through start, send and
//! stop. Stages are built from the last link to the first so every stage's
//! downstream exists before the stage itself.

use crate::config::EngineSettings;
use crate::executor::{AsyncExecutor, ExecutorStats, FilterExecutor, RegionLock, SyncExecutor};
use crate::filter::{EventSink, Scheduling, Services};
use crate::filters::FEEDBACK_NAME;
use crate::registry::FilterRegistry;
use devflow_core::{
    DeviceEvent, DevflowError, DevflowResult, FilterChainConfiguration, FilterLink,
};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tracing::{debug, error, info, warn};

/// Outcome of [`FilterChainExecutor::stop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStatus {
    /// The chain was shut down by this call
    Stopped,
    /// The chain was already stopped, or never had stages
    NothingToDo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainState {
    Built,
    Running,
    Stopped,
}

/// A built filter chain
///
/// Owns every stage. Stages only hold weak references to their downstream
/// neighbour, so dropping the executor releases the whole chain.
///
/// `send` holds the chain state shared for the whole push and `stop` takes
/// it exclusively, so an accepted event always enters the first stage ahead
/// of the shutdown sentinel.
pub struct FilterChainExecutor {
    stages: Vec<Arc<dyn FilterExecutor>>,
    sink: Arc<dyn EventSink>,
    services: Services,
    feedback_names: Vec<String>,
    state: RwLock<ChainState>,
}

impl FilterChainExecutor {
    /// Build a chain; all-or-nothing
    ///
    /// On failure every partially built stage is aborted, joined and
    /// dropped before the error is returned.
    pub fn build(
        configuration: &FilterChainConfiguration,
        registry: &FilterRegistry,
        services: &Services,
        settings: &EngineSettings,
        sink: Arc<dyn EventSink>,
    ) -> DevflowResult<Self> {
        settings.validate()?;
        info!(links = configuration.len(), "building filter chain");

        let mut stages: Vec<Arc<dyn FilterExecutor>> = Vec::with_capacity(configuration.len());
        let mut feedback_names = Vec::new();
        let result = Self::build_stages(
            configuration,
            registry,
            services,
            settings,
            &sink,
            &mut stages,
            &mut feedback_names,
        );

        if let Err(error) = result {
            error!(%error, built = stages.len(), "chain build failed; tearing down");
            for name in &feedback_names {
                services.feedback.unregister(name);
            }
            teardown(&stages);
            drop(stages);
            return Err(error);
        }

        stages.reverse();
        debug!(
            stages = ?stages.iter().map(|s| s.name().to_string()).collect::<Vec<_>>(),
            "filter chain built"
        );
        Ok(Self {
            stages,
            sink,
            services: services.clone(),
            feedback_names,
            state: RwLock::new(ChainState::Built),
        })
    }

    /// Stages are pushed last-first into `stages`
    fn build_stages(
        configuration: &FilterChainConfiguration,
        registry: &FilterRegistry,
        services: &Services,
        settings: &EngineSettings,
        sink: &Arc<dyn EventSink>,
        stages: &mut Vec<Arc<dyn FilterExecutor>>,
        feedback_names: &mut Vec<String>,
    ) -> DevflowResult<()> {
        let mut downstream: Weak<dyn EventSink> = Arc::downgrade(sink);
        let mut region: Option<Arc<RegionLock>> = None;
        let mut region_len = 0;

        for (index, link) in configuration.links.iter().enumerate().rev() {
            let (stage, as_sink) =
                Self::build_stage(index, link, registry, services, settings, downstream, &mut region)?;
            stages.push(stage.clone());

            match stage.descriptor().scheduling {
                Scheduling::Synchronous => {
                    region_len += 1;
                    settings.check_sync_region(region_len)?;
                }
                Scheduling::Asynchronous => region_len = 0,
            }

            if stage.descriptor().feedback_receiver {
                let name = link.require_str(FEEDBACK_NAME).map_err(|e| DevflowError::Configuration {
                    link: index,
                    filter: stage.descriptor().name.clone(),
                    errors: vec![e],
                })?;
                services.feedback.register(name, as_sink.clone())?;
                feedback_names.push(name.to_string());
            }
            downstream = as_sink;
        }
        Ok(())
    }

    fn build_stage(
        index: usize,
        link: &FilterLink,
        registry: &FilterRegistry,
        services: &Services,
        settings: &EngineSettings,
        downstream: Weak<dyn EventSink>,
        region: &mut Option<Arc<RegionLock>>,
    ) -> DevflowResult<(Arc<dyn FilterExecutor>, Weak<dyn EventSink>)> {
        let (descriptor, filter) = registry.resolve(index, &link.filter_id)?;
        let name = format!("{}#{}", descriptor.name, index);
        let filter_name = descriptor.name.clone();

        let (stage, as_sink) = match descriptor.scheduling {
            Scheduling::Synchronous => {
                let lock = region
                    .get_or_insert_with(|| Arc::new(RegionLock::new(settings.max_sync_depth)))
                    .clone();
                let executor = SyncExecutor::new(
                    name,
                    descriptor,
                    filter,
                    lock,
                    downstream,
                    services.events.clone(),
                );
                let stage: Arc<dyn FilterExecutor> = executor.clone();
                let as_sink: Arc<dyn EventSink> = executor;
                (stage, as_sink)
            }
            Scheduling::Asynchronous => {
                // Stages upstream of a queue form a new region
                *region = None;
                let executor = Arc::new(AsyncExecutor::new(
                    name,
                    descriptor,
                    filter,
                    settings.queue_capacity,
                    downstream,
                    services.events.clone(),
                ));
                let stage: Arc<dyn FilterExecutor> = executor.clone();
                let as_sink: Arc<dyn EventSink> = executor;
                (stage, as_sink)
            }
        };

        stage
            .configure(link, services)
            .map_err(|errors| DevflowError::Configuration {
                link: index,
                filter: filter_name,
                errors,
            })?;
        stage.prepare()?;
        debug!(stage = stage.name(), scheduling = ?stage.descriptor().scheduling, "stage built");

        Ok((stage, Arc::downgrade(&as_sink)))
    }

    /// Start every stage, first to last
    pub fn start(&self) -> DevflowResult<()> {
        let mut state = self.state_mut();
        if *state != ChainState::Built {
            warn!("start called on a chain that is not freshly built");
            return Err(DevflowError::ChainNotRunning);
        }
        for stage in &self.stages {
            if let Err(error) = stage.start() {
                error!(stage = stage.name(), %error, "stage failed to start; aborting chain");
                teardown(&self.stages);
                self.unregister_feedback();
                *state = ChainState::Stopped;
                return Err(error);
            }
        }
        *state = ChainState::Running;
        info!(stages = self.stages.len(), "filter chain started");
        Ok(())
    }

    /// Push an event into the first stage
    pub fn send(&self, event: DeviceEvent) -> DevflowResult<()> {
        let state = self.state();
        if *state != ChainState::Running {
            return Err(DevflowError::ChainNotRunning);
        }
        match self.stages.first() {
            Some(first) => first.push(event),
            None => self.sink.push(event),
        }
    }

    /// Shut the chain down and wait for every stage
    ///
    /// Always returns. Calling it again reports [`StopStatus::NothingToDo`].
    pub fn stop(&self) -> DevflowResult<StopStatus> {
        let mut state = self.state_mut();
        match *state {
            ChainState::Stopped => return Ok(StopStatus::NothingToDo),
            ChainState::Built => {
                teardown(&self.stages);
                self.unregister_feedback();
                *state = ChainState::Stopped;
                return Ok(if self.stages.is_empty() {
                    StopStatus::NothingToDo
                } else {
                    StopStatus::Stopped
                });
            }
            ChainState::Running => {}
        }
        *state = ChainState::Stopped;

        let Some(first) = self.stages.first() else {
            return Ok(StopStatus::NothingToDo);
        };

        info!("stopping filter chain");
        if let Err(error) = first.push(self.services.events.shutdown()) {
            let inline_delivered =
                first.descriptor().scheduling == Scheduling::Synchronous && first.shutdown_delivered();
            if inline_delivered {
                // The first stage failed on the sentinel but still passed it on
                warn!(%error, "first stage failed while handling shutdown");
            } else {
                let race = DevflowError::ShutdownRace {
                    reason: error.to_string(),
                };
                warn!(error = %race, "aborting every stage");
                for stage in &self.stages {
                    stage.abort();
                }
            }
        }

        let mut first_error = None;
        for (index, stage) in self.stages.iter().enumerate() {
            if let Err(error) = stage.join() {
                error!(stage = stage.name(), %error, "stage ended abnormally");
                first_error.get_or_insert(error);
            }
            let rest = &self.stages[index + 1..];
            if !stage.shutdown_delivered() && !rest.is_empty() {
                warn!(
                    stage = stage.name(),
                    "shutdown did not reach the next stage; aborting the rest of the chain"
                );
                for later in rest {
                    later.abort();
                }
            }
        }

        self.unregister_feedback();
        info!("filter chain stopped");
        match first_error {
            Some(error) => Err(error),
            None => Ok(StopStatus::Stopped),
        }
    }

    pub fn is_running(&self) -> bool {
        *self.state() == ChainState::Running
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage(&self, index: usize) -> Option<&Arc<dyn FilterExecutor>> {
        self.stages.get(index)
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name().to_string()).collect()
    }

    /// Per-stage counters, first to last
    pub fn stats(&self) -> Vec<(String, ExecutorStats)> {
        self.stages
            .iter()
            .map(|s| (s.name().to_string(), s.stats()))
            .collect()
    }

    fn state(&self) -> RwLockReadGuard<'_, ChainState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, ChainState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn unregister_feedback(&self) {
        for name in &self.feedback_names {
            self.services.feedback.unregister(name);
        }
    }
}

impl EventSink for FilterChainExecutor {
    fn push(&self, event: DeviceEvent) -> DevflowResult<()> {
        self.send(event)
    }
}

impl Drop for FilterChainExecutor {
    fn drop(&mut self) {
        if let Err(error) = self.stop() {
            warn!(%error, "chain did not stop cleanly");
        }
    }
}

/// Abort then join every stage, ignoring failures
fn teardown(stages: &[Arc<dyn FilterExecutor>]) {
    for stage in stages {
        stage.abort();
    }
    for stage in stages {
        if let Err(error) = stage.join() {
            warn!(stage = stage.name(), %error, "stage failed during teardown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::{DECOUPLER_ID, IDENTITY_ID};
    use crate::sink::CollectingSink;
    use devflow_core::EventKind;
    use std::time::Duration;

    fn build(links: &[uuid::Uuid], sink: Arc<CollectingSink>) -> DevflowResult<FilterChainExecutor> {
        let mut configuration = FilterChainConfiguration::new();
        for id in links {
            configuration.push(FilterLink::new(*id));
        }
        FilterChainExecutor::build(
            &configuration,
            &FilterRegistry::with_builtin(),
            &Services::new(),
            &EngineSettings::default(),
            sink,
        )
    }

    #[test]
    fn test_stage_names_follow_links() {
        let sink = Arc::new(CollectingSink::new());
        let chain = build(&[IDENTITY_ID, IDENTITY_ID, DECOUPLER_ID, IDENTITY_ID], sink).unwrap();
        assert_eq!(
            chain.stage_names(),
            vec!["identity#0", "identity#1", "decoupler#2", "identity#3"]
        );
    }

    #[test]
    fn test_send_requires_running() {
        let sink = Arc::new(CollectingSink::new());
        let chain = build(&[IDENTITY_ID], sink.clone()).unwrap();
        let events = Services::new().events;
        assert!(matches!(
            chain.send(events.information("early")),
            Err(DevflowError::ChainNotRunning)
        ));

        chain.start().unwrap();
        assert!(chain.start().is_err());
        chain.send(events.information("on time")).unwrap();
        assert_eq!(chain.stop().unwrap(), StopStatus::Stopped);
        assert_eq!(chain.stop().unwrap(), StopStatus::NothingToDo);
        assert!(chain.send(events.information("late")).is_err());
        assert_eq!(sink.kinds(), vec![EventKind::Information, EventKind::ShutDown]);
    }

    #[test]
    fn test_empty_chain_forwards_to_sink() {
        let sink = Arc::new(CollectingSink::new());
        let chain = build(&[], sink.clone()).unwrap();
        chain.start().unwrap();
        chain.send(Services::new().events.warning("direct")).unwrap();
        assert_eq!(chain.stop().unwrap(), StopStatus::NothingToDo);
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_dropping_a_running_chain_stops_it() {
        let sink = Arc::new(CollectingSink::new());
        let chain = build(&[DECOUPLER_ID, IDENTITY_ID], sink.clone()).unwrap();
        chain.start().unwrap();
        drop(chain);
        assert!(sink.wait_for_shutdown(Duration::from_secs(5)));
    }

    #[test]
    fn test_stop_of_never_started_chain() {
        let sink = Arc::new(CollectingSink::new());
        let chain = build(&[DECOUPLER_ID], sink.clone()).unwrap();
        assert_eq!(chain.stop().unwrap(), StopStatus::Stopped);
        assert!(chain.start().is_err());
        assert!(sink.is_empty());
    }
}
