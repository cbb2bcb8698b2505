//! Engine: the services every chain of one process shares

use crate::chain::FilterChainExecutor;
use crate::config::EngineSettings;
use crate::feedback::FeedbackRegistry;
use crate::filter::{EventSink, Services};
use crate::registry::FilterRegistry;
use devflow_core::{DevflowResult, EventFactory, FilterChainConfiguration};
use std::sync::Arc;
use tracing::info;

/// Event factory, filter registry, feedback registry and settings
///
/// Built once at startup and passed around by reference; every chain built
/// from one engine shares its logical clock and feedback names.
pub struct Engine {
    settings: EngineSettings,
    registry: Arc<FilterRegistry>,
    services: Services,
}

impl Engine {
    /// Engine with the built-in filters registered
    pub fn new(settings: EngineSettings) -> DevflowResult<Self> {
        Self::with_registry(settings, Arc::new(FilterRegistry::with_builtin()))
    }

    pub fn with_registry(settings: EngineSettings, registry: Arc<FilterRegistry>) -> DevflowResult<Self> {
        settings.validate()?;
        info!(
            queue_capacity = settings.queue_capacity,
            max_sync_depth = settings.max_sync_depth,
            modules = ?registry.module_names(),
            "engine created"
        );
        Ok(Self {
            settings,
            registry,
            services: Services {
                events: Arc::new(EventFactory::new()),
                feedback: Arc::new(FeedbackRegistry::new()),
            },
        })
    }

    /// Load the plugins of `settings.plugin_dir`, if one is set
    ///
    /// # Safety
    ///
    /// See [`FilterRegistry::load_directory`].
    pub unsafe fn load_plugins(&self) -> DevflowResult<usize> {
        match &self.settings.plugin_dir {
            // SAFETY: forwarded from the caller
            Some(dir) => unsafe { self.registry.load_directory(dir) },
            None => Ok(0),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<FilterRegistry> {
        &self.registry
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn events(&self) -> &Arc<EventFactory> {
        &self.services.events
    }

    pub fn feedback(&self) -> &Arc<FeedbackRegistry> {
        &self.services.feedback
    }

    /// Build a chain delivering into `sink`
    pub fn build_chain(
        &self,
        configuration: &FilterChainConfiguration,
        sink: Arc<dyn EventSink>,
    ) -> DevflowResult<FilterChainExecutor> {
        FilterChainExecutor::build(
            configuration,
            &self.registry,
            &self.services,
            &self.settings,
            sink,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::{FEEDBACK_NAME, FEEDBACK_RECEIVER_ID, IDENTITY_ID};
    use crate::sink::NullSink;
    use devflow_core::{DevflowError, FilterLink};

    #[test]
    fn test_invalid_settings_rejected() {
        let settings = EngineSettings {
            queue_capacity: 0,
            ..EngineSettings::default()
        };
        assert!(matches!(
            Engine::new(settings),
            Err(DevflowError::InvalidSettings { .. })
        ));
    }

    #[test]
    fn test_no_plugin_dir_loads_nothing() {
        let engine = Engine::new(EngineSettings::default()).unwrap();
        // SAFETY: no directory configured, nothing is loaded
        assert_eq!(unsafe { engine.load_plugins() }.unwrap(), 0);
    }

    #[test]
    fn test_feedback_names_shared_across_chains() {
        let engine = Engine::new(EngineSettings::default()).unwrap();
        let mut configuration = FilterChainConfiguration::new();
        configuration
            .push(FilterLink::new(FEEDBACK_RECEIVER_ID).with(FEEDBACK_NAME, "loop"))
            .push(FilterLink::new(IDENTITY_ID));

        let first = engine
            .build_chain(&configuration, Arc::new(NullSink::new()))
            .unwrap();
        assert!(engine.feedback().lookup("loop").is_some());

        let second = engine.build_chain(&configuration, Arc::new(NullSink::new()));
        assert!(matches!(second, Err(DevflowError::DuplicateFeedback { .. })));

        drop(first);
        assert!(engine.feedback().lookup("loop").is_none());
        assert!(engine
            .build_chain(&configuration, Arc::new(NullSink::new()))
            .is_ok());
    }
}
