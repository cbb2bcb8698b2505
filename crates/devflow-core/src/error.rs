//! Error handling for the devflow pipeline
//!
//! One error type is shared by every crate in the workspace so that failures
//! raised inside a filter, an executor or the chain builder can travel up the
//! call stack without conversion layers.

use crate::configuration::ConfigError;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for devflow operations
pub type DevflowResult<T> = Result<T, DevflowError>;

/// Error type for all devflow operations
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum DevflowError {
    /// An event could not be rebuilt from its raw parts
    #[error("Invalid source event: {reason}")]
    InvalidSource {
        /// What made the source unreadable
        reason: String,
    },

    /// Timestamp validation error
    #[error("Invalid timestamp: {reason}")]
    InvalidTimestamp {
        /// Description of timestamp issue
        reason: &'static str,
    },

    /// One link of a chain configuration failed to configure
    #[error("Link {link} ({filter}) rejected its configuration: {}", format_config_errors(.errors))]
    Configuration {
        /// Index of the link in the chain configuration
        link: usize,
        /// Name of the filter type the link targets
        filter: String,
        /// Every problem the filter found
        errors: Vec<ConfigError>,
    },

    /// No loaded module provides the requested filter type
    #[error("Link {link}: no module provides filter type {filter_id}")]
    UnknownFilter {
        /// Index of the link in the chain configuration
        link: usize,
        /// Filter type that could not be resolved
        filter_id: Uuid,
    },

    /// A module recognised the filter type but failed to create it
    #[error("Module '{module}' failed to create filter {filter_id}: {reason}")]
    FilterCreation {
        /// Module that recognised the type
        module: String,
        /// Requested filter type
        filter_id: Uuid,
        /// Module specific reason
        reason: String,
    },

    /// Two live feedback receivers claim the same name
    #[error("Feedback receiver name '{name}' is already registered")]
    DuplicateFeedback {
        /// Contested name
        name: String,
    },

    /// Engine settings are out of range
    #[error("Invalid engine settings: {reason}")]
    InvalidSettings {
        /// Description of the invalid setting
        reason: String,
    },

    /// A filter's execute call failed inside a stage
    #[error("Stage '{stage}' failed to execute event: {source}")]
    Execution {
        /// Stage that ran the filter
        stage: String,
        /// Error reported by the filter
        #[source]
        source: Box<DevflowError>,
    },

    /// Generic failure reported by a filter implementation
    #[error("Filter failed: {reason}")]
    FilterFailed {
        /// Filter specific reason
        reason: String,
    },

    /// A stage tried to forward an event after it already forwarded shutdown
    #[error("Stage '{stage}' already forwarded shutdown")]
    AfterShutdown {
        /// Offending stage
        stage: String,
    },

    /// The downstream neighbour of a stage no longer exists
    #[error("Downstream of stage '{stage}' is gone")]
    SinkDisconnected {
        /// Stage whose downstream vanished
        stage: String,
    },

    /// Synchronous forwarding nested deeper than allowed
    #[error("Synchronous nesting depth {depth} exceeds limit {max}")]
    NestingTooDeep {
        /// Depth that was requested
        depth: usize,
        /// Configured limit
        max: usize,
    },

    /// The queue of an asynchronous stage is closed
    #[error("Queue of stage '{stage}' is closed")]
    QueueClosed {
        /// Stage owning the queue
        stage: String,
    },

    /// A stage received work while not in a state to accept it
    #[error("Stage '{stage}' is not running (state: {state})")]
    StageNotRunning {
        /// Stage that rejected the event
        stage: String,
        /// State the stage was in
        state: String,
    },

    /// The chain executor is not running
    #[error("Filter chain is not running")]
    ChainNotRunning,

    /// A worker thread or queue could not be allocated
    #[error("Resource allocation failed for stage '{stage}': {reason}")]
    Resource {
        /// Stage that needed the resource
        stage: String,
        /// Allocation failure description
        reason: String,
    },

    /// A worker thread terminated by panicking
    #[error("Worker of stage '{stage}' panicked")]
    WorkerPanicked {
        /// Stage whose worker panicked
        stage: String,
    },

    /// The shutdown sentinel could not be injected into the chain
    #[error("Shutdown sentinel could not be injected: {reason}")]
    ShutdownRace {
        /// Why the injection failed
        reason: String,
    },

    /// A plugin library could not be loaded or used
    #[error("Plugin '{path}': {reason}")]
    Plugin {
        /// Library path
        path: String,
        /// Failure description
        reason: String,
    },

    /// An event source could not be set up or read
    #[error("Event source error: {reason}")]
    Source {
        /// Failure description
        reason: String,
    },
}

impl DevflowError {
    /// Build a filter failure from any displayable reason
    pub fn filter_failed(reason: impl Into<String>) -> Self {
        DevflowError::FilterFailed { reason: reason.into() }
    }

    /// Errors raised while building a chain
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            DevflowError::Configuration { .. }
                | DevflowError::UnknownFilter { .. }
                | DevflowError::FilterCreation { .. }
                | DevflowError::DuplicateFeedback { .. }
                | DevflowError::InvalidSettings { .. }
        )
    }

    /// Errors raised by a single event's execution
    pub fn is_execution(&self) -> bool {
        matches!(
            self,
            DevflowError::Execution { .. }
                | DevflowError::FilterFailed { .. }
                | DevflowError::AfterShutdown { .. }
                | DevflowError::SinkDisconnected { .. }
                | DevflowError::NestingTooDeep { .. }
        )
    }
}

fn format_config_errors(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = DevflowError::NestingTooDeep { depth: 65, max: 64 };
        let display = format!("{}", error);
        assert!(display.contains("nesting depth"));
        assert!(display.contains("65"));
        assert!(display.contains("64"));
    }

    #[test]
    fn test_configuration_error_lists_every_problem() {
        let error = DevflowError::Configuration {
            link: 2,
            filter: "masking".to_string(),
            errors: vec![
                ConfigError::missing("signal"),
                ConfigError::invalid("bitmask", "must not be empty"),
            ],
        };
        let display = error.to_string();
        assert!(display.contains("Link 2"));
        assert!(display.contains("signal"));
        assert!(display.contains("bitmask"));
        assert!(error.is_configuration());
        assert!(!error.is_execution());
    }

    #[test]
    fn test_execution_error_keeps_source() {
        let error = DevflowError::Execution {
            stage: "mapping".to_string(),
            source: Box::new(DevflowError::filter_failed("bad level")),
        };
        assert!(error.is_execution());
        let source = std::error::Error::source(&error).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("Filter failed: bad level"));
    }

    #[test]
    fn test_error_equality() {
        let error1 = DevflowError::QueueClosed { stage: "a".into() };
        let error2 = DevflowError::QueueClosed { stage: "a".into() };
        assert_eq!(error1, error2);
    }
}
