//! devflow-engine: plugin-extensible event pipeline
//!
//! Chains of filters built from a declarative configuration, each stage run
//! either inline or on its own worker thread, with filter types supplied by
//! built-in or dynamically loaded modules.

pub mod chain;
pub mod config;
pub mod engine;
pub mod executor;
pub mod feedback;
pub mod filter;
pub mod filters;
pub mod plugin;
pub mod registry;
pub mod sink;

pub use chain::{FilterChainExecutor, StopStatus};
pub use config::{configuration_from_json, configuration_to_json, ChainFile, ChainFileEntry, EngineSettings};
pub use engine::Engine;
pub use executor::{AsyncExecutor, ExecutorState, ExecutorStats, FilterExecutor, RegionLock, SyncExecutor};
pub use feedback::FeedbackRegistry;
pub use filter::{Downstream, EventSink, Filter, FilterDescriptor, FilterOutput, Scheduling, Services};
pub use registry::{FilterModule, FilterRegistry, ModuleError};
pub use sink::{ChannelSink, CollectingSink, NullSink};
