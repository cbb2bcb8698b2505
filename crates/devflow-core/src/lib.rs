//! devflow-core: device event model for the devflow pipeline
//!
//! Events, identifiers, device time, the logical clock and the declarative
//! chain configuration shared by every devflow crate.

pub mod configuration;
pub mod device_time;
pub mod error;
pub mod event;
pub mod ids;

pub use configuration::{
    ConfigError, FilterChainConfiguration, FilterLink, FilterParameter, ParameterValue,
};
pub use device_time::DeviceTime;
pub use error::{DevflowError, DevflowResult};
pub use event::{DeviceEvent, EventFactory, EventKind, EventParts, LogicalClock, Payload};
pub use ids::{SegmentId, SignalId};
