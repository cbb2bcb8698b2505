//! Built-in structural filters
//!
//! Plumbing filters every installation has without loading plugins:
//! pass-through stages, signal id rewriting, level masking and the two ends
//! of a feedback loop.

pub mod feedback;
pub mod identity;
pub mod mapping;
pub mod masking;

pub use feedback::{FeedbackReceiver, FeedbackSender};
pub use identity::{Decoupler, Identity};
pub use mapping::SignalMapping;
pub use masking::Masking;

use crate::filter::{Filter, FilterDescriptor};
use crate::registry::{FilterModule, ModuleError};
use uuid::Uuid;

pub const IDENTITY_ID: Uuid = Uuid::from_u128(0xc0a1_9f5e_3b2d_4e71_8a60_1d2c_3b4a_5e01);
pub const DECOUPLER_ID: Uuid = Uuid::from_u128(0xc0a1_9f5e_3b2d_4e71_8a60_1d2c_3b4a_5e02);
pub const SIGNAL_MAPPING_ID: Uuid = Uuid::from_u128(0xc0a1_9f5e_3b2d_4e71_8a60_1d2c_3b4a_5e03);
pub const MASKING_ID: Uuid = Uuid::from_u128(0xc0a1_9f5e_3b2d_4e71_8a60_1d2c_3b4a_5e04);
pub const FEEDBACK_RECEIVER_ID: Uuid = Uuid::from_u128(0xc0a1_9f5e_3b2d_4e71_8a60_1d2c_3b4a_5e05);
pub const FEEDBACK_SENDER_ID: Uuid = Uuid::from_u128(0xc0a1_9f5e_3b2d_4e71_8a60_1d2c_3b4a_5e06);

/// Parameter naming the feedback loop a receiver registers under
pub const FEEDBACK_NAME: &str = "feedback_name";

/// Module providing the built-in filters
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinModule;

impl FilterModule for BuiltinModule {
    fn name(&self) -> &str {
        "builtin"
    }

    fn descriptors(&self) -> Vec<FilterDescriptor> {
        vec![
            FilterDescriptor::new(IDENTITY_ID, "identity").synchronous(),
            FilterDescriptor::new(DECOUPLER_ID, "decoupler"),
            FilterDescriptor::new(SIGNAL_MAPPING_ID, "signal mapping").synchronous(),
            FilterDescriptor::new(MASKING_ID, "masking").synchronous(),
            FilterDescriptor::new(FEEDBACK_RECEIVER_ID, "feedback receiver")
                .synchronous()
                .receives_feedback(),
            FilterDescriptor::new(FEEDBACK_SENDER_ID, "feedback sender").synchronous(),
        ]
    }

    fn create_filter(&self, filter_id: &Uuid) -> Result<Box<dyn Filter>, ModuleError> {
        let filter: Box<dyn Filter> = match *filter_id {
            IDENTITY_ID => Box::new(Identity),
            DECOUPLER_ID => Box::new(Decoupler),
            SIGNAL_MAPPING_ID => Box::new(SignalMapping::default()),
            MASKING_ID => Box::new(Masking::default()),
            FEEDBACK_RECEIVER_ID => Box::new(FeedbackReceiver::default()),
            FEEDBACK_SENDER_ID => Box::new(FeedbackSender::default()),
            _ => return Err(ModuleError::NotImplemented),
        };
        Ok(filter)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Drive a single filter without building a chain

    use crate::filter::{Downstream, EventSink, Filter, FilterOutput, Services};
    use crate::sink::CollectingSink;
    use devflow_core::{DeviceEvent, DevflowResult, FilterLink};
    use std::sync::Arc;

    pub struct Harness {
        pub services: Services,
        pub collector: Arc<CollectingSink>,
        sink: Arc<dyn EventSink>,
        downstream: Downstream,
    }

    impl Harness {
        pub fn new() -> Self {
            let collector = Arc::new(CollectingSink::new());
            let sink: Arc<dyn EventSink> = collector.clone();
            let downstream = Downstream::new("under-test#0", Arc::downgrade(&sink));
            Self {
                services: Services::new(),
                collector,
                sink,
                downstream,
            }
        }

        pub fn configure(&self, filter: &mut dyn Filter, link: &FilterLink) {
            filter.configure(link, &self.services).unwrap();
        }

        pub fn run(&self, filter: &mut dyn Filter, event: DeviceEvent) -> DevflowResult<()> {
            let _keep = &self.sink;
            let output = FilterOutput::new(&self.downstream, &self.services.events);
            filter.execute(event, &output)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_descriptor_can_be_created() {
        let module = BuiltinModule;
        for descriptor in module.descriptors() {
            assert!(module.create_filter(&descriptor.id).is_ok(), "{}", descriptor.name);
        }
        assert!(matches!(
            module.create_filter(&Uuid::from_u128(1)),
            Err(ModuleError::NotImplemented)
        ));
    }

    #[test]
    fn test_decoupler_is_the_only_async_builtin() {
        let asynchronous: Vec<_> = BuiltinModule
            .descriptors()
            .into_iter()
            .filter(|d| d.scheduling == crate::filter::Scheduling::Asynchronous)
            .map(|d| d.name)
            .collect();
        assert_eq!(asynchronous, vec!["decoupler".to_string()]);
    }
}
